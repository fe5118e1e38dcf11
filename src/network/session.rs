//! Station session: connection lifecycle, command dispatch, streams
//!
//! One `Session` owns one UDP conversation with one station. A background
//! read loop decodes inbound frames and drives response correlation,
//! stream ingestion, and event emission; a heartbeat loop keeps the
//! connection alive and detects silent stations. Lost connections
//! reschedule themselves on the backoff ladder unless the session was
//! closed deliberately or the station is an energy-saving device.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::protocol::telemetry::StreamKeyPayload;
use crate::protocol::{CommandType, Frame, FrameFlags, MediaKind, P2pCommand, StreamKind};
use crate::station::CloudApi;

use super::crypto::SessionCrypto;
use super::error::SessionError;
use super::event::{EventBus, ListenerId, SessionEvent};
use super::pending::{CommandHandle, CommandResponse, OutgoingCommand, PendingCommands};
use super::reconnect::ReconnectState;
use super::stream::{fragment_media, IngestOutcome, MediaQueues, StreamRegistry, StreamSession};
use super::transport::UdpTransport;

/// How the session reaches the station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    /// Try every known route, keep whichever answers first
    Quickest = 1,
    /// LAN addresses only
    LocalOnly = 2,
}

impl ConnectionType {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionType::LocalOnly,
            _ => ConnectionType::Quickest,
        }
    }
}

/// Connection state, observable at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closing,
            _ => SessionState::Disconnected,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Station address
    pub address: SocketAddr,
    /// Local bind address ("0.0.0.0:0" picks an ephemeral port)
    pub local_addr: String,
    pub station_serial: String,
    pub account_id: String,
    pub connection_type: ConnectionType,
    /// Energy-saving stations drop the link on purpose; never reconnect
    pub energy_saving: bool,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    /// Stream keypair size. Tests shrink this; production keeps 2048.
    pub rsa_key_bits: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            local_addr: "0.0.0.0:0".to_string(),
            station_serial: String::new(),
            account_id: String::new(),
            connection_type: ConnectionType::Quickest,
            energy_saving: false,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            rsa_key_bits: 2048,
        }
    }
}

enum DisconnectCause {
    RemoteClose,
    IdleTimeout,
}

#[derive(Default)]
struct Loops {
    read: Option<JoinHandle<()>>,
    receive: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// State shared between the public handle and the background loops
struct Shared {
    config: SessionConfig,
    transport: Arc<UdpTransport>,
    state: AtomicU8,
    terminating: AtomicBool,
    connection_type: AtomicU8,
    lock_sequence: AtomicU32,
    ping_sequence: AtomicU32,
    pending: Mutex<PendingCommands>,
    crypto: Mutex<SessionCrypto>,
    streams: Mutex<StreamRegistry>,
    events: EventBus,
    reconnect: Mutex<ReconnectState>,
    last_received: Mutex<Instant>,
    handshake: Mutex<Option<oneshot::Sender<()>>>,
    loops: Mutex<Loops>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn emit(&self, event: &SessionEvent) {
        self.events.emit(event);
    }

    async fn connect(self: Arc<Self>) -> Result<(), SessionError> {
        if self.terminating.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        match self.state() {
            SessionState::Disconnected => {}
            SessionState::Connected | SessionState::Connecting => {
                return Err(SessionError::AlreadyConnected)
            }
            SessionState::Closing => return Err(SessionError::Terminated),
        }

        // Abort a scheduled timer; the ladder only resets on success
        self.reconnect.lock().clear_timer();
        self.set_state(SessionState::Connecting);

        // Fresh correlation state and key material per connection
        self.pending.lock().reset();
        self.lock_sequence.store(0, Ordering::SeqCst);
        self.crypto.lock().reset_for_reconnect();

        self.clone().ensure_read_loop();

        let (tx, rx) = oneshot::channel();
        *self.handshake.lock() = Some(tx);

        let sequence = self.pending.lock().allocate();
        let hello = Frame::Hello {
            sequence,
            connection_type: self.connection_type.load(Ordering::SeqCst),
        };
        info!(
            "Connecting to station {} at {}",
            self.config.station_serial, self.config.address
        );
        if let Err(e) = self.transport.send_to(&hello, self.config.address).await {
            self.handshake.lock().take();
            self.set_state(SessionState::Disconnected);
            self.emit(&SessionEvent::Timeout);
            self.clone().schedule_reconnect();
            return Err(e);
        }

        match timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(())) => {
                *self.last_received.lock() = Instant::now();
                self.set_state(SessionState::Connected);
                self.reconnect.lock().cancel();
                self.clone().start_heartbeat_loop();
                info!("Connected to station {}", self.config.station_serial);
                self.emit(&SessionEvent::Connected);
                Ok(())
            }
            _ => {
                self.handshake.lock().take();
                self.set_state(SessionState::Disconnected);
                if self.terminating.load(Ordering::SeqCst) {
                    return Err(SessionError::Terminated);
                }
                warn!(
                    "Handshake with station {} timed out",
                    self.config.station_serial
                );
                self.emit(&SessionEvent::Timeout);
                self.clone().schedule_reconnect();
                Err(SessionError::ConnectionTimeout)
            }
        }
    }

    fn ensure_read_loop(self: Arc<Self>) {
        let mut loops = self.loops.lock();
        if loops.read.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let (mut rx, receive) = self.transport.clone().start_receive_loop();
        loops.receive = Some(receive);

        let shared = self.clone();
        loops.read = Some(tokio::spawn(async move {
            while let Some((frame, addr)) = rx.recv().await {
                if addr != shared.config.address {
                    trace!("Frame from unexpected peer {}, dropped", addr);
                    continue;
                }
                *shared.last_received.lock() = Instant::now();
                shared.handle_frame(frame).await;
            }
            debug!("Read loop for {} finished", shared.config.station_serial);
        }));
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::HelloAck { .. } => {
                if let Some(tx) = self.handshake.lock().take() {
                    let _ = tx.send(());
                } else {
                    trace!("Unsolicited hello-ack, dropped");
                }
            }
            Frame::Ping { sequence } => {
                let pong = Frame::Pong { sequence };
                if let Err(e) = self.transport.send_to(&pong, self.config.address).await {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            Frame::Pong { .. } => {}
            Frame::Bye => {
                info!("Station {} closed the connection", self.config.station_serial);
                self.handle_disconnect(DisconnectCause::RemoteClose);
            }
            Frame::Ack {
                sequence,
                channel,
                command,
                return_code,
                flags,
                payload,
            } => {
                self.handle_ack(sequence, channel, command, return_code, flags, payload);
            }
            Frame::Command {
                channel,
                command,
                payload,
                ..
            } => {
                self.handle_push(channel, command, payload);
            }
            Frame::Data {
                channel,
                kind,
                medium,
                flags,
                frag_index,
                frag_count,
                chunk_sequence,
                payload,
            } => {
                self.handle_data(
                    channel,
                    kind,
                    medium,
                    flags,
                    frag_index,
                    frag_count,
                    chunk_sequence,
                    payload,
                );
            }
            Frame::Hello { .. } => {
                // We are the client side; stations never initiate
                debug!("Unexpected hello from station, dropped");
            }
        }
    }

    fn handle_ack(
        self: &Arc<Self>,
        sequence: u32,
        channel: u8,
        command: CommandType,
        return_code: i32,
        flags: FrameFlags,
        payload: Vec<u8>,
    ) {
        let resolved = self.pending.lock().resolve(sequence);
        let Some(outgoing) = resolved else {
            warn!(
                "Sequence mismatch: ack {} for {} on channel {} matches no in-flight command",
                sequence, command, channel
            );
            self.emit(&SessionEvent::SequenceError {
                channel,
                command,
                received_sequence: sequence,
                serial: self.config.station_serial.clone(),
            });
            return;
        };

        trace!(
            "Command {} (seq {}) acknowledged after {:?}, rc={}",
            command,
            sequence,
            outgoing.enqueued_at.elapsed(),
            return_code
        );

        let mut payload = payload;
        if command.is_lock_command() {
            if flags.encrypted && !payload.is_empty() {
                match self.crypto.lock().decrypt_lock_payload(
                    command,
                    &self.config.station_serial,
                    &payload,
                ) {
                    Ok(plaintext) => payload = plaintext,
                    Err(e) => {
                        warn!("Lock response for {} undecryptable: {}", command, e);
                        payload = Vec::new();
                    }
                }
            }
            self.emit(&SessionEvent::SecondaryCommandResult {
                channel,
                command,
                return_code,
                meta: outgoing.meta.clone(),
            });
        } else {
            self.emit(&SessionEvent::CommandResult {
                channel,
                command,
                return_code,
                meta: outgoing.meta.clone(),
            });
        }

        // Receiver may have been dropped (fire-and-forget)
        let _ = outgoing.sink.send(CommandResponse {
            command,
            channel,
            return_code,
            payload,
        });
    }

    fn handle_push(self: &Arc<Self>, channel: u8, command: CommandType, payload: Vec<u8>) {
        if command == CommandType::STREAM_KEY {
            self.handle_stream_key(channel, &payload);
            return;
        }
        match SessionEvent::from_push(channel, command, &payload) {
            Some(event) => self.emit(&event),
            None => debug!("Unhandled push {} on channel {}, dropped", command, channel),
        }
    }

    fn handle_stream_key(self: &Arc<Self>, channel: u8, payload: &[u8]) {
        let parsed: StreamKeyPayload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("Malformed stream key push: {}", e);
                return;
            }
        };
        let Ok(kind) = StreamKind::try_from(parsed.kind) else {
            debug!("Stream key push for unknown kind {}", parsed.kind);
            return;
        };
        let encrypted = match hex::decode(&parsed.encrypted_key) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Stream key push with bad hex: {}", e);
                return;
            }
        };

        // Recording keys are encrypted to the cloud-supplied download key
        // when one is set; everything else uses the session keypair.
        let cipher = {
            let mut crypto = self.crypto.lock();
            if kind == StreamKind::Download && crypto.download_key().is_some() {
                crypto.decrypt_recording_key(&encrypted)
            } else {
                crypto.decrypt_stream_key(&encrypted)
            }
        };
        match cipher {
            Ok(cipher) => {
                if !self.streams.lock().set_cipher(channel, kind, cipher) {
                    debug!(
                        "Stream key for inactive stream channel={} kind={:?}",
                        channel, kind
                    );
                }
            }
            Err(e) => warn!(
                "Stream key for channel {} ({:?}) undecryptable: {}",
                channel, kind, e
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_data(
        self: &Arc<Self>,
        channel: u8,
        kind: StreamKind,
        medium: MediaKind,
        flags: FrameFlags,
        frag_index: u16,
        frag_count: u16,
        chunk_sequence: u32,
        payload: Vec<u8>,
    ) {
        let outcome = self.streams.lock().ingest(
            channel,
            kind,
            medium,
            flags,
            frag_index,
            frag_count,
            chunk_sequence,
            payload,
        );
        match outcome {
            Ok(IngestOutcome::Delivered | IngestOutcome::Ignored) => {}
            Ok(IngestOutcome::MetadataReady(metadata)) => match kind {
                StreamKind::Livestream => {
                    self.emit(&SessionEvent::LivestreamStarted { channel, metadata })
                }
                StreamKind::Download => {
                    self.emit(&SessionEvent::DownloadStarted { channel, metadata })
                }
                StreamKind::Rtsp | StreamKind::Talkback => {}
            },
            Ok(IngestOutcome::StreamEnd) => {
                self.streams.lock().stop(channel, kind);
                let event = match kind {
                    StreamKind::Livestream => SessionEvent::LivestreamStopped { channel },
                    StreamKind::Download => SessionEvent::DownloadFinished { channel },
                    StreamKind::Rtsp => SessionEvent::RtspLivestreamStopped { channel },
                    StreamKind::Talkback => SessionEvent::TalkbackStopped { channel },
                };
                self.emit(&event);
            }
            Err(e) => {
                // Only this stream dies; the connection stays up
                warn!("Stream channel={} kind={:?} failed: {}", channel, kind, e);
                self.streams.lock().stop(channel, kind);
                let reason = e.to_string();
                let event = match kind {
                    StreamKind::Livestream => SessionEvent::LivestreamError { channel, reason },
                    StreamKind::Download => SessionEvent::DownloadError { channel, reason },
                    StreamKind::Talkback => SessionEvent::TalkbackError { channel, reason },
                    StreamKind::Rtsp => SessionEvent::RtspLivestreamStopped { channel },
                };
                self.emit(&event);
            }
        }
    }

    /// Tear down after an unexpected loss of the connection. Stream stop
    /// events precede the lifecycle event; a reconnect is scheduled unless
    /// the session is closing or the station sleeps on purpose.
    fn handle_disconnect(self: &Arc<Self>, cause: DisconnectCause) {
        match self.state() {
            SessionState::Connected | SessionState::Connecting => {}
            _ => return,
        }
        self.set_state(SessionState::Disconnected);
        self.handshake.lock().take();
        self.teardown_streams();

        let abandoned = self.pending.lock().abandon_all();
        if abandoned > 0 {
            debug!("Abandoned {} in-flight commands", abandoned);
        }

        self.clone().schedule_reconnect();
        match cause {
            DisconnectCause::RemoteClose => self.emit(&SessionEvent::Closed),
            DisconnectCause::IdleTimeout => self.emit(&SessionEvent::Timeout),
        }
    }

    /// Emit a stop or error event for every active stream, then drop them.
    fn teardown_streams(&self) {
        let drained: Vec<StreamSession> = self.streams.lock().drain();
        for stream in drained {
            let channel = stream.channel;
            let event = match stream.kind {
                StreamKind::Livestream => SessionEvent::LivestreamStopped { channel },
                StreamKind::Download => SessionEvent::DownloadError {
                    channel,
                    reason: "Session closed".to_string(),
                },
                StreamKind::Rtsp => SessionEvent::RtspLivestreamStopped { channel },
                StreamKind::Talkback => SessionEvent::TalkbackStopped { channel },
            };
            self.emit(&event);
        }
    }

    fn schedule_reconnect(self: Arc<Self>) {
        if self.terminating.load(Ordering::SeqCst) {
            return;
        }
        if self.config.energy_saving {
            debug!(
                "Station {} is energy-saving, not reconnecting",
                self.config.station_serial
            );
            return;
        }
        let mut reconnect = self.reconnect.lock();
        if reconnect.scheduled() {
            return;
        }
        let delay = reconnect.policy.next_delay();
        info!(
            "Reconnecting to station {} in {:?}",
            self.config.station_serial, delay
        );
        let shared = self.clone();
        reconnect.set_timer(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.reconnect.lock().consume_timer();
            if shared.terminating.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = shared.clone().connect().await {
                warn!("Reconnect attempt failed: {}", e);
            }
        }));
    }

    fn start_heartbeat_loop(self: Arc<Self>) {
        let mut loops = self.loops.lock();
        if loops.heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = self.clone();
        loops.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.state() != SessionState::Connected {
                    break;
                }
                let idle = shared.last_received.lock().elapsed();
                if idle > shared.config.idle_timeout {
                    warn!(
                        "No traffic from station {} for {:?}",
                        shared.config.station_serial, idle
                    );
                    shared.handle_disconnect(DisconnectCause::IdleTimeout);
                    break;
                }
                let sequence = shared.ping_sequence.fetch_add(1, Ordering::Relaxed);
                let ping = Frame::Ping { sequence };
                if let Err(e) = shared.transport.send_to(&ping, shared.config.address).await {
                    warn!("Heartbeat send failed: {}", e);
                    shared.handle_disconnect(DisconnectCause::RemoteClose);
                    break;
                }
            }
        }));
    }

    fn abort_loops(&self) {
        let mut loops = self.loops.lock();
        for handle in [
            loops.heartbeat.take(),
            loops.read.take(),
            loops.receive.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// A P2P session with one station
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Bind the local socket and prepare a session. No traffic is sent
    /// until [`connect`](Self::connect).
    pub async fn new(config: SessionConfig) -> Result<Self, SessionError> {
        let transport = Arc::new(UdpTransport::bind(&config.local_addr).await?);
        let connection_type = config.connection_type as u8;
        let rsa_key_bits = config.rsa_key_bits;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                state: AtomicU8::new(SessionState::Disconnected as u8),
                terminating: AtomicBool::new(false),
                connection_type: AtomicU8::new(connection_type),
                lock_sequence: AtomicU32::new(0),
                ping_sequence: AtomicU32::new(0),
                pending: Mutex::new(PendingCommands::new()),
                crypto: Mutex::new(SessionCrypto::with_key_bits(rsa_key_bits)),
                streams: Mutex::new(StreamRegistry::new()),
                events: EventBus::new(),
                reconnect: Mutex::new(ReconnectState::new()),
                last_received: Mutex::new(Instant::now()),
                handshake: Mutex::new(None),
                loops: Mutex::new(Loops::default()),
            }),
        })
    }

    /// Perform the handshake. On failure the reconnect ladder starts;
    /// on success it resets.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.shared.clone().connect().await
    }

    /// Deliberate teardown: cancels any reconnect, stops all streams
    /// (emitting their stop events first), abandons in-flight commands,
    /// tells the station goodbye, and emits `Closed` last. Idempotent.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.reconnect.lock().cancel();
        shared.handshake.lock().take();

        let was_up = matches!(
            shared.state(),
            SessionState::Connected | SessionState::Connecting
        );
        shared.set_state(SessionState::Closing);

        shared.teardown_streams();
        let abandoned = shared.pending.lock().abandon_all();
        if abandoned > 0 {
            debug!("Abandoned {} in-flight commands on close", abandoned);
        }

        if was_up {
            // Best effort; the station also detects silence
            let _ = shared.transport.send_to(&Frame::Bye, shared.config.address).await;
        }

        shared.abort_loops();
        shared.set_state(SessionState::Disconnected);
        info!("Session with station {} closed", shared.config.station_serial);
        shared.emit(&SessionEvent::Closed);
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.state() == SessionState::Connecting
    }

    pub fn is_energy_saving_device(&self) -> bool {
        self.shared.config.energy_saving
    }

    pub fn station_serial(&self) -> &str {
        &self.shared.config.station_serial
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.transport.local_addr()
    }

    pub fn connection_type(&self) -> ConnectionType {
        ConnectionType::from_u8(self.shared.connection_type.load(Ordering::SeqCst))
    }

    /// Change the route preference for the next connect.
    pub fn set_connection_type(&self, connection_type: ConnectionType) {
        self.shared
            .connection_type
            .store(connection_type as u8, Ordering::SeqCst);
    }

    /// Whether a reconnect timer is currently armed.
    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.reconnect.lock().scheduled()
    }

    /// Current position on the reconnect delay ladder, in milliseconds.
    pub fn reconnect_delay_ms(&self) -> u64 {
        self.shared.reconnect.lock().policy.current_delay_ms()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Send a fully-formed command. Lock commands are encrypted before
    /// anything touches the socket; a missing lock key fails the call
    /// with no traffic sent. The returned handle resolves when the
    /// station acknowledges; dropping it makes the send fire-and-forget.
    pub async fn send_command(
        &self,
        command: P2pCommand,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        let shared = &self.shared;
        if shared.terminating.load(Ordering::SeqCst) {
            return Err(SessionError::Terminated);
        }
        if shared.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }

        let (payload, flags) = if command.command.is_lock_command() {
            let crypto = shared.crypto.lock();
            if !crypto.has_lock_key(command.command) {
                return Err(SessionError::MissingLockKey {
                    command: command.command,
                });
            }
            let body = command.serialize_body(&shared.config.account_id, None)?;
            let encrypted = crypto.encrypt_lock_payload(
                command.command,
                &shared.config.station_serial,
                &body,
            )?;
            (
                encrypted,
                FrameFlags {
                    encrypted: true,
                    end_of_stream: false,
                },
            )
        } else {
            let modulus = if command.command.requests_stream_key() {
                Some(shared.crypto.lock().stream_public_modulus_hex()?)
            } else {
                None
            };
            let body = command.serialize_body(&shared.config.account_id, modulus.as_deref())?;
            (body, FrameFlags::default())
        };

        let (sink, response) = oneshot::channel();
        let sequence = {
            let mut pending = shared.pending.lock();
            let sequence = pending.allocate();
            pending.register(OutgoingCommand {
                sequence,
                command: command.command,
                channel: command.channel,
                meta: meta.unwrap_or(Value::Null),
                sink,
                enqueued_at: Instant::now(),
            });
            sequence
        };

        let frame = Frame::Command {
            sequence,
            channel: command.channel,
            command: command.command,
            flags,
            payload,
        };
        trace!(
            "Sending {} (seq {}) to channel {}",
            command.command,
            sequence,
            command.channel
        );
        if let Err(e) = shared.transport.send_to(&frame, shared.config.address).await {
            shared.pending.lock().withdraw(sequence);
            return Err(e);
        }
        Ok(CommandHandle { sequence, response })
    }

    pub async fn send_command_without_data(
        &self,
        command: CommandType,
        channel: u8,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        self.send_command(P2pCommand::without_data(command, channel), meta)
            .await
    }

    pub async fn send_command_with_int(
        &self,
        command: CommandType,
        value: i32,
        str_value: &str,
        channel: u8,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        self.send_command(P2pCommand::with_int(command, value, str_value, channel), meta)
            .await
    }

    pub async fn send_command_with_int_string(
        &self,
        command: CommandType,
        value: i32,
        value_sub: i32,
        str_value: &str,
        channel: u8,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        self.send_command(
            P2pCommand::with_int_string(command, value, value_sub, str_value, channel),
            meta,
        )
        .await
    }

    pub async fn send_command_with_string(
        &self,
        command: CommandType,
        str_value: &str,
        str_value_sub: &str,
        channel: u8,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        self.send_command(
            P2pCommand::with_string(command, str_value, str_value_sub, channel),
            meta,
        )
        .await
    }

    pub async fn send_command_with_string_payload(
        &self,
        command: CommandType,
        payload: Value,
        channel: u8,
        meta: Option<Value>,
    ) -> Result<CommandHandle, SessionError> {
        self.send_command(P2pCommand::with_string_payload(command, payload, channel), meta)
            .await
    }

    // ---- streams -------------------------------------------------------

    pub async fn start_livestream(
        &self,
        channel: u8,
        force: bool,
    ) -> Result<CommandHandle, SessionError> {
        self.start_stream(
            channel,
            StreamKind::Livestream,
            force,
            P2pCommand::without_data(CommandType::START_LIVESTREAM, channel),
        )
        .await
    }

    pub async fn stop_livestream(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        let talkback = {
            let mut streams = self.shared.streams.lock();
            if streams.stop(channel, StreamKind::Livestream).is_none() {
                return Err(SessionError::StreamNotRunning {
                    channel,
                    kind: StreamKind::Livestream,
                });
            }
            // Talkback rides on the livestream; it cannot outlive it
            streams.stop(channel, StreamKind::Talkback).is_some()
        };
        if talkback {
            self.shared.emit(&SessionEvent::TalkbackStopped { channel });
        }
        self.shared.emit(&SessionEvent::LivestreamStopped { channel });
        self.send_command_without_data(CommandType::STOP_LIVESTREAM, channel, None)
            .await
    }

    pub async fn start_download(
        &self,
        channel: u8,
        remote_path: &str,
        force: bool,
    ) -> Result<CommandHandle, SessionError> {
        self.start_stream(
            channel,
            StreamKind::Download,
            force,
            P2pCommand::with_string(CommandType::START_DOWNLOAD, remote_path, "", channel),
        )
        .await
    }

    /// Cancel a running download. The partial data already queued stays
    /// readable; the device stops sending.
    pub async fn cancel_download(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        if self
            .shared
            .streams
            .lock()
            .stop(channel, StreamKind::Download)
            .is_none()
        {
            return Err(SessionError::StreamNotRunning {
                channel,
                kind: StreamKind::Download,
            });
        }
        self.shared.emit(&SessionEvent::DownloadFinished { channel });
        self.send_command_without_data(CommandType::STOP_DOWNLOAD, channel, None)
            .await
    }

    pub async fn start_rtsp_livestream(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        let handle = self
            .start_stream(
                channel,
                StreamKind::Rtsp,
                false,
                P2pCommand::without_data(CommandType::START_RTSP, channel),
            )
            .await?;
        // RTSP has no metadata frame; started is acknowledged locally
        self.shared
            .emit(&SessionEvent::RtspLivestreamStarted { channel });
        Ok(handle)
    }

    pub async fn stop_rtsp_livestream(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        if self
            .shared
            .streams
            .lock()
            .stop(channel, StreamKind::Rtsp)
            .is_none()
        {
            return Err(SessionError::StreamNotRunning {
                channel,
                kind: StreamKind::Rtsp,
            });
        }
        self.shared
            .emit(&SessionEvent::RtspLivestreamStopped { channel });
        self.send_command_without_data(CommandType::STOP_RTSP, channel, None)
            .await
    }

    /// Start talkback on a channel. Requires an active livestream there.
    pub async fn start_talkback(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        let handle = self
            .start_stream(
                channel,
                StreamKind::Talkback,
                false,
                P2pCommand::without_data(CommandType::START_TALKBACK, channel),
            )
            .await?;
        self.shared.emit(&SessionEvent::TalkbackStarted { channel });
        Ok(handle)
    }

    pub async fn stop_talkback(&self, channel: u8) -> Result<CommandHandle, SessionError> {
        let chunk = self
            .shared
            .streams
            .lock()
            .next_outbound_chunk(channel, StreamKind::Talkback)
            .ok_or(SessionError::StreamNotRunning {
                channel,
                kind: StreamKind::Talkback,
            })?;

        // Flush an empty end-of-stream frame so the device flushes its
        // jitter buffer before the stop command lands
        for frame in fragment_media(
            channel,
            StreamKind::Talkback,
            MediaKind::Audio,
            chunk,
            &[],
            true,
        )? {
            self.shared
                .transport
                .send_to(&frame, self.shared.config.address)
                .await?;
        }

        self.shared.streams.lock().stop(channel, StreamKind::Talkback);
        self.shared.emit(&SessionEvent::TalkbackStopped { channel });
        self.send_command_without_data(CommandType::STOP_TALKBACK, channel, None)
            .await
    }

    /// Send one talkback audio buffer, fragmented to fit the MTU.
    pub async fn send_talkback_audio(
        &self,
        channel: u8,
        data: &[u8],
    ) -> Result<(), SessionError> {
        if self.shared.state() != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let chunk = self
            .shared
            .streams
            .lock()
            .next_outbound_chunk(channel, StreamKind::Talkback)
            .ok_or(SessionError::StreamNotRunning {
                channel,
                kind: StreamKind::Talkback,
            })?;
        for frame in fragment_media(
            channel,
            StreamKind::Talkback,
            MediaKind::Audio,
            chunk,
            data,
            false,
        )? {
            self.shared
                .transport
                .send_to(&frame, self.shared.config.address)
                .await?;
        }
        Ok(())
    }

    async fn start_stream(
        &self,
        channel: u8,
        kind: StreamKind,
        force: bool,
        command: P2pCommand,
    ) -> Result<CommandHandle, SessionError> {
        // Registered before the send so an early data frame finds its queue
        self.shared.streams.lock().start(channel, kind, force)?;
        match self.send_command(command, None).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shared.streams.lock().stop(channel, kind);
                Err(e)
            }
        }
    }

    pub fn is_livestreaming(&self, channel: u8) -> bool {
        self.shared
            .streams
            .lock()
            .is_active(channel, StreamKind::Livestream)
    }

    pub fn is_downloading(&self, channel: u8) -> bool {
        self.shared
            .streams
            .lock()
            .is_active(channel, StreamKind::Download)
    }

    pub fn is_rtsp_livestreaming(&self, channel: u8) -> bool {
        self.shared.streams.lock().is_active(channel, StreamKind::Rtsp)
    }

    pub fn is_talkback_ongoing(&self, channel: u8) -> bool {
        self.shared
            .streams
            .lock()
            .is_active(channel, StreamKind::Talkback)
    }

    /// Take the consumer ends of a stream's media queues. Yields once per
    /// stream start; later calls return `None`.
    pub fn take_stream_media(&self, channel: u8, kind: StreamKind) -> Option<MediaQueues> {
        self.shared.streams.lock().take_media(channel, kind)
    }

    // ---- crypto --------------------------------------------------------

    /// The session's stream RSA private key (generated on first use,
    /// rotated every reconnect).
    pub fn rsa_private_key(&self) -> Result<RsaPrivateKey, SessionError> {
        self.shared.crypto.lock().rsa_private_key()
    }

    pub fn download_rsa_private_key(&self) -> Option<RsaPrivateKey> {
        self.shared.crypto.lock().download_key()
    }

    pub fn set_download_rsa_private_key_pem(&self, pem: &str) -> Result<(), SessionError> {
        self.shared.crypto.lock().set_download_key_pem(pem)
    }

    /// Fetch the recording cipher through the cloud collaborator and
    /// install it as the download key.
    pub async fn load_download_key(
        &self,
        cloud: &dyn CloudApi,
        cipher_id: u32,
    ) -> Result<(), SessionError> {
        let pem = cloud
            .cipher(cipher_id, &self.shared.config.account_id)
            .await?;
        self.set_download_rsa_private_key_pem(&pem)
    }

    /// Register the AES key for one lock command type. Must precede the
    /// first send of that type.
    pub fn set_lock_aes_key(&self, command: CommandType, key: [u8; 32]) {
        self.shared.crypto.lock().set_lock_key(command, key);
    }

    /// Advance and return the lock sub-protocol sequence number. Resets
    /// with each connection.
    pub fn inc_lock_sequence_number(&self) -> u32 {
        self.shared.lock_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminating.store(true, Ordering::SeqCst);
        self.shared.reconnect.lock().cancel();
        self.shared.abort_loops();
    }
}
