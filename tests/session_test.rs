//! Session tests against an in-process mock station
//!
//! The mock answers the handshake, echoes pings, and acknowledges
//! commands, so the full wire path (handshake, dispatch, streams,
//! reconnect) is exercised over real UDP sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use stationlink::network::{
    encrypt_key_block_to, SessionError, SessionEvent, SessionState, StreamCipher, UdpTransport,
};
use stationlink::protocol::{CommandType, Frame, FrameFlags, MediaKind, StreamKind};
use stationlink::{Session, SessionConfig};

struct AutoReplies {
    hello: AtomicBool,
    pong: AtomicBool,
    ack: AtomicBool,
}

/// Fake station: records every inbound frame and auto-replies per flags.
struct MockStation {
    transport: Arc<UdpTransport>,
    received: Arc<Mutex<Vec<Frame>>>,
    client: Arc<Mutex<Option<SocketAddr>>>,
    auto: Arc<AutoReplies>,
    task: JoinHandle<()>,
}

impl MockStation {
    async fn start() -> Self {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let client = Arc::new(Mutex::new(None));
        let auto = Arc::new(AutoReplies {
            hello: AtomicBool::new(true),
            pong: AtomicBool::new(true),
            ack: AtomicBool::new(true),
        });

        let task = {
            let transport = transport.clone();
            let received = received.clone();
            let client = client.clone();
            let auto = auto.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((frame, addr)) = transport.recv_from().await else {
                        continue;
                    };
                    *client.lock() = Some(addr);
                    let reply = match &frame {
                        Frame::Hello { sequence, .. } if auto.hello.load(Ordering::SeqCst) => {
                            Some(Frame::HelloAck {
                                sequence: *sequence,
                            })
                        }
                        Frame::Ping { sequence } if auto.pong.load(Ordering::SeqCst) => {
                            Some(Frame::Pong {
                                sequence: *sequence,
                            })
                        }
                        Frame::Command {
                            sequence,
                            channel,
                            command,
                            ..
                        } if auto.ack.load(Ordering::SeqCst) => Some(Frame::Ack {
                            sequence: *sequence,
                            channel: *channel,
                            command: *command,
                            return_code: 0,
                            flags: FrameFlags::default(),
                            payload: Vec::new(),
                        }),
                        _ => None,
                    };
                    received.lock().push(frame);
                    if let Some(reply) = reply {
                        let _ = transport.send_to(&reply, addr).await;
                    }
                }
            })
        };

        Self {
            transport,
            received,
            client,
            auto,
            task,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    fn received(&self) -> Vec<Frame> {
        self.received.lock().clone()
    }

    async fn send(&self, frame: Frame) {
        let client = (*self.client.lock()).expect("No client seen yet");
        self.transport.send_to(&frame, client).await.unwrap();
    }
}

impl Drop for MockStation {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn test_config(station: SocketAddr) -> SessionConfig {
    SessionConfig {
        address: station,
        local_addr: "127.0.0.1:0".to_string(),
        station_serial: "T8010P1234567890".to_string(),
        account_id: "acct-test".to_string(),
        connect_timeout: Duration::from_secs(2),
        rsa_key_bits: 512,
        ..SessionConfig::default()
    }
}

/// Subscribe a recorder that keeps every emitted event.
fn record_events(session: &Session) -> Arc<Mutex<Vec<SessionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.subscribe(move |event| sink.lock().push(event.clone()));
    events
}

/// Poll until the closure yields, or panic after the timeout.
async fn wait_for<T>(timeout_ms: u64, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            Instant::now() < deadline,
            "Condition not met within {} ms",
            timeout_ms
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connected_session(station: &MockStation) -> Session {
    let session = Session::new(test_config(station.addr())).await.unwrap();
    session.connect().await.expect("Handshake failed");
    session
}

/// Test: Handshake against a responsive station
/// Given a listening station
/// When the session connects
/// Then it reaches Connected and emits the Connected event
#[tokio::test]
async fn test_connect_handshake() {
    let mock = MockStation::start().await;
    let session = Session::new(test_config(mock.addr())).await.unwrap();
    let events = record_events(&session);

    session.connect().await.unwrap();

    assert!(session.is_connected());
    assert_eq!(session.state(), SessionState::Connected);
    assert!(matches!(events.lock()[0], SessionEvent::Connected));
    assert!(
        mock.received()
            .iter()
            .any(|f| matches!(f, Frame::Hello { .. })),
        "Station should have seen the hello"
    );
}

/// Test: Connecting twice fails
#[tokio::test]
async fn test_double_connect_fails() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    let result = session.connect().await;
    assert!(matches!(result, Err(SessionError::AlreadyConnected)));
}

/// Test: Command acknowledgement resolves the handle and emits exactly
/// one result event carrying the caller's metadata
#[tokio::test]
async fn test_command_roundtrip() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    let meta = json!({"request": "set-guard-mode"});
    let handle = session
        .send_command_with_int(CommandType(0x2001), 3, "nick", 1, Some(meta.clone()))
        .await
        .unwrap();

    let response = handle.response.await.expect("Handle should resolve");
    assert_eq!(response.return_code, 0);
    assert_eq!(response.channel, 1);

    let results: Vec<(u8, CommandType, i32, Value)> = events
        .lock()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::CommandResult {
                channel,
                command,
                return_code,
                meta,
            } => Some((*channel, *command, *return_code, meta.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 1, "Exactly one result event");
    assert_eq!(results[0], (1, CommandType(0x2001), 0, meta));
}

/// Test: The command body carries account id, command and channel
#[tokio::test]
async fn test_command_body_contents() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    session
        .send_command_with_string(CommandType(0x2002), "front-door", "", 2, None)
        .await
        .unwrap();

    let payload = wait_for(1000, || {
        mock.received().iter().find_map(|f| match f {
            Frame::Command { payload, .. } => Some(payload.clone()),
            _ => None,
        })
    })
    .await;

    let body: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(body["account_id"], "acct-test");
    assert_eq!(body["cmd"], 0x2002);
    assert_eq!(body["channel"], 2);
    assert_eq!(body["str_value"], "front-door");
}

/// Test: An ack with an unknown sequence emits a sequence error and
/// resolves nothing
#[tokio::test]
async fn test_unmatched_ack_sequence_error() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    mock.send(Frame::Ack {
        sequence: 9999,
        channel: 0,
        command: CommandType(0x2001),
        return_code: 0,
        flags: FrameFlags::default(),
        payload: Vec::new(),
    })
    .await;

    let (received_sequence, serial) = wait_for(1000, || {
        events.lock().iter().find_map(|e| match e {
            SessionEvent::SequenceError {
                received_sequence,
                serial,
                ..
            } => Some((*received_sequence, serial.clone())),
            _ => None,
        })
    })
    .await;
    assert_eq!(received_sequence, 9999);
    assert_eq!(serial, "T8010P1234567890");

    // Connection is unaffected
    assert!(session.is_connected());
}

/// Test: A lock command without a registered key fails before any
/// traffic is sent
#[tokio::test]
async fn test_lock_command_without_key_sends_nothing() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    let result = session
        .send_command_without_data(CommandType::LOCK_STATUS, 0, None)
        .await;
    assert!(matches!(
        result,
        Err(SessionError::MissingLockKey { command }) if command == CommandType::LOCK_STATUS
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !mock
            .received()
            .iter()
            .any(|f| matches!(f, Frame::Command { .. })),
        "No command frame may reach the wire"
    );
}

/// Test: A lock command with a key goes out encrypted and resolves as a
/// secondary command result
#[tokio::test]
async fn test_lock_command_encrypted_on_wire() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    session.set_lock_aes_key(CommandType::LOCK_STATUS, [7u8; 32]);
    let handle = session
        .send_command_without_data(CommandType::LOCK_STATUS, 0, None)
        .await
        .unwrap();
    handle.response.await.unwrap();

    let (flags, payload) = wait_for(1000, || {
        mock.received().iter().find_map(|f| match f {
            Frame::Command { flags, payload, .. } => Some((*flags, payload.clone())),
            _ => None,
        })
    })
    .await;
    assert!(flags.encrypted);
    assert_eq!(payload.len() % 16, 0, "AES-CBC output is block aligned");
    assert!(
        serde_json::from_slice::<Value>(&payload).is_err(),
        "Payload must not be plaintext JSON"
    );

    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, SessionEvent::SecondaryCommandResult { .. })));
    assert!(!events
        .lock()
        .iter()
        .any(|e| matches!(e, SessionEvent::CommandResult { .. })));
}

/// Test: Stream key exchange end to end
/// Given a livestream start carrying the session's public modulus
/// When the station pushes the RSA-encrypted stream key and encrypted
/// media
/// Then metadata produces the started event and media decrypts into the
/// queues
#[tokio::test]
async fn test_stream_key_exchange_and_media() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    session.start_livestream(0, false).await.unwrap();
    let mut queues = session
        .take_stream_media(0, StreamKind::Livestream)
        .expect("Queues yielded once");

    // Station side: read the modulus out of the start command
    let body = wait_for(1000, || {
        mock.received().iter().find_map(|f| match f {
            Frame::Command { payload, .. } => Some(payload.clone()),
            _ => None,
        })
    })
    .await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    let modulus = hex::decode(body["key"].as_str().expect("Modulus embedded")).unwrap();
    let public = rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&modulus),
        rsa::BigUint::from(65537u32),
    )
    .unwrap();

    let mut block = [0u8; 32];
    block[..16].copy_from_slice(b"0123456789abcdef");
    block[16..].copy_from_slice(b"fedcba9876543210");
    let encrypted_key = encrypt_key_block_to(&public, &block).unwrap();
    mock.send(Frame::Command {
        sequence: 0,
        channel: 0,
        command: CommandType::STREAM_KEY,
        flags: FrameFlags::default(),
        payload: serde_json::to_vec(&json!({
            "kind": 1,
            "encrypted_key": hex::encode(&encrypted_key),
        }))
        .unwrap(),
    })
    .await;

    // Metadata (plaintext), then an encrypted video chunk
    mock.send(Frame::Data {
        channel: 0,
        kind: StreamKind::Livestream,
        medium: MediaKind::Metadata,
        flags: FrameFlags::default(),
        frag_index: 0,
        frag_count: 1,
        chunk_sequence: 0,
        payload: serde_json::to_vec(&json!({
            "video_codec": 1, "audio_codec": 2,
            "width": 1920, "height": 1080, "fps": 15,
        }))
        .unwrap(),
    })
    .await;

    wait_for(1000, || {
        events.lock().iter().find_map(|e| match e {
            SessionEvent::LivestreamStarted { channel, metadata } => {
                Some((*channel, metadata.clone()))
            }
            _ => None,
        })
    })
    .await;

    let cipher = StreamCipher::from_key_block(&block).unwrap();
    mock.send(Frame::Data {
        channel: 0,
        kind: StreamKind::Livestream,
        medium: MediaKind::Video,
        flags: FrameFlags {
            encrypted: true,
            end_of_stream: false,
        },
        frag_index: 0,
        frag_count: 1,
        chunk_sequence: 1,
        payload: cipher.encrypt(b"frame data"),
    })
    .await;

    let chunk = tokio::time::timeout(Duration::from_secs(2), queues.video.recv())
        .await
        .expect("Chunk within deadline")
        .expect("Queue open");
    assert_eq!(chunk, b"frame data");
}

/// Test: One stream per (channel, kind); force bypasses the check
#[tokio::test]
async fn test_duplicate_livestream_rejected() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    session.start_livestream(0, false).await.unwrap();
    let result = session.start_livestream(0, false).await;
    assert!(matches!(
        result,
        Err(SessionError::StreamAlreadyRunning { channel: 0, .. })
    ));

    session.start_livestream(0, true).await.unwrap();
    // Other channels are independent
    session.start_livestream(1, false).await.unwrap();
    assert!(session.is_livestreaming(0));
    assert!(session.is_livestreaming(1));
}

/// Test: Talkback requires an active livestream on the channel
#[tokio::test]
async fn test_talkback_preconditions() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    let result = session.start_talkback(0).await;
    assert!(matches!(
        result,
        Err(SessionError::StreamNotRunning {
            channel: 0,
            kind: StreamKind::Livestream
        })
    ));

    session.start_livestream(0, false).await.unwrap();
    session.start_talkback(0).await.unwrap();
    assert!(session.is_talkback_ongoing(0));

    session.send_talkback_audio(0, &[1, 2, 3]).await.unwrap();
    let (kind, medium) = wait_for(1000, || {
        mock.received().iter().find_map(|f| match f {
            Frame::Data { kind, medium, .. } => Some((*kind, *medium)),
            _ => None,
        })
    })
    .await;
    assert_eq!(kind, StreamKind::Talkback);
    assert_eq!(medium, MediaKind::Audio);
}

/// Test: Closing while a stream runs emits the stream's stop event
/// strictly before Closed, and Closed comes last
#[tokio::test]
async fn test_close_stops_streams_in_order() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    session.start_livestream(2, false).await.unwrap();
    session.close().await;

    let events = events.lock();
    let stop_idx = events
        .iter()
        .position(|e| matches!(e, SessionEvent::LivestreamStopped { channel: 2 }))
        .expect("Livestream stop emitted");
    let closed_idx = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Closed))
        .expect("Closed emitted");
    assert!(stop_idx < closed_idx, "Stream stop precedes Closed");
    assert_eq!(closed_idx, events.len() - 1, "Closed is last");

    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.is_livestreaming(2));
}

/// Test: close is idempotent
#[tokio::test]
async fn test_close_twice() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    session.close().await;
    session.close().await;

    let closed = events
        .lock()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Closed))
        .count();
    assert_eq!(closed, 1);
}

/// Test: A remote close schedules a reconnect; a deliberate close
/// cancels it
#[tokio::test]
async fn test_remote_close_schedules_reconnect() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    mock.send(Frame::Bye).await;

    wait_for(1000, || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::Closed))
            .then_some(())
    })
    .await;
    assert!(!session.is_connected());
    assert!(session.has_pending_reconnect());
    assert_eq!(session.reconnect_delay_ms(), 5_000);

    session.close().await;
    assert!(!session.has_pending_reconnect());
    assert_eq!(session.reconnect_delay_ms(), 0);
}

/// Test: Energy-saving stations drop the link on purpose; no reconnect
#[tokio::test]
async fn test_energy_saving_no_reconnect() {
    let mock = MockStation::start().await;
    let config = SessionConfig {
        energy_saving: true,
        ..test_config(mock.addr())
    };
    let session = Session::new(config).await.unwrap();
    session.connect().await.unwrap();
    let events = record_events(&session);

    mock.send(Frame::Bye).await;

    wait_for(1000, || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::Closed))
            .then_some(())
    })
    .await;
    assert!(!session.has_pending_reconnect());
}

/// Test: A silent station trips the idle timeout
#[tokio::test]
async fn test_idle_timeout() {
    let mock = MockStation::start().await;
    let config = SessionConfig {
        heartbeat_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(250),
        ..test_config(mock.addr())
    };
    let session = Session::new(config).await.unwrap();
    session.connect().await.unwrap();
    let events = record_events(&session);

    // Station goes silent: no pongs, no acks
    mock.auto.pong.store(false, Ordering::SeqCst);
    mock.auto.ack.store(false, Ordering::SeqCst);

    wait_for(2000, || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::Timeout))
            .then_some(())
    })
    .await;
    assert!(!session.is_connected());
    assert!(session.has_pending_reconnect());
}

/// Test: The reconnect timer actually fires and re-establishes the
/// connection after the first 5 s delay
#[tokio::test]
async fn test_reconnect_fires_after_delay() {
    let mock = MockStation::start().await;
    let session = Session::new(test_config(mock.addr())).await.unwrap();
    // Subscribe before the first connect so both Connected events land
    let events = record_events(&session);
    session.connect().await.unwrap();

    mock.send(Frame::Bye).await;
    wait_for(1000, || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::Closed))
            .then_some(())
    })
    .await;
    assert!(session.has_pending_reconnect());

    // First ladder step is 5 s
    tokio::time::sleep(Duration::from_millis(5_600)).await;

    assert!(session.is_connected(), "Session reconnected on its own");
    assert_eq!(
        session.reconnect_delay_ms(),
        0,
        "Successful reconnect resets the backoff ladder"
    );
    assert!(events
        .lock()
        .iter()
        .filter(|e| matches!(e, SessionEvent::Connected))
        .count()
        >= 2);
    let hellos = mock
        .received()
        .iter()
        .filter(|f| matches!(f, Frame::Hello { .. }))
        .count();
    assert!(hellos >= 2, "Station saw the second handshake");
}

/// Test: Lock AES keys registered on one connection are gone after the
/// session reconnects; the caller must register fresh keys
#[tokio::test]
async fn test_lock_keys_cleared_after_reconnect() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    session.set_lock_aes_key(CommandType::LOCK_STATUS, [7u8; 32]);
    let handle = session
        .send_command_without_data(CommandType::LOCK_STATUS, 0, None)
        .await
        .unwrap();
    handle.response.await.unwrap();

    mock.send(Frame::Bye).await;
    wait_for(1000, || {
        events
            .lock()
            .iter()
            .any(|e| matches!(e, SessionEvent::Closed))
            .then_some(())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(5_600)).await;
    assert!(session.is_connected(), "Session reconnected on its own");

    let result = session
        .send_command_without_data(CommandType::LOCK_STATUS, 0, None)
        .await;
    assert!(
        matches!(
            result,
            Err(SessionError::MissingLockKey { command }) if command == CommandType::LOCK_STATUS
        ),
        "Keys from the previous connection must not survive"
    );

    session.set_lock_aes_key(CommandType::LOCK_STATUS, [9u8; 32]);
    let handle = session
        .send_command_without_data(CommandType::LOCK_STATUS, 0, None)
        .await
        .unwrap();
    handle.response.await.unwrap();
}

/// Test: Telemetry pushes decode into typed events
#[tokio::test]
async fn test_telemetry_push_decoding() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;
    let events = record_events(&session);

    mock.send(Frame::Command {
        sequence: 0,
        channel: 3,
        command: CommandType::WIFI_RSSI,
        flags: FrameFlags::default(),
        payload: br#"{"rssi": -62}"#.to_vec(),
    })
    .await;

    let (channel, rssi) = wait_for(1000, || {
        events.lock().iter().find_map(|e| match e {
            SessionEvent::WifiRssi { channel, rssi } => Some((*channel, *rssi)),
            _ => None,
        })
    })
    .await;
    assert_eq!(channel, 3);
    assert_eq!(rssi, -62);
}

/// Test: In-flight commands are abandoned on close; the waiting caller
/// observes the dropped sender
#[tokio::test]
async fn test_close_abandons_inflight_commands() {
    let mock = MockStation::start().await;
    let session = connected_session(&mock).await;

    mock.auto.ack.store(false, Ordering::SeqCst);
    let handle = session
        .send_command_without_data(CommandType(0x2003), 0, None)
        .await
        .unwrap();

    session.close().await;
    assert!(
        handle.response.await.is_err(),
        "Abandoned command resolves as cancellation"
    );
}
