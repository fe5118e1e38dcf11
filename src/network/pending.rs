//! Sequence allocation and command/response correlation
//!
//! Every outgoing command consumes one strictly increasing sequence number
//! for the lifetime of the connection. Responses arriving out of order are
//! matched by sequence, never by arrival order. The counter and the
//! in-flight table reset together on reconnect.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::CommandType;

/// A matched device response, delivered through the command's result sink.
#[derive(Debug)]
pub struct CommandResponse {
    pub command: CommandType,
    pub channel: u8,
    pub return_code: i32,
    /// Decrypted response payload (lock sub-protocol), empty otherwise
    pub payload: Vec<u8>,
}

/// Caller-facing handle for one sent command.
///
/// Dropping the handle makes the command fire-and-forget; the sequence
/// number stays consumed either way.
#[derive(Debug)]
pub struct CommandHandle {
    pub sequence: u32,
    pub response: oneshot::Receiver<CommandResponse>,
}

/// One in-flight command awaiting its response frame.
pub struct OutgoingCommand {
    pub sequence: u32,
    pub command: CommandType,
    pub channel: u8,
    /// Opaque caller metadata, relayed verbatim in the result event
    pub meta: Value,
    pub sink: oneshot::Sender<CommandResponse>,
    pub enqueued_at: Instant,
}

/// Per-connection sequence counter plus the in-flight command table.
pub struct PendingCommands {
    next_sequence: u32,
    inflight: HashMap<u32, OutgoingCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self {
            next_sequence: 0,
            inflight: HashMap::new(),
        }
    }

    /// Allocate the next sequence number (strictly increasing within one
    /// connection).
    pub fn allocate(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Register an in-flight command under its sequence number.
    pub fn register(&mut self, command: OutgoingCommand) {
        self.inflight.insert(command.sequence, command);
    }

    /// Remove a registered command without resolving it (send failure).
    pub fn withdraw(&mut self, sequence: u32) -> Option<OutgoingCommand> {
        self.inflight.remove(&sequence)
    }

    /// Match a response frame to its command. Returns `None` for an
    /// unknown sequence number (mismatch).
    pub fn resolve(&mut self, sequence: u32) -> Option<OutgoingCommand> {
        self.inflight.remove(&sequence)
    }

    /// Abandon all in-flight commands without invoking their sinks
    /// (the dropped senders signal cancellation to waiting callers).
    pub fn abandon_all(&mut self) -> usize {
        let count = self.inflight.len();
        self.inflight.clear();
        count
    }

    /// Reset for a fresh connection: abandon everything, restart the
    /// counter.
    pub fn reset(&mut self) {
        self.abandon_all();
        self.next_sequence = 0;
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(sequence: u32) -> (OutgoingCommand, oneshot::Receiver<CommandResponse>) {
        let (sink, rx) = oneshot::channel();
        (
            OutgoingCommand {
                sequence,
                command: CommandType(0x1001),
                channel: 0,
                meta: Value::Null,
                sink,
                enqueued_at: Instant::now(),
            },
            rx,
        )
    }

    #[test]
    fn test_sequences_strictly_increasing() {
        let mut pending = PendingCommands::new();
        let a = pending.allocate();
        let b = pending.allocate();
        let c = pending.allocate();
        assert!(a < b && b < c);
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[test]
    fn test_reset_restarts_counter() {
        let mut pending = PendingCommands::new();
        pending.allocate();
        pending.allocate();
        pending.reset();
        assert_eq!(pending.allocate(), 0);
    }

    #[test]
    fn test_resolve_matches_by_sequence() {
        let mut pending = PendingCommands::new();
        let seq = pending.allocate();
        let (cmd, _rx) = outgoing(seq);
        pending.register(cmd);

        assert!(pending.resolve(seq + 1).is_none(), "Mismatch must not resolve");
        assert_eq!(pending.in_flight(), 1);

        let resolved = pending.resolve(seq).expect("Matching sequence resolves");
        assert_eq!(resolved.sequence, seq);
        assert_eq!(pending.in_flight(), 0);
    }

    #[test]
    fn test_abandon_drops_sinks_uninvoked() {
        let mut pending = PendingCommands::new();
        let seq = pending.allocate();
        let (cmd, mut rx) = outgoing(seq);
        pending.register(cmd);

        assert_eq!(pending.abandon_all(), 1);
        // Sender dropped without sending: receiver observes cancellation
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_delivers_response() {
        let mut pending = PendingCommands::new();
        let seq = pending.allocate();
        let (cmd, rx) = outgoing(seq);
        pending.register(cmd);

        let resolved = pending.resolve(seq).unwrap();
        resolved
            .sink
            .send(CommandResponse {
                command: resolved.command,
                channel: resolved.channel,
                return_code: 0,
                payload: Vec::new(),
            })
            .unwrap();

        let response = rx.await.unwrap();
        assert_eq!(response.return_code, 0);
    }
}
