//! Session error types

use thiserror::Error;

use crate::protocol::{CommandType, StreamKind};

/// Errors that can occur in the P2P session layer
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection reset by station")]
    ConnectionReset,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Session terminated")]
    Terminated,

    #[error("Stream already running on channel {channel} ({kind:?})")]
    StreamAlreadyRunning { channel: u8, kind: StreamKind },

    #[error("No running stream on channel {channel} ({kind:?})")]
    StreamNotRunning { channel: u8, kind: StreamKind },

    #[error("No AES key registered for lock command {command}")]
    MissingLockKey { command: CommandType },

    #[error("Media buffer of {size} bytes exceeds the fragment limit")]
    MediaTooLarge { size: usize },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid frame")]
    InvalidFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
