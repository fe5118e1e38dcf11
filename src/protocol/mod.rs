//! Station P2P protocol definitions
//!
//! Wire frames, command types and send shapes, and typed telemetry
//! payloads.

mod command;
mod frame;
pub mod telemetry;

pub use command::{CommandPayload, CommandType, P2pCommand, LOCK_COMMAND_RANGE};
pub use frame::{
    Frame, FrameFlags, FrameType, MediaKind, StreamKind, DATA_HEADER_SIZE, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
