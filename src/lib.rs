//! stationlink - P2P client for security camera stations
//!
//! This library implements the binary UDP protocol spoken by camera
//! hubs: connection lifecycle with automatic reconnect, sequence-based
//! command dispatch, encrypted media streams, and typed device events.

pub mod network;
pub mod protocol;
pub mod station;

pub use network::{Session, SessionConfig, SessionEvent};
pub use protocol::{CommandType, P2pCommand};
pub use station::{CloudApi, StationInfo};
