//! Typed payloads for device-initiated pushes
//!
//! The station relays device telemetry and database query results as
//! Command frames with JSON bodies. The structs here give each known push
//! a concrete shape; unknown pushes are dropped by the session with a
//! debug log.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RSA-encrypted stream key material pushed by the device after a
/// stream-start command embedded our public modulus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamKeyPayload {
    /// Stream kind code (see `frame::StreamKind`)
    pub kind: u8,
    /// Hex-encoded, RSA-encrypted 32-byte block (AES-128 key + IV)
    pub encrypted_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmModePayload {
    pub mode: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDelayPayload {
    pub alarm_delay_type: u8,
    pub alarm_delay: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEventPayload {
    pub alarm_event: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatePayload {
    pub battery_level: u8,
    pub temperature: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingStatePayload {
    pub charge_type: u8,
    pub battery_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiRssiPayload {
    pub rssi: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodlightSwitchPayload {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdStatusPayload {
    pub status: u8,
    pub capacity_mb: u64,
    pub available_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorStatusPayload {
    pub status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarageDoorStatusPayload {
    pub door_id: u8,
    pub status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfoPayload {
    pub info: Value,
}

/// Database query/delete results are relayed verbatim; the device model
/// layer owns their record schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePayload {
    pub return_code: i32,
    pub data: Value,
}
