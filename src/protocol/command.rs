//! Command types and the typed send shapes
//!
//! Every outgoing command is one of five concrete shapes with all fields
//! required. The command type space is open-ended (the device model layer
//! defines hundreds of them); the constants here are the ones the session
//! core itself needs to recognize.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A device command type on the wire (u16, big-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandType(pub u16);

/// Lock sub-protocol command range. Commands in this range require a
/// registered AES key before they may be sent.
pub const LOCK_COMMAND_RANGE: std::ops::RangeInclusive<u16> = 0x7000..=0x70FF;

impl CommandType {
    // Key exchange push from the device: RSA-encrypted stream key material.
    pub const STREAM_KEY: CommandType = CommandType(0x0020);

    // Stream control
    pub const START_LIVESTREAM: CommandType = CommandType(0x1001);
    pub const STOP_LIVESTREAM: CommandType = CommandType(0x1002);
    pub const START_DOWNLOAD: CommandType = CommandType(0x1003);
    pub const STOP_DOWNLOAD: CommandType = CommandType(0x1004);
    pub const START_RTSP: CommandType = CommandType(0x1005);
    pub const STOP_RTSP: CommandType = CommandType(0x1006);
    pub const START_TALKBACK: CommandType = CommandType(0x1007);
    pub const STOP_TALKBACK: CommandType = CommandType(0x1008);

    // Lock sub-protocol
    pub const LOCK_BASIC_OPERATION: CommandType = CommandType(0x7001);
    pub const LOCK_STATUS: CommandType = CommandType(0x7002);
    pub const LOCK_CALIBRATE: CommandType = CommandType(0x7003);
    pub const LOCK_SETTINGS: CommandType = CommandType(0x7004);

    // Device telemetry pushes
    pub const ALARM_MODE: CommandType = CommandType(0x8101);
    pub const ALARM_DELAY: CommandType = CommandType(0x8102);
    pub const ALARM_ARMED: CommandType = CommandType(0x8103);
    pub const ALARM_EVENT: CommandType = CommandType(0x8104);
    pub const RUNTIME_STATE: CommandType = CommandType(0x8105);
    pub const CHARGING_STATE: CommandType = CommandType(0x8106);
    pub const WIFI_RSSI: CommandType = CommandType(0x8107);
    pub const FLOODLIGHT_SWITCH: CommandType = CommandType(0x8108);
    pub const SHAKE_ALARM: CommandType = CommandType(0x8109);
    pub const ALARM_911: CommandType = CommandType(0x810A);
    pub const JAMMED_ALARM: CommandType = CommandType(0x810B);
    pub const LOW_BATTERY_ALARM: CommandType = CommandType(0x810C);
    pub const WRONG_TRY_ALARM: CommandType = CommandType(0x810D);
    pub const SD_STATUS: CommandType = CommandType(0x810E);
    pub const SENSOR_STATUS: CommandType = CommandType(0x810F);
    pub const GARAGE_DOOR_STATUS: CommandType = CommandType(0x8110);
    pub const STORAGE_INFO: CommandType = CommandType(0x8111);

    // Database query results
    pub const DATABASE_LATEST: CommandType = CommandType(0x8201);
    pub const DATABASE_LOCAL: CommandType = CommandType(0x8202);
    pub const DATABASE_COUNT_BY_DATE: CommandType = CommandType(0x8203);
    pub const DATABASE_DELETE: CommandType = CommandType(0x8204);

    /// Whether this type belongs to the separately encrypted lock
    /// sub-protocol.
    pub fn is_lock_command(self) -> bool {
        LOCK_COMMAND_RANGE.contains(&self.0)
    }

    /// Whether the command payload must embed the session's public RSA
    /// modulus so the device can return an encrypted stream key.
    pub fn requests_stream_key(self) -> bool {
        matches!(self, Self::START_LIVESTREAM | Self::START_DOWNLOAD)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for CommandType {
    fn from(value: u16) -> Self {
        CommandType(value)
    }
}

/// The five send shapes. All fields are required; validation happens at
/// construction, not inside per-device encoding branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum CommandPayload {
    WithoutData,
    WithInt {
        value: i32,
        str_value: String,
    },
    WithIntString {
        value: i32,
        value_sub: i32,
        str_value: String,
    },
    WithString {
        str_value: String,
        str_value_sub: String,
    },
    WithStringPayload {
        payload: Value,
    },
}

/// A fully-formed outgoing command: type, channel, and shape.
#[derive(Debug, Clone)]
pub struct P2pCommand {
    pub command: CommandType,
    pub channel: u8,
    pub payload: CommandPayload,
}

impl P2pCommand {
    pub fn without_data(command: CommandType, channel: u8) -> Self {
        Self {
            command,
            channel,
            payload: CommandPayload::WithoutData,
        }
    }

    pub fn with_int(
        command: CommandType,
        value: i32,
        str_value: impl Into<String>,
        channel: u8,
    ) -> Self {
        Self {
            command,
            channel,
            payload: CommandPayload::WithInt {
                value,
                str_value: str_value.into(),
            },
        }
    }

    pub fn with_int_string(
        command: CommandType,
        value: i32,
        value_sub: i32,
        str_value: impl Into<String>,
        channel: u8,
    ) -> Self {
        Self {
            command,
            channel,
            payload: CommandPayload::WithIntString {
                value,
                value_sub,
                str_value: str_value.into(),
            },
        }
    }

    pub fn with_string(
        command: CommandType,
        str_value: impl Into<String>,
        str_value_sub: impl Into<String>,
        channel: u8,
    ) -> Self {
        Self {
            command,
            channel,
            payload: CommandPayload::WithString {
                str_value: str_value.into(),
                str_value_sub: str_value_sub.into(),
            },
        }
    }

    pub fn with_string_payload(command: CommandType, payload: Value, channel: u8) -> Self {
        Self {
            command,
            channel,
            payload: CommandPayload::WithStringPayload { payload },
        }
    }

    /// Serialize the JSON command body. `stream_key` is the hex public
    /// modulus of the session keypair, embedded only for commands that
    /// request a stream key from the device.
    pub fn serialize_body(
        &self,
        account_id: &str,
        stream_key: Option<&str>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let mut body = serde_json::json!({
            "account_id": account_id,
            "cmd": self.command.0,
            "channel": self.channel,
        });

        match &self.payload {
            CommandPayload::WithoutData => {}
            CommandPayload::WithInt { value, str_value } => {
                body["value"] = (*value).into();
                body["str_value"] = str_value.as_str().into();
            }
            CommandPayload::WithIntString {
                value,
                value_sub,
                str_value,
            } => {
                body["value"] = (*value).into();
                body["value_sub"] = (*value_sub).into();
                body["str_value"] = str_value.as_str().into();
            }
            CommandPayload::WithString {
                str_value,
                str_value_sub,
            } => {
                body["str_value"] = str_value.as_str().into();
                body["str_value_sub"] = str_value_sub.as_str().into();
            }
            CommandPayload::WithStringPayload { payload } => {
                body["payload"] = payload.clone();
            }
        }

        if let Some(key) = stream_key {
            body["key"] = key.into();
        }

        serde_json::to_vec(&body)
    }
}
