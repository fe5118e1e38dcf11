//! Typed session events and the listener bus
//!
//! Every observable fact about a session surfaces here: connection
//! lifecycle, command results, per-channel stream lifecycle, device
//! telemetry, and database query results. Delivery is synchronous and
//! strictly ordered relative to the read loop; a panicking listener is
//! isolated so it cannot starve the others or subsequent events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::telemetry::{
    AlarmDelayPayload, AlarmEventPayload, AlarmModePayload, ChargingStatePayload,
    FloodlightSwitchPayload, GarageDoorStatusPayload, RuntimeStatePayload, SdStatusPayload,
    SensorStatusPayload, StorageInfoPayload, WifiRssiPayload,
};
use crate::protocol::CommandType;

use super::stream::StreamMetadata;

/// Events published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    // Connection lifecycle
    Connected,
    Closed,
    Timeout,

    // Command results
    CommandResult {
        channel: u8,
        command: CommandType,
        return_code: i32,
        meta: Value,
    },
    /// Lock sub-protocol acknowledgement
    SecondaryCommandResult {
        channel: u8,
        command: CommandType,
        return_code: i32,
        meta: Value,
    },
    SequenceError {
        channel: u8,
        command: CommandType,
        received_sequence: u32,
        serial: String,
    },

    // Stream lifecycle
    LivestreamStarted {
        channel: u8,
        metadata: StreamMetadata,
    },
    LivestreamStopped {
        channel: u8,
    },
    LivestreamError {
        channel: u8,
        reason: String,
    },
    DownloadStarted {
        channel: u8,
        metadata: StreamMetadata,
    },
    DownloadFinished {
        channel: u8,
    },
    DownloadError {
        channel: u8,
        reason: String,
    },
    RtspLivestreamStarted {
        channel: u8,
    },
    RtspLivestreamStopped {
        channel: u8,
    },
    TalkbackStarted {
        channel: u8,
    },
    TalkbackStopped {
        channel: u8,
    },
    TalkbackError {
        channel: u8,
        reason: String,
    },

    // Device telemetry
    AlarmMode {
        mode: u8,
    },
    AlarmDelay {
        alarm_delay_type: u8,
        alarm_delay: u32,
    },
    AlarmArmed,
    AlarmEvent {
        alarm_event: u16,
    },
    RuntimeState {
        channel: u8,
        battery_level: u8,
        temperature: i8,
    },
    ChargingState {
        channel: u8,
        charge_type: u8,
        battery_level: u8,
    },
    WifiRssi {
        channel: u8,
        rssi: i8,
    },
    FloodlightManualSwitch {
        channel: u8,
        enabled: bool,
    },
    ShakeAlarm {
        channel: u8,
        event: u16,
    },
    Alarm911 {
        channel: u8,
        event: u16,
    },
    JammedAlarm {
        channel: u8,
    },
    LowBatteryAlarm {
        channel: u8,
    },
    WrongTryProtectAlarm {
        channel: u8,
    },
    SdCardStatus {
        status: u8,
        capacity_mb: u64,
        available_mb: u64,
    },
    SensorStatus {
        channel: u8,
        status: u8,
    },
    GarageDoorStatus {
        channel: u8,
        door_id: u8,
        status: u8,
    },
    StorageInfo {
        channel: u8,
        info: Value,
    },

    // Database query results
    DatabaseQueryLatest {
        return_code: i32,
        data: Value,
    },
    DatabaseQueryLocal {
        return_code: i32,
        data: Value,
    },
    DatabaseCountByDate {
        return_code: i32,
        data: Value,
    },
    DatabaseDelete {
        return_code: i32,
        failed_ids: Value,
    },
}

impl SessionEvent {
    /// Decode a device-initiated push into its event. `None` means the
    /// push type is unknown to the core (the device model layer may still
    /// care; the session logs and drops it).
    pub fn from_push(channel: u8, command: CommandType, body: &[u8]) -> Option<SessionEvent> {
        fn parse<T: serde::de::DeserializeOwned>(body: &[u8]) -> Option<T> {
            match serde_json::from_slice(body) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    debug!("Malformed telemetry payload: {}", e);
                    None
                }
            }
        }

        match command {
            CommandType::ALARM_MODE => {
                let p: AlarmModePayload = parse(body)?;
                Some(SessionEvent::AlarmMode { mode: p.mode })
            }
            CommandType::ALARM_DELAY => {
                let p: AlarmDelayPayload = parse(body)?;
                Some(SessionEvent::AlarmDelay {
                    alarm_delay_type: p.alarm_delay_type,
                    alarm_delay: p.alarm_delay,
                })
            }
            CommandType::ALARM_ARMED => Some(SessionEvent::AlarmArmed),
            CommandType::ALARM_EVENT => {
                let p: AlarmEventPayload = parse(body)?;
                Some(SessionEvent::AlarmEvent {
                    alarm_event: p.alarm_event,
                })
            }
            CommandType::RUNTIME_STATE => {
                let p: RuntimeStatePayload = parse(body)?;
                Some(SessionEvent::RuntimeState {
                    channel,
                    battery_level: p.battery_level,
                    temperature: p.temperature,
                })
            }
            CommandType::CHARGING_STATE => {
                let p: ChargingStatePayload = parse(body)?;
                Some(SessionEvent::ChargingState {
                    channel,
                    charge_type: p.charge_type,
                    battery_level: p.battery_level,
                })
            }
            CommandType::WIFI_RSSI => {
                let p: WifiRssiPayload = parse(body)?;
                Some(SessionEvent::WifiRssi {
                    channel,
                    rssi: p.rssi,
                })
            }
            CommandType::FLOODLIGHT_SWITCH => {
                let p: FloodlightSwitchPayload = parse(body)?;
                Some(SessionEvent::FloodlightManualSwitch {
                    channel,
                    enabled: p.enabled,
                })
            }
            CommandType::SHAKE_ALARM => {
                let p: AlarmEventPayload = parse(body)?;
                Some(SessionEvent::ShakeAlarm {
                    channel,
                    event: p.alarm_event,
                })
            }
            CommandType::ALARM_911 => {
                let p: AlarmEventPayload = parse(body)?;
                Some(SessionEvent::Alarm911 {
                    channel,
                    event: p.alarm_event,
                })
            }
            CommandType::JAMMED_ALARM => Some(SessionEvent::JammedAlarm { channel }),
            CommandType::LOW_BATTERY_ALARM => Some(SessionEvent::LowBatteryAlarm { channel }),
            CommandType::WRONG_TRY_ALARM => Some(SessionEvent::WrongTryProtectAlarm { channel }),
            CommandType::SD_STATUS => {
                let p: SdStatusPayload = parse(body)?;
                Some(SessionEvent::SdCardStatus {
                    status: p.status,
                    capacity_mb: p.capacity_mb,
                    available_mb: p.available_mb,
                })
            }
            CommandType::SENSOR_STATUS => {
                let p: SensorStatusPayload = parse(body)?;
                Some(SessionEvent::SensorStatus {
                    channel,
                    status: p.status,
                })
            }
            CommandType::GARAGE_DOOR_STATUS => {
                let p: GarageDoorStatusPayload = parse(body)?;
                Some(SessionEvent::GarageDoorStatus {
                    channel,
                    door_id: p.door_id,
                    status: p.status,
                })
            }
            CommandType::STORAGE_INFO => {
                let p: StorageInfoPayload = parse(body)?;
                Some(SessionEvent::StorageInfo {
                    channel,
                    info: p.info,
                })
            }
            CommandType::DATABASE_LATEST => {
                let p: crate::protocol::telemetry::DatabasePayload = parse(body)?;
                Some(SessionEvent::DatabaseQueryLatest {
                    return_code: p.return_code,
                    data: p.data,
                })
            }
            CommandType::DATABASE_LOCAL => {
                let p: crate::protocol::telemetry::DatabasePayload = parse(body)?;
                Some(SessionEvent::DatabaseQueryLocal {
                    return_code: p.return_code,
                    data: p.data,
                })
            }
            CommandType::DATABASE_COUNT_BY_DATE => {
                let p: crate::protocol::telemetry::DatabasePayload = parse(body)?;
                Some(SessionEvent::DatabaseCountByDate {
                    return_code: p.return_code,
                    data: p.data,
                })
            }
            CommandType::DATABASE_DELETE => {
                let p: crate::protocol::telemetry::DatabasePayload = parse(body)?;
                Some(SessionEvent::DatabaseDelete {
                    return_code: p.return_code,
                    failed_ids: p.data,
                })
            }
            _ => None,
        }
    }
}

/// Listener callback
pub type Listener = Box<dyn Fn(&SessionEvent) + Send + Sync + 'static>;

/// Handle for unsubscribing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Synchronous, ordered event delivery with per-listener fault isolation
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deliver one event to every listener, in subscription order. A
    /// panicking listener is caught and logged; the rest still run.
    pub fn emit(&self, event: &SessionEvent) {
        let listeners = self.listeners.read();
        for (id, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("Event listener {:?} panicked on {:?}", id, event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
