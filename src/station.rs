//! Station metadata and the cloud collaborator trait
//!
//! The session layer never talks HTTP itself; everything it needs from
//! the vendor cloud (lock public keys, recording ciphers, refreshed
//! station records) comes through [`CloudApi`], injected by the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::network::SessionError;

/// Which public key to fetch from the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicKeyType {
    /// Server public key for the lock key exchange
    Lock,
    /// Per-station key for encrypted command channels
    Server,
}

/// The cloud endpoints the session layer depends on.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Fetch a public key (hex) for a station.
    async fn public_key(
        &self,
        station_serial: &str,
        key_type: PublicKeyType,
    ) -> Result<String, SessionError>;

    /// Fetch the RSA private key (PEM) that decrypts recording stream
    /// keys, by cipher id.
    async fn cipher(&self, cipher_id: u32, account_id: &str) -> Result<String, SessionError>;

    /// Re-fetch the station record, typically after a channel mapping
    /// looks stale.
    async fn refresh_station(&self, station_serial: &str) -> Result<StationInfo, SessionError>;
}

/// One station as the cloud describes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationInfo {
    pub serial: String,
    pub account_id: String,
    pub admin_nickname: String,
    /// Device serial -> channel number behind this station
    pub channels: HashMap<String, u8>,
}

impl StationInfo {
    /// Channel of a device behind this station, if it is paired here.
    pub fn channel_for(&self, device_serial: &str) -> Option<u8> {
        self.channels.get(device_serial).copied()
    }

    /// Reverse lookup: the device serial on a channel.
    pub fn device_for(&self, channel: u8) -> Option<&str> {
        self.channels
            .iter()
            .find(|(_, ch)| **ch == channel)
            .map(|(serial, _)| serial.as_str())
    }
}
