use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Transport family used for routing. Classic Bluetooth serial links
/// identify as `Ble`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Ble,
    Wifi,
}

/// Identity of a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// MAC address or `host:port`.
    pub id: String,
    pub name: String,
    pub connection_type: ConnectionType,
    /// Signal strength in dBm (BLE only).
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            connection_type,
            rssi: None,
        }
    }

    pub fn with_rssi(mut self, rssi: Option<i16>) -> Self {
        self.rssi = rssi;
        self
    }
}

/// A peripheral reported by a BLE scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub signal_strength: Option<i16>,
}

/// Events pushed from connections to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Raw bytes received from a device.
    DataReceived { device_id: String, data: Vec<u8> },
    /// A device was registered with the connection manager.
    DeviceConnected(DeviceInfo),
    /// A connection attempt failed.
    ConnectFailed { device_id: String },
}
