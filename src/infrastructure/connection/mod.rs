//! Device Connection Module
//!
//! One connection contract over three transports.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                       │
//! │   (registry of live connections + active device id)       │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │ dyn DeviceConnection
//!         ┌─────────────┼──────────────┐
//!         ▼             ▼              ▼
//! ┌──────────────┐ ┌───────────┐ ┌──────────────┐
//! │   Classic    │ │    BLE    │ │     WiFi     │
//! │ - SPP serial │ │ - GATT    │ │ - WebSocket  │
//! │   port       │ │   notify  │ │   /ws        │
//! └──────────────┘ └───────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`classic`] - Classic Bluetooth serial (SPP) connection
//! - [`ble`] - BLE GATT connection with retry and notification setup
//! - [`wifi`] - WebSocket connection and local network discovery
//! - [`scanner`] - BLE peripheral discovery
//! - [`manager`] - Multi-device registry and command routing
//!
//! Transport faults never cross the [`DeviceConnection`] boundary: every
//! operation degrades to a `false` result or an `Error` state.

pub mod ble;
pub mod classic;
pub mod manager;
pub mod scanner;
pub mod wifi;

pub use ble::{BleConfig, BleConnection};
pub use classic::{ClassicSerialConnection, SerialConfig};
pub use manager::{ConnectionManager, Registry};
pub use scanner::{BleScanner, DiscoveredPeripheral};
pub use wifi::{scan_local_network, WifiConfig, WifiConnection};

use crate::domain::models::{ConnectionState, DeviceInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Inbound data callback. Invoked with each received frame, message or
/// notification payload.
pub type DataCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// A live connection to one arm.
///
/// Implementations own their transport handle exclusively. An instance is
/// single-use: once disconnected it never reconnects, and a fresh instance
/// is required.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn device_info(&self) -> &DeviceInfo;

    /// Subscribe to state transitions. The receiver always holds the latest
    /// state.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Current state.
    fn state(&self) -> ConnectionState {
        *self.connection_state().borrow()
    }

    /// Establish the link. Returns `false` and moves to `Error` on failure.
    async fn connect(&self) -> bool;

    /// Release the transport. Always ends in `Disconnected`.
    async fn disconnect(&self);

    /// Write raw command text. `true` iff the transport accepted the write.
    async fn send_command(&self, command: &str) -> bool;

    /// JSON payloads use the same framing as raw commands.
    async fn send_json(&self, json: &str) -> bool {
        self.send_command(json).await
    }

    /// Replace the inbound data callback.
    fn set_on_data_received(&self, callback: DataCallback);
}

/// Single-writer observable connection state.
#[derive(Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
    device_id: Arc<str>,
}

impl StateCell {
    pub(crate) fn new(device_id: &str) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx: Arc::new(tx),
            device_id: Arc::from(device_id),
        }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            debug!(device = %self.device_id, from = %previous, to = %state, "Connection state changed");
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

/// Slot holding the one registered inbound data callback.
#[derive(Clone, Default)]
pub(crate) struct DataListener {
    slot: Arc<Mutex<Option<DataCallback>>>,
}

impl DataListener {
    pub(crate) fn set(&self, callback: DataCallback) {
        *self.slot.lock() = Some(callback);
    }

    pub(crate) fn dispatch(&self, data: Vec<u8>) {
        // Clone out so the callback runs without the lock held.
        let callback = self.slot.lock().clone();
        if let Some(callback) = callback {
            callback(data);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connection used by manager and app tests.

    use super::*;
    use crate::domain::models::ConnectionType;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub(crate) struct FakeConnection {
        info: DeviceInfo,
        state: StateCell,
        listener: DataListener,
        connect_ok: bool,
        send_ok: AtomicBool,
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) disconnects: Mutex<u32>,
    }

    impl FakeConnection {
        pub(crate) fn new(id: &str, connection_type: ConnectionType, connect_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                info: DeviceInfo::new(id, format!("Fake {}", id), connection_type),
                state: StateCell::new(id),
                listener: DataListener::default(),
                connect_ok,
                send_ok: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
                disconnects: Mutex::new(0),
            })
        }

        pub(crate) fn set_send_ok(&self, ok: bool) {
            self.send_ok.store(ok, Ordering::SeqCst);
        }

        pub(crate) fn force_state(&self, state: ConnectionState) {
            self.state.set(state);
        }

        pub(crate) fn receive(&self, data: &[u8]) {
            self.listener.dispatch(data.to_vec());
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceConnection for FakeConnection {
        fn device_info(&self) -> &DeviceInfo {
            &self.info
        }

        fn connection_state(&self) -> watch::Receiver<ConnectionState> {
            self.state.subscribe()
        }

        async fn connect(&self) -> bool {
            self.state.set(ConnectionState::Connecting);
            let next = if self.connect_ok {
                ConnectionState::Connected
            } else {
                ConnectionState::Error
            };
            self.state.set(next);
            self.connect_ok
        }

        async fn disconnect(&self) {
            *self.disconnects.lock() += 1;
            self.state.set(ConnectionState::Disconnected);
        }

        async fn send_command(&self, command: &str) -> bool {
            if self.state.get() != ConnectionState::Connected || !self.send_ok.load(Ordering::SeqCst)
            {
                return false;
            }
            self.sent.lock().push(command.to_string());
            true
        }

        fn set_on_data_received(&self, callback: DataCallback) {
            self.listener.set(callback);
        }
    }
}
