//! Classic Bluetooth Serial Connection
//!
//! HC-05/HC-06 style modules expose the Serial Port Profile. The host binds
//! the SPP channel to a serial device (`/dev/rfcommN`, `COMn`), which this
//! variant opens as one exclusive byte stream.

use super::{DataCallback, DataListener, DeviceConnection, StateCell};
use crate::domain::models::{ConnectionState, ConnectionType, DeviceInfo};
use crate::domain::settings::Settings;
use crate::infrastructure::protocol::SPP_UUID;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Configuration for a classic serial link
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial device bound to the SPP channel
    pub port_name: String,
    pub baud_rate: u32,
    /// Read timeout, also the reader's stop-check interval
    pub read_timeout: Duration,
}

impl SerialConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: 9600,
            read_timeout: Duration::from_millis(100),
        }
    }

    pub fn from_settings(port_name: impl Into<String>, settings: &Settings) -> Self {
        Self {
            baud_rate: settings.serial_baud_rate,
            ..Self::new(port_name)
        }
    }
}

/// An open port plus the flag that stops its reader thread.
struct SerialSession {
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
}

impl SerialSession {
    fn close(self) {
        self.stop.store(true, Ordering::SeqCst);
        drop(self.port);
    }
}

pub struct ClassicSerialConnection {
    info: DeviceInfo,
    config: SerialConfig,
    state: StateCell,
    listener: DataListener,
    session: Arc<Mutex<Option<SerialSession>>>,
    retired: AtomicBool,
}

impl ClassicSerialConnection {
    /// `address` is the module's MAC address and becomes the device id.
    pub fn new(address: impl Into<String>, name: Option<String>, config: SerialConfig) -> Self {
        let address = address.into();
        let info = DeviceInfo::new(
            address.clone(),
            name.unwrap_or_else(|| "Unknown Classic BT".to_string()),
            ConnectionType::Ble,
        );

        Self {
            state: StateCell::new(&address),
            info,
            config,
            listener: DataListener::default(),
            session: Arc::new(Mutex::new(None)),
            retired: AtomicBool::new(false),
        }
    }

    fn close_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
        }
    }

    async fn open(&self) -> Result<SerialSession> {
        let port_name = self.config.port_name.clone();
        let baud_rate = self.config.baud_rate;
        let read_timeout = self.config.read_timeout;

        // Opening an RFCOMM-backed port blocks until the remote answers.
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(read_timeout)
                .open()
        })
        .await
        .context("serial open task failed")?
        .with_context(|| format!("failed to open {}", self.config.port_name))?;

        let reader = port.try_clone().context("failed to clone serial handle")?;
        let stop = Arc::new(AtomicBool::new(false));
        self.spawn_reader(reader, stop.clone())?;
        Ok(SerialSession { port, stop })
    }

    /// Keep `session` unless `disconnect()` ran while the port was opening.
    fn adopt(&self, session: SerialSession) -> std::result::Result<(), SerialSession> {
        let mut slot = self.session.lock();
        if self.retired.load(Ordering::SeqCst) {
            return Err(session);
        }
        *slot = Some(session);
        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    async fn release(&self, session: SerialSession) {
        // Dropping the port can block on some drivers.
        if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
            warn!(device = %self.info.id, "Serial close failed: {}", e);
        }
    }

    fn spawn_reader(&self, mut reader: Box<dyn SerialPort>, stop: Arc<AtomicBool>) -> Result<()> {
        let listener = self.listener.clone();
        let state = self.state.clone();
        let device_id = self.info.id.clone();

        std::thread::Builder::new()
            .name(format!("serial-reader-{}", device_id))
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !stop.load(Ordering::SeqCst) {
                    match reader.read(&mut buf) {
                        Ok(0) => {}
                        Ok(n) => listener.dispatch(buf[..n].to_vec()),
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) => {
                            if !stop.load(Ordering::SeqCst) {
                                warn!(device = %device_id, "Serial link lost: {}", e);
                                state.set(ConnectionState::Disconnected);
                            }
                            break;
                        }
                    }
                }
                debug!(device = %device_id, "Serial reader stopped");
            })
            .context("failed to spawn serial reader")?;
        Ok(())
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock();
            let session = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("serial port not open"))?;
            session.port.write_all(&bytes)?;
            session.port.flush()?;
            Ok::<(), anyhow::Error>(())
        })
        .await
        .context("serial write task failed")?
    }
}

#[async_trait]
impl DeviceConnection for ClassicSerialConnection {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> bool {
        if self.retired.load(Ordering::SeqCst) {
            warn!(device = %self.info.id, "Connection already closed, create a new one to reconnect");
            return false;
        }

        self.state.set(ConnectionState::Connecting);
        self.close_session();

        info!(
            device = %self.info.id,
            port = %self.config.port_name,
            "Opening SPP channel {}",
            SPP_UUID
        );
        match self.open().await.map(|session| self.adopt(session)) {
            Ok(Ok(())) => {
                info!(device = %self.info.id, "Serial connection established");
                true
            }
            Ok(Err(abandoned)) => {
                info!(device = %self.info.id, "Disconnected while connecting, closing port");
                self.release(abandoned).await;
                self.state.set(ConnectionState::Disconnected);
                false
            }
            Err(e) => {
                warn!(device = %self.info.id, "Serial connect failed: {:#}", e);
                if self.retired.load(Ordering::SeqCst) {
                    self.state.set(ConnectionState::Disconnected);
                } else {
                    self.state.set(ConnectionState::Error);
                }
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.release(session).await;
        }
        self.state.set(ConnectionState::Disconnected);
        info!(device = %self.info.id, "Disconnected");
    }

    async fn send_command(&self, command: &str) -> bool {
        match self.write(command.as_bytes().to_vec()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %self.info.id, "Serial send failed: {:#}", e);
                false
            }
        }
    }

    fn set_on_data_received(&self, callback: DataCallback) {
        self.listener.set(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_port() -> ClassicSerialConnection {
        ClassicSerialConnection::new(
            "00:11:22:33:44:55",
            Some("HC-05".to_string()),
            SerialConfig::new("/dev/arm-controller-missing-port"),
        )
    }

    #[test]
    fn test_device_info() {
        let conn = missing_port();
        assert_eq!(conn.device_info().id, "00:11:22:33:44:55");
        assert_eq!(conn.device_info().name, "HC-05");
        assert_eq!(conn.device_info().connection_type, ConnectionType::Ble);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error() {
        let conn = missing_port();
        assert!(!conn.connect().await);
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_send_without_port_returns_false() {
        let conn = missing_port();
        assert!(!conn.send_command("#1P1500T50!").await);
        assert!(!conn.send_json("{}").await);
    }

    #[tokio::test]
    async fn test_disconnect_is_final() {
        let conn = missing_port();
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.connect().await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[cfg(unix)]
    fn pty_session() -> (SerialSession, serialport::TTYPort) {
        let (port, peer) = serialport::TTYPort::pair().unwrap();
        let session = SerialSession {
            port: Box::new(port),
            stop: Arc::new(AtomicBool::new(false)),
        };
        (session, peer)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_opened_port_is_adopted() {
        let conn = missing_port();
        let (session, _peer) = pty_session();
        assert!(conn.adopt(session).is_ok());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.send_command("ARM\n").await);

        conn.disconnect().await;
        assert!(conn.session.lock().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_opened_after_disconnect_is_released() {
        let conn = missing_port();
        conn.disconnect().await;

        let (session, _peer) = pty_session();
        let abandoned = conn.adopt(session).unwrap_err();
        assert!(conn.session.lock().is_none());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.release(abandoned).await;
        assert!(!conn.send_command("ARM\n").await);
    }
}
