//! BLE Connection Module
//!
//! Handles GATT connection, characteristic lookup, and notification setup
//! for arms with a BLE UART module.

use super::{DataCallback, DataListener, DeviceConnection, StateCell};
use crate::domain::models::{ConnectionState, ConnectionType, DeviceInfo};
use crate::domain::settings::Settings;
use crate::infrastructure::protocol;
use anyhow::Result;
use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Link attempts before giving up
    pub connect_attempts: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
    /// Overall budget for connect plus setup
    pub connect_timeout: Duration,
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Write characteristic UUID
    pub write_char_uuid: Uuid,
    /// Notify characteristic UUID
    pub notify_char_uuid: Uuid,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            retry_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(10),
            service_uuid: protocol::SERVICE_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
        }
    }
}

impl BleConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            connect_attempts: settings.ble_connect_attempts.max(1),
            retry_delay: Duration::from_millis(settings.ble_retry_delay_ms),
            connect_timeout: Duration::from_millis(settings.ble_connect_timeout_ms),
            service_uuid: Uuid::parse_str(&settings.ble_service_uuid)?,
            write_char_uuid: Uuid::parse_str(&settings.ble_write_char_uuid)?,
            notify_char_uuid: Uuid::parse_str(&settings.ble_notify_char_uuid)?,
        })
    }
}

/// Run `operation` up to `attempts` times, sleeping `delay` after each
/// failure. The closure receives the 1-based attempt number.
async fn retry<T, E, F, Fut>(attempts: u32, delay: Duration, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(_) if attempt < attempts => {
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => anyhow::bail!("gave up after {} attempts: {}", attempt, e),
        }
    }
}

/// Fail with an error once `budget` elapses before `task` settles.
async fn within<T>(budget: Duration, task: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(budget, task).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("timed out after {:?}", budget),
    }
}

/// State of an established GATT link
struct GattLink {
    write_char: Characteristic,
    notify_task: JoinHandle<()>,
}

pub struct BleConnection {
    info: DeviceInfo,
    peripheral: Peripheral,
    config: BleConfig,
    state: StateCell,
    listener: DataListener,
    link: Mutex<Option<GattLink>>,
    retired: Arc<AtomicBool>,
}

impl BleConnection {
    pub fn new(
        peripheral: Peripheral,
        name: Option<String>,
        rssi: Option<i16>,
        config: BleConfig,
    ) -> Self {
        let address = peripheral.address().to_string();
        let info = DeviceInfo::new(
            address.clone(),
            name.unwrap_or_else(|| "Unknown BLE Device".to_string()),
            ConnectionType::Ble,
        )
        .with_rssi(rssi);

        Self {
            state: StateCell::new(&address),
            info,
            peripheral,
            config,
            listener: DataListener::default(),
            link: Mutex::new(None),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bring the link up: connect with retry, find the UART
    /// characteristics, then subscribe to notifications.
    async fn establish(&self) -> Result<GattLink> {
        self.connect_with_retry().await?;

        self.peripheral.discover_services().await?;
        let (write_char, notify_char) = self.find_characteristics()?;

        // Step 3: notifications must be live before the link is usable
        self.peripheral.subscribe(&notify_char).await?;
        let notify_task = self.spawn_notification_pump(notify_char.uuid).await?;
        info!(device = %self.info.id, "Notifications enabled");

        Ok(GattLink {
            write_char,
            notify_task,
        })
    }

    async fn connect_with_retry(&self) -> Result<()> {
        retry(
            self.config.connect_attempts,
            self.config.retry_delay,
            |attempt| async move {
                match self.peripheral.connect().await {
                    Ok(()) => {
                        info!(device = %self.info.id, attempt, "BLE link up");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(device = %self.info.id, attempt, "BLE connect attempt failed: {}", e);
                        Err(e)
                    }
                }
            },
        )
        .await
    }

    /// Keep `link` unless `disconnect()` ran while it was being set up.
    fn adopt(&self, link: GattLink) -> std::result::Result<(), GattLink> {
        let mut slot = self.link.lock();
        if self.retired.load(Ordering::SeqCst) {
            return Err(link);
        }
        *slot = Some(link);
        self.state.set(ConnectionState::Connected);
        Ok(())
    }

    fn find_characteristics(&self) -> Result<(Characteristic, Characteristic)> {
        let characteristics = self.peripheral.characteristics();
        debug!(device = %self.info.id, "Found {} characteristics", characteristics.len());

        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.service_uuid == self.config.service_uuid && c.uuid == uuid)
                .cloned()
        };

        let write = find(self.config.write_char_uuid)
            .ok_or_else(|| anyhow::anyhow!("Write characteristic not found"))?;
        let notify = find(self.config.notify_char_uuid)
            .ok_or_else(|| anyhow::anyhow!("Notify characteristic not found"))?;
        Ok((write, notify))
    }

    async fn spawn_notification_pump(&self, notify_uuid: Uuid) -> Result<JoinHandle<()>> {
        let mut notifications = self.peripheral.notifications().await?;
        let listener = self.listener.clone();
        let state = self.state.clone();
        let retired = self.retired.clone();
        let device_id = self.info.id.clone();

        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == notify_uuid {
                    listener.dispatch(notification.value);
                }
            }
            // Stream ends when the peripheral drops the link
            if !retired.load(Ordering::SeqCst) {
                warn!(device = %device_id, "BLE link closed by peripheral");
                state.set(ConnectionState::Disconnected);
            }
        }))
    }

    async fn close_stale_link(&self) {
        let stale = self.link.lock().take();
        if let Some(link) = stale {
            link.notify_task.abort();
            if let Err(e) = self.peripheral.disconnect().await {
                debug!(device = %self.info.id, "Closing stale link failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl DeviceConnection for BleConnection {
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
        self.close_stale_link().await;
        info!(device = %self.info.id, "Connecting to BLE device");

        let result = within(self.config.connect_timeout, self.establish()).await;
        match result.map(|link| self.adopt(link)) {
            Ok(Ok(())) => true,
            Ok(Err(abandoned)) => {
                info!(device = %self.info.id, "Disconnected while connecting, dropping link");
                abandoned.notify_task.abort();
                let _ = self.peripheral.disconnect().await;
                self.state.set(ConnectionState::Disconnected);
                false
            }
            Err(e) => {
                warn!(device = %self.info.id, "BLE connect failed: {:#}", e);
                let _ = self.peripheral.disconnect().await;
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
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.notify_task.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            debug!(device = %self.info.id, "Ignoring disconnect error: {}", e);
        }
        self.state.set(ConnectionState::Disconnected);
        info!(device = %self.info.id, "Disconnected");
    }

    async fn send_command(&self, command: &str) -> bool {
        let write_char = match self.link.lock().as_ref() {
            Some(link) => link.write_char.clone(),
            None => return false,
        };

        match self
            .peripheral
            .write(&write_char, command.as_bytes(), WriteType::WithResponse)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(device = %self.info.id, "BLE write failed: {}", e);
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
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    /// Paused-clock timers may round up to the next millisecond tick.
    fn assert_near(elapsed: Duration, expected: Duration) {
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(20),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[test]
    fn test_default_config_matches_firmware() {
        let config = BleConfig::default();
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.service_uuid, protocol::SERVICE_UUID);
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.ble_connect_attempts = 0;
        settings.ble_retry_delay_ms = 250;
        let config = BleConfig::from_settings(&settings).unwrap();
        assert_eq!(config.connect_attempts, 1);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.write_char_uuid, protocol::WRITE_CHAR_UUID);
        assert_eq!(config.notify_char_uuid, protocol::NOTIFY_CHAR_UUID);
    }

    #[test]
    fn test_config_rejects_bad_uuid() {
        let mut settings = Settings::default();
        settings.ble_service_uuid = "not-a-uuid".to_string();
        assert!(BleConfig::from_settings(&settings).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_all_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<()> = retry(3, Duration::from_millis(500), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("no answer") }
        })
        .await;

        assert!(result.unwrap_err().to_string().contains("3 attempts"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two pauses between three attempts.
        assert_near(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let started = Instant::now();
        let attempt = retry(3, Duration::from_millis(500), |attempt| async move {
            if attempt < 2 {
                Err("busy")
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(attempt, 2);
        assert_near(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_budget_cuts_slow_attempts() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        // Each attempt hangs for 4s, so the third starts at 9s and is cut at 10s.
        let config = BleConfig::default();
        let result: Result<()> = within(
            config.connect_timeout,
            retry(config.connect_attempts, config.retry_delay, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(4)).await;
                    Err::<(), _>("no answer")
                }
            }),
        )
        .await;

        assert!(result.unwrap_err().to_string().contains("timed out"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_near(started.elapsed(), Duration::from_secs(10));
    }
}
