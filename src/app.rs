//! Application composition root.
//!
//! Wires settings, the keyframe store, the connection manager and the
//! sequencer together, and exposes the manual-control surface a front end
//! drives (sliders, arm/disarm, capture).

use crate::domain::action::{clamp_pwm, ActionProject, AXIS_COUNT, PWM_CENTER};
use crate::domain::models::{AppEvent, ConnectionState, ScannedDevice};
use crate::domain::sequencer::Sequencer;
use crate::domain::settings::{SettingsService, SettingsSnapshot};
use crate::error::Result;
use crate::infrastructure::connection::{
    scan_local_network, BleConfig, BleScanner, ClassicSerialConnection, ConnectionManager,
    DeviceConnection, SerialConfig, WifiConfig, WifiConnection,
};
use crate::infrastructure::protocol::{self, ArmCommand};
use crate::infrastructure::storage::ActionRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub struct ArmControllerApp {
    settings: Arc<Mutex<SettingsService>>,
    connections: Arc<ConnectionManager>,
    sequencer: Sequencer,
    repository: ActionRepository,
    servos: watch::Sender<[u16; AXIS_COUNT]>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl ArmControllerApp {
    pub fn new(
        settings: SettingsService,
        repository: ActionRepository,
    ) -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let connections = Arc::new(ConnectionManager::new());
        let sequencer = Sequencer::new(connections.clone());
        let (servos, _) = watch::channel([PWM_CENTER; AXIS_COUNT]);
        let (events, events_rx) = mpsc::unbounded_channel();

        let app = Self {
            settings: Arc::new(Mutex::new(settings)),
            connections,
            sequencer,
            repository,
            servos,
            events,
        };
        (app, events_rx)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn repository(&self) -> &ActionRepository {
        &self.repository
    }

    pub fn settings(&self) -> Arc<Mutex<SettingsService>> {
        self.settings.clone()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register `connection` with the manager, forwarding its inbound data
    /// as [`AppEvent::DataReceived`].
    pub async fn connect(&self, connection: Arc<dyn DeviceConnection>) -> bool {
        let info = connection.device_info().clone();
        let events = self.events.clone();
        let device_id = info.id.clone();
        connection.set_on_data_received(Arc::new(move |data| {
            let _ = events.send(AppEvent::DataReceived {
                device_id: device_id.clone(),
                data,
            });
        }));

        if !self.connections.add_connection(connection).await {
            let _ = self.events.send(AppEvent::ConnectFailed {
                device_id: info.id,
            });
            return false;
        }

        let snapshot = {
            let mut settings = self.settings.lock();
            settings.remember_device(&info.id);
            settings.snapshot()
        };
        persist(snapshot).await;
        info!(device = %info.id, name = %info.name, "Device connected");
        let _ = self.events.send(AppEvent::DeviceConnected(info));
        true
    }

    pub async fn connect_wifi(&self, host: &str, port: Option<u16>) -> bool {
        let (config, default_port) = {
            let settings = self.settings.lock();
            (WifiConfig::from_settings(settings.get()), settings.get().wifi_port)
        };
        let connection = WifiConnection::new(host, port.unwrap_or(default_port), config);
        self.connect(Arc::new(connection)).await
    }

    /// Connect over a classic Bluetooth serial port already bound to
    /// the module at `address`.
    pub async fn connect_serial(&self, port_name: &str, address: &str, name: Option<String>) -> bool {
        let config = SerialConfig::from_settings(port_name, self.settings.lock().get());
        let connection = ClassicSerialConnection::new(address, name, config);
        self.connect(Arc::new(connection)).await
    }

    /// Scan for the peripheral at `address` and connect to it.
    pub async fn connect_ble(&self, address: &str) -> bool {
        let (config, scan_duration) = {
            let settings = self.settings.lock();
            let config = BleConfig::from_settings(settings.get());
            (config, Duration::from_millis(settings.get().ble_scan_duration_ms))
        };
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid BLE settings: {:#}", e);
                return false;
            }
        };

        let found = match BleScanner::new(config.service_uuid).await {
            Ok(scanner) => scanner.find_by_address(address, scan_duration).await,
            Err(e) => Err(e),
        };
        match found {
            Ok(Some(peripheral)) => {
                let connection = peripheral.into_connection(config);
                self.connect(Arc::new(connection)).await
            }
            Ok(None) => {
                warn!(device = %address, "BLE device not found");
                let _ = self.events.send(AppEvent::ConnectFailed {
                    device_id: address.to_string(),
                });
                false
            }
            Err(e) => {
                warn!(device = %address, "BLE scan failed: {:#}", e);
                false
            }
        }
    }

    /// Hosts on `{base_ip}.{subnet}.0/24` accepting the configured port.
    pub async fn scan_wifi(&self, base_ip: &str, subnet: u8) -> Vec<String> {
        let (port, probe_timeout) = {
            let settings = self.settings.lock();
            (
                settings.get().wifi_port,
                Duration::from_millis(settings.get().wifi_scan_timeout_ms),
            )
        };
        scan_local_network(base_ip, subnet, port, probe_timeout).await
    }

    pub async fn scan_ble(&self) -> anyhow::Result<Vec<ScannedDevice>> {
        let (config, duration, show_all) = {
            let settings = self.settings.lock();
            (
                BleConfig::from_settings(settings.get()),
                Duration::from_millis(settings.get().ble_scan_duration_ms),
                settings.get().debug_show_all_devices,
            )
        };
        let scanner = BleScanner::new(config?.service_uuid).await?;
        let found = scanner.scan(duration, show_all).await?;
        Ok(found.into_iter().map(|d| d.device).collect())
    }

    /// Disconnect every device.
    pub async fn disconnect(&self) {
        self.connections.disconnect_all().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connections
            .active_device()
            .is_some_and(|device| device.state() == ConnectionState::Connected)
    }

    pub fn connected_device_name(&self) -> Option<String> {
        self.connections
            .active_device()
            .map(|device| device.device_info().name.clone())
    }

    // ========================================================================
    // Manual control
    // ========================================================================

    pub fn servos(&self) -> [u16; AXIS_COUNT] {
        *self.servos.borrow()
    }

    pub fn subscribe_servos(&self) -> watch::Receiver<[u16; AXIS_COUNT]> {
        self.servos.subscribe()
    }

    fn jog_command(&self, axis: u8, pwm: u16) -> String {
        let time_ms = self.settings.lock().get().jog_time_ms;
        ArmCommand::Move { axis, pwm, time_ms }.encode()
    }

    /// Set axis `index` (0-based) and jog the arm there. Out-of-range
    /// values are clamped; an unknown index is ignored.
    pub async fn update_servo(&self, index: usize, value: i64) -> bool {
        if index >= AXIS_COUNT {
            warn!(index, "Servo index out of range");
            return false;
        }

        let pwm = clamp_pwm(value);
        self.servos.send_modify(|servos| servos[index] = pwm);
        let command = self.jog_command(index as u8 + 1, pwm);
        self.connections.send_to_active(&command).await
    }

    /// Move every axis to center. Returns the number of accepted commands.
    pub async fn center_all(&self) -> usize {
        self.servos.send_replace([PWM_CENTER; AXIS_COUNT]);

        let mut sent = 0;
        for axis in 1..=AXIS_COUNT as u8 {
            let command = self.jog_command(axis, PWM_CENTER);
            if self.connections.send_to_active(&command).await {
                sent += 1;
            }
        }
        sent
    }

    /// Halt playback and disable servo output.
    pub async fn emergency_stop(&self) -> bool {
        self.sequencer.stop();
        warn!("Emergency stop");
        self.connections.send_to_active(protocol::DISARM).await
    }

    pub async fn arm_robot(&self) -> bool {
        self.connections.send_to_active(protocol::ARM).await
    }

    /// Append the current pose to the working frames.
    pub fn capture_frame(&self) -> Result<()> {
        let duration = Duration::from_millis(self.settings.lock().get().capture_duration_ms as u64);
        self.sequencer.capture_frame(self.servos(), duration)
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub async fn save_project(&self) -> Result<ActionProject> {
        self.sequencer.save_project(&self.repository).await
    }

    /// Load a stored project into the sequencer. Returns `false` if absent.
    pub async fn open_project(&self, id: i64) -> Result<bool> {
        match self.repository.get_project_with_frames(id).await? {
            Some(project) => {
                self.sequencer.load_project(project);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop playback and drop every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.sequencer.stop();
        self.connections.disconnect_all().await;
        let snapshot = self.settings.lock().snapshot();
        persist(snapshot).await;
    }
}

/// Write settings on the blocking pool.
async fn persist(snapshot: SettingsSnapshot) {
    match tokio::task::spawn_blocking(move || snapshot.save()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to save settings: {:#}", e),
        Err(e) => warn!("Settings write task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionType;
    use crate::infrastructure::connection::testing::FakeConnection;

    async fn app() -> (ArmControllerApp, mpsc::UnboundedReceiver<AppEvent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsService::with_path(dir.path().join("settings.json"));
        let repository = ActionRepository::in_memory().await.unwrap();
        let (app, events) = ArmControllerApp::new(settings, repository);
        (app, events, dir)
    }

    async fn connected_app() -> (
        ArmControllerApp,
        Arc<FakeConnection>,
        mpsc::UnboundedReceiver<AppEvent>,
        tempfile::TempDir,
    ) {
        let (app, mut events, dir) = app().await;
        let fake = FakeConnection::new("arm-1", ConnectionType::Wifi, true);
        assert!(app.connect(fake.clone()).await);
        assert!(matches!(
            events.recv().await,
            Some(AppEvent::DeviceConnected(_))
        ));
        (app, fake, events, dir)
    }

    #[tokio::test]
    async fn test_update_servo_clamps_and_jogs() {
        let (app, fake, _events, _dir) = connected_app().await;

        assert!(app.update_servo(2, 9_000).await);
        assert_eq!(app.servos()[2], 2500);
        assert_eq!(fake.sent(), vec!["#3P2500T50!".to_string()]);

        assert!(!app.update_servo(6, 1500).await);
        assert_eq!(fake.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_center_all_sends_every_axis() {
        let (app, fake, _events, _dir) = connected_app().await;
        app.update_servo(0, 600).await;

        assert_eq!(app.center_all().await, 6);
        assert_eq!(app.servos(), [1500; 6]);
        let sent = fake.sent();
        assert_eq!(sent.len(), 7);
        assert_eq!(sent[1], "#1P1500T50!");
        assert_eq!(sent[6], "#6P1500T50!");
    }

    #[tokio::test]
    async fn test_arm_and_emergency_stop() {
        let (app, fake, _events, _dir) = connected_app().await;
        assert!(app.arm_robot().await);
        assert!(app.emergency_stop().await);
        assert_eq!(fake.sent(), vec!["ARM\n".to_string(), "DISARM\n".to_string()]);
    }

    #[tokio::test]
    async fn test_commands_without_device_fail() {
        let (app, _events, _dir) = app().await;
        assert!(!app.is_connected());
        assert_eq!(app.connected_device_name(), None);
        assert!(!app.arm_robot().await);
        assert_eq!(app.center_all().await, 0);
    }

    #[tokio::test]
    async fn test_connection_status_and_known_devices() {
        let (app, fake, _events, _dir) = connected_app().await;
        assert!(app.is_connected());
        assert_eq!(app.connected_device_name().as_deref(), Some("Fake arm-1"));
        assert_eq!(
            app.settings().lock().get().last_connected_device.as_deref(),
            Some("arm-1")
        );

        fake.force_state(ConnectionState::Disconnected);
        assert!(!app.is_connected());

        app.disconnect().await;
        assert_eq!(app.connected_device_name(), None);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_event() {
        let (app, mut events, _dir) = app().await;
        let fake = FakeConnection::new("arm-2", ConnectionType::Ble, false);
        assert!(!app.connect(fake).await);
        assert_eq!(
            events.recv().await,
            Some(AppEvent::ConnectFailed {
                device_id: "arm-2".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_inbound_data_is_forwarded() {
        let (_app, fake, mut events, _dir) = connected_app().await;
        fake.receive(b"OK");
        assert_eq!(
            events.recv().await,
            Some(AppEvent::DataReceived {
                device_id: "arm-1".to_string(),
                data: b"OK".to_vec(),
            })
        );
    }

    #[tokio::test]
    async fn test_capture_save_and_reopen() {
        let (app, _events, _dir) = app().await;
        app.sequencer().create_new_project("pick").unwrap();
        app.update_servo(0, 700).await;
        app.capture_frame().unwrap();
        app.center_all().await;
        app.capture_frame().unwrap();

        let saved = app.save_project().await.unwrap();
        assert!(saved.is_saved());

        app.sequencer().create_new_project("other").unwrap();
        assert!(app.open_project(saved.id).await.unwrap());
        let frames = app.sequencer().frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].servo(1), Some(700));
        assert_eq!(frames[1].servos(), &[1500; 6]);
        assert!(!app.open_project(999).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_reaches_active_device() {
        let (app, fake, _events, _dir) = connected_app().await;
        app.capture_frame().unwrap();

        let mut playing = app.sequencer().subscribe_playing();
        app.sequencer().play(false);
        playing.wait_for(|p| !*p).await.unwrap();

        assert_eq!(fake.sent().len(), 6);
        assert_eq!(fake.sent()[0], "#1P1500T1000!");
    }

    #[tokio::test]
    async fn test_connect_writes_known_device_file() {
        let (_app, _fake, _events, dir) = connected_app().await;
        let reloaded = SettingsService::with_path(dir.path().join("settings.json"));
        assert_eq!(reloaded.get().known_devices, vec!["arm-1".to_string()]);
        assert_eq!(reloaded.get().last_connected_device.as_deref(), Some("arm-1"));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (app, fake, _events, _dir) = connected_app().await;
        app.shutdown().await;
        assert_eq!(*fake.disconnects.lock(), 1);
        assert!(app.connections().snapshot().is_empty());
    }
}
