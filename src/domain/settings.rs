use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "arm_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    /// SQLite file holding projects; defaults to the user data directory.
    #[serde(default)]
    pub database_path: Option<String>,

    // Known devices
    #[serde(default)]
    pub known_devices: Vec<String>,
    #[serde(default)]
    pub last_connected_device: Option<String>,

    // WiFi Settings
    #[serde(default = "default_wifi_port")]
    pub wifi_port: u16,
    #[serde(default = "default_wifi_connect_timeout_ms")]
    pub wifi_connect_timeout_ms: u64,
    #[serde(default = "default_wifi_poll_interval_ms")]
    pub wifi_poll_interval_ms: u64,
    #[serde(default = "default_wifi_scan_timeout_ms")]
    pub wifi_scan_timeout_ms: u64,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,
    #[serde(default = "default_ble_connect_attempts")]
    pub ble_connect_attempts: u32,
    #[serde(default = "default_ble_retry_delay_ms")]
    pub ble_retry_delay_ms: u64,
    #[serde(default = "default_ble_connect_timeout_ms")]
    pub ble_connect_timeout_ms: u64,
    #[serde(default = "default_ble_scan_duration_ms")]
    pub ble_scan_duration_ms: u64,
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,

    // Classic Bluetooth serial
    #[serde(default = "default_serial_baud_rate")]
    pub serial_baud_rate: u32,

    // Manual control
    #[serde(default = "default_jog_time_ms")]
    pub jog_time_ms: u32,
    #[serde(default = "default_capture_duration_ms")]
    pub capture_duration_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            database_path: None,
            known_devices: Vec::new(),
            last_connected_device: None,

            wifi_port: default_wifi_port(),
            wifi_connect_timeout_ms: default_wifi_connect_timeout_ms(),
            wifi_poll_interval_ms: default_wifi_poll_interval_ms(),
            wifi_scan_timeout_ms: default_wifi_scan_timeout_ms(),

            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),
            ble_connect_attempts: default_ble_connect_attempts(),
            ble_retry_delay_ms: default_ble_retry_delay_ms(),
            ble_connect_timeout_ms: default_ble_connect_timeout_ms(),
            ble_scan_duration_ms: default_ble_scan_duration_ms(),
            debug_show_all_devices: false,

            serial_baud_rate: default_serial_baud_rate(),

            jog_time_ms: default_jog_time_ms(),
            capture_duration_ms: default_capture_duration_ms(),
        }
    }
}

fn default_wifi_port() -> u16 {
    81
}
fn default_wifi_connect_timeout_ms() -> u64 {
    5000
}
fn default_wifi_poll_interval_ms() -> u64 {
    100
}
fn default_wifi_scan_timeout_ms() -> u64 {
    200
}
// Nordic UART service layout, must match the arm firmware
fn default_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_write_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_notify_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_ble_connect_attempts() -> u32 {
    3
}
fn default_ble_retry_delay_ms() -> u64 {
    500
}
fn default_ble_connect_timeout_ms() -> u64 {
    10_000
}
fn default_ble_scan_duration_ms() -> u64 {
    5000
}
fn default_serial_baud_rate() -> u32 {
    9600
}
fn default_jog_time_ms() -> u32 {
    50
}
fn default_capture_duration_ms() -> u32 {
    1000
}

impl Settings {
    /// Resolved database location.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.database_path {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        path.push("ArmController");
        fs::create_dir_all(&path)?;
        path.push("arm_controller.db");
        Ok(path)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

/// Owned copy of the settings and their file, writable without holding
/// the service.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub settings: Settings,
    pub path: PathBuf,
}

impl SettingsSnapshot {
    pub fn save(&self) -> anyhow::Result<()> {
        write_settings(&self.path, &self.settings)
    }
}

fn write_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;
    Ok(())
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({})", e);
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ArmController");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        write_settings(&self.settings_path, &self.settings)
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            settings: self.settings.clone(),
            path: self.settings_path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Record a device id as known and last connected, in memory only.
    pub fn remember_device(&mut self, device_id: &str) {
        if !self.settings.known_devices.iter().any(|d| d == device_id) {
            self.settings.known_devices.push(device_id.to_string());
        }
        self.settings.last_connected_device = Some(device_id.to_string());
    }

    /// Remember a device id and write the file.
    pub fn add_known_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        self.remember_device(device_id);
        self.save()
    }
}
