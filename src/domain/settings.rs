use crate::domain::command;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: LogRotation,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

/// What `refresh` does with devices found by the previous sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Start the new sweep from an empty list
    #[default]
    Clear,
    /// Restart the radio scan and keep what was already found
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_volume_uuid")]
    pub volume_characteristic_uuid: String,
    #[serde(default = "default_raw_uuid")]
    pub raw_characteristic_uuid: String,
    /// Only list peripherals advertising this service
    #[serde(default)]
    pub scan_service_filter: Option<String>,
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            volume_characteristic_uuid: default_volume_uuid(),
            raw_characteristic_uuid: default_raw_uuid(),
            scan_service_filter: None,
            refresh_policy: RefreshPolicy::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            scan_on_start: default_true(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
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
    "ble_remote_controller".to_string()
}
fn default_rotation() -> LogRotation {
    LogRotation::Daily
}
fn default_service_uuid() -> String {
    command::DEFAULT_SERVICE_UUID.to_string()
}
fn default_volume_uuid() -> String {
    command::VOLUME_CHAR_UUID.to_string()
}
fn default_raw_uuid() -> String {
    command::RAW_DATA_CHAR_UUID.to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load settings from the user's config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleRemoteController");
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
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_observed_uuids() {
        let settings = Settings::default();
        assert_eq!(
            settings.ble.service_uuid,
            "00001843-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            settings.ble.volume_characteristic_uuid,
            "00002b7e-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(settings.ble.refresh_policy, RefreshPolicy::Clear);
        assert!(settings.ble.scan_service_filter.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "ble": { "refresh_policy": "keep", "write_timeout_ms": 250 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.ble.refresh_policy, RefreshPolicy::Keep);
        assert_eq!(settings.ble.write_timeout_ms, 250);
        assert_eq!(settings.ble.connect_timeout_ms, 10_000);
        assert_eq!(settings.log_settings.level, "info");
        assert_eq!(settings.log_settings.rotation, LogRotation::Daily);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("ble_remote_controller_missing_settings.json");
        let _ = fs::remove_file(&path);

        let service = SettingsService::from_path(path);
        assert!(service.get().ble.scan_on_start);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "ble_remote_controller_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().ble.refresh_policy = RefreshPolicy::Keep;
        service.get_mut().log_settings.rotation = LogRotation::Never;
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().ble.refresh_policy, RefreshPolicy::Keep);
        assert_eq!(reloaded.get().log_settings.rotation, LogRotation::Never);
        let _ = fs::remove_file(path);
    }
}
