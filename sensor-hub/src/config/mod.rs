//! Daemon configuration.
//!
//! Read from the process environment (after `.env` has been loaded).

pub mod settings;

use std::path::PathBuf;

use crate::domain::DeviceIdentity;
use crate::{Error, Result};

pub use settings::JsonSettingsStore;

pub const ENV_LOG_DIR: &str = "SENSOR_HUB_LOG_DIR";
pub const ENV_SETTINGS: &str = "SENSOR_HUB_SETTINGS";
pub const ENV_DEVICES: &str = "SENSOR_HUB_DEVICES";
pub const ENV_MANUAL: &str = "SENSOR_HUB_MANUAL";
pub const ENV_OUTPUT_DIR: &str = "SENSOR_HUB_OUTPUT_DIR";
pub const ENV_AUTO_START: &str = "SENSOR_HUB_AUTO_START";
pub const ENV_RUN_IMMEDIATELY: &str = "SENSOR_HUB_RUN_IMMEDIATELY";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
    /// Devices announced at startup, already resolved.
    pub devices: Vec<DeviceIdentity>,
    /// IPv4 addresses or `EVBS_` hostnames to resolve at startup.
    pub manual: Vec<String>,
    /// Root folder for devices whose settings have no output location.
    pub output_dir: Option<PathBuf>,
    /// Start every runnable device once discovery has run.
    pub auto_start: bool,
    pub run_immediately: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            settings_path: PathBuf::from("sensor-hub-settings.json"),
            devices: Vec::new(),
            manual: Vec::new(),
            output_dir: None,
            auto_start: false,
            run_immediately: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or blank variables keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(dir) = var(ENV_LOG_DIR) {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = var(ENV_SETTINGS) {
            config.settings_path = PathBuf::from(path);
        }
        if let Some(list) = var(ENV_DEVICES) {
            config.devices = parse_devices(&list)?;
        }
        if let Some(list) = var(ENV_MANUAL) {
            config.manual = split_list(&list).map(str::to_string).collect();
        }
        config.output_dir = var(ENV_OUTPUT_DIR).map(PathBuf::from);
        if let Some(value) = var(ENV_AUTO_START) {
            config.auto_start = parse_bool(ENV_AUTO_START, &value)?;
        }
        if let Some(value) = var(ENV_RUN_IMMEDIATELY) {
            config.run_immediately = parse_bool(ENV_RUN_IMMEDIATELY, &value)?;
        }
        Ok(config)
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Parse `name=address` pairs.
fn parse_devices(list: &str) -> Result<Vec<DeviceIdentity>> {
    split_list(list)
        .map(|entry| match entry.split_once('=') {
            Some((name, address)) if !name.trim().is_empty() && !address.trim().is_empty() => {
                Ok(DeviceIdentity::new(name.trim(), address.trim()))
            }
            _ => Err(Error::config(format!(
                "{ENV_DEVICES}: expected name=address, got '{entry}'"
            ))),
        })
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{key}: invalid boolean '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_full_environment() {
        let config = AppConfig::from_lookup(lookup(&[
            (ENV_LOG_DIR, "/var/log/sensor-hub"),
            (ENV_SETTINGS, "/etc/sensor-hub.json"),
            (ENV_DEVICES, "EVBS_01=10.0.0.2, EVBS_02 = 10.0.0.3,"),
            (ENV_MANUAL, "192.168.1.40,EVBS_7F3A"),
            (ENV_OUTPUT_DIR, "/data"),
            (ENV_AUTO_START, "yes"),
            (ENV_RUN_IMMEDIATELY, "0"),
        ]))
        .unwrap();

        assert_eq!(config.log_dir, PathBuf::from("/var/log/sensor-hub"));
        assert_eq!(config.settings_path, PathBuf::from("/etc/sensor-hub.json"));
        assert_eq!(
            config.devices,
            vec![
                DeviceIdentity::new("EVBS_01", "10.0.0.2"),
                DeviceIdentity::new("EVBS_02", "10.0.0.3"),
            ]
        );
        assert_eq!(config.manual, vec!["192.168.1.40", "EVBS_7F3A"]);
        assert_eq!(config.output_dir, Some(PathBuf::from("/data")));
        assert!(config.auto_start);
        assert!(!config.run_immediately);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        let err = AppConfig::from_lookup(lookup(&[(ENV_DEVICES, "EVBS_01")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = AppConfig::from_lookup(lookup(&[(ENV_AUTO_START, "maybe")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
