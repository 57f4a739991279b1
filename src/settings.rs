//! # Bridge Settings
//!
//! Runtime configuration layered from two sources: an optional TOML file,
//! then environment variable overrides on top. Container deployments set
//! only the environment; a config file is convenient for bare installs.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `MODBUS_HOST` | `modbus.host` | required |
//! | `MODBUS_PORT` | `modbus.port` | 502 |
//! | `MODBUS_TIMEOUT` | `modbus.timeout_secs` | 5 |
//! | `MODBUS_SLAVE_ID` | `modbus.slave_id` | 20 |
//! | `MQTT_HOST` | `mqtt.host` | localhost |
//! | `MQTT_PORT` | `mqtt.port` | 1883 |
//! | `MQTT_USERNAME` | `mqtt.username` | none |
//! | `MQTT_PASSWORD` | `mqtt.password` | none |
//! | `MQTT_MAIN_UID` | `mqtt.main_uid` | kronoterm |
//! | `HEAT_PUMP_DEFINITIONS` | `device.definitions` | definitions/kronoterm.toml |
//! | `HEAT_PUMP_DEVICE_NAME` | `device.name` | Heat Pump |
//! | `HEAT_PUMP_MODEL` | `device.model` | Adapt |
//! | `POLLING_INTERVAL` | `polling_interval_secs` | 10 |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BridgeError, BridgeResult};

/// Default Modbus unit id of Kronoterm heat-pump controllers.
pub const DEFAULT_SLAVE_ID: u8 = 20;

/// Top-level bridge settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub modbus: ModbusSettings,
    pub mqtt: MqttSettings,
    pub device: DeviceSettings,
    /// Seconds between poll cycles; also the fixed retry delay.
    pub polling_interval_secs: u64,
}

/// Modbus TCP connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    pub host: Option<String>,
    pub port: u16,
    pub timeout_secs: u64,
    pub slave_id: u8,
}

/// MQTT broker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root topic segment and device identifier.
    pub main_uid: String,
}

/// Published device identity and definition table location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub definitions: PathBuf,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            modbus: ModbusSettings::default(),
            mqtt: MqttSettings::default(),
            device: DeviceSettings::default(),
            polling_interval_secs: 10,
        }
    }
}

impl Default for ModbusSettings {
    fn default() -> Self {
        ModbusSettings {
            host: None,
            port: 502,
            timeout_secs: 5,
            slave_id: DEFAULT_SLAVE_ID,
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            main_uid: "kronoterm".to_string(),
        }
    }
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            definitions: PathBuf::from("definitions/kronoterm.toml"),
            name: "Heat Pump".to_string(),
            model: "Adapt".to_string(),
            manufacturer: "Kronoterm".to_string(),
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the optional config file, then
    /// environment overrides. Fails fast on anything unparsable.
    pub fn load(config_path: Option<&Path>) -> BridgeResult<Self> {
        let mut settings = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    BridgeError::configuration(format!(
                        "Cannot read config file {}: {e}",
                        path.display()
                    ))
                })?;
                toml::from_str(&text).map_err(|e| {
                    BridgeError::configuration(format!(
                        "Invalid config file {}: {e}",
                        path.display()
                    ))
                })?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment-style overrides from a lookup function.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MODBUS_HOST") {
            self.modbus.host = Some(host);
        }
        if let Some(port) = lookup("MODBUS_PORT") {
            self.modbus.port = parse_var("MODBUS_PORT", &port)?;
        }
        if let Some(timeout) = lookup("MODBUS_TIMEOUT") {
            self.modbus.timeout_secs = parse_var("MODBUS_TIMEOUT", &timeout)?;
        }
        if let Some(slave_id) = lookup("MODBUS_SLAVE_ID") {
            self.modbus.slave_id = parse_var("MODBUS_SLAVE_ID", &slave_id)?;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_var("MQTT_PORT", &port)?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(main_uid) = lookup("MQTT_MAIN_UID") {
            self.mqtt.main_uid = main_uid;
        }
        if let Some(definitions) = lookup("HEAT_PUMP_DEFINITIONS") {
            self.device.definitions = PathBuf::from(definitions);
        }
        if let Some(name) = lookup("HEAT_PUMP_DEVICE_NAME") {
            self.device.name = name;
        }
        if let Some(model) = lookup("HEAT_PUMP_MODEL") {
            self.device.model = model;
        }
        if let Some(interval) = lookup("POLLING_INTERVAL") {
            self.polling_interval_secs = parse_var("POLLING_INTERVAL", &interval)?;
        }
        Ok(())
    }

    fn validate(&self) -> BridgeResult<()> {
        if self.modbus.host.is_none() {
            return Err(BridgeError::configuration(
                "Modbus host is not set (set MODBUS_HOST or modbus.host)",
            ));
        }
        if self.polling_interval_secs == 0 {
            return Err(BridgeError::configuration(
                "Polling interval must be at least 1 second",
            ));
        }
        Ok(())
    }

    /// Poll cadence as a duration.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

impl ModbusSettings {
    /// Per-request timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> BridgeResult<T> {
    value
        .parse()
        .map_err(|_| BridgeError::configuration(format!("Invalid value '{value}' for {name}")))
}

// ============================================================================
// Tests
// ============================================================================
