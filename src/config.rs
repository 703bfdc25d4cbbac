/*!
Typed configuration for `control.yaml`.

Purpose:
- Deserialize the daemon configuration with serde and validate it with one
  explicit validator per record. A failed validation is a `ConfigError`
  naming the offending key and value; there is no field introspection.

Notes:
- `retry_limit` absent (or 0) means unbounded MQTT reconnect attempts.
- Cover circuits may appear at most once across all covers. Driving both
  motor signals at once can damage the motor, so this is fatal at startup.
*/

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/unipi";

/// Cover kinds understood by the cover engine (and Home Assistant).
pub const COVER_DEVICE_CLASSES: &[&str] = &["blind", "roller_shutter", "garage_door", "awning"];

const ALLOWED_BAUD_RATES: &[u32] = &[2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Lowercase a name into the `[a-z0-9_-]` topic alphabet.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn is_slug(value: &str) -> bool {
    value.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_'))
}

fn check_slug(key: &str, value: &str) -> Result<(), ConfigError> {
    if is_slug(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSlug { key: key.to_string(), value: value.to_string() })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
    pub suggested_area: Option<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "unipi".to_string(),
            manufacturer: "Unipi technology".to_string(),
            suggested_area: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive: u64,
    pub retry_limit: Option<u32>,
    pub reconnect_interval: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive: 15,
            retry_limit: Some(30),
            reconnect_interval: 10,
        }
    }
}

impl MqttConfig {
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Whether `attempts` consecutive failed connections exhaust the retry
    /// limit. No (or zero) limit means retrying forever.
    pub fn retry_exhausted(&self, attempts: u32) -> bool {
        match self.retry_limit {
            Some(limit) if limit > 0 => attempts >= limit,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub enabled: bool,
    pub discovery_prefix: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self { enabled: true, discovery_prefix: "homeassistant".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusTcpConfig {
    pub host: String,
    pub port: u16,
    pub scan_interval: f64,
}

impl Default for ModbusTcpConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 502, scan_interval: 0.02 }
    }
}

impl ModbusTcpConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModbusSerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub parity: String,
    pub scan_interval: f64,
    pub units: Vec<UnitConfig>,
}

impl Default for ModbusSerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/extcomm/0/0".to_string(),
            baud_rate: 2400,
            parity: "N".to_string(),
            scan_interval: 25.0,
            units: Vec::new(),
        }
    }
}

impl ModbusSerialConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs_f64(self.scan_interval)
    }
}

/// One RTU extension declared in `modbus_serial.units`.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub unit: u8,
    /// Selects `hardware/extensions/<identifier>.yaml`.
    pub identifier: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub suggested_area: Option<String>,
}

/// Per-circuit feature overrides, keyed by circuit id in `features`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureConfig {
    /// Optional replacement id, prefixed onto the circuit id.
    pub id: Option<String>,
    pub friendly_name: Option<String>,
    pub suggested_area: Option<String>,
    pub invert_state: bool,
    pub device_class: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverConfig {
    pub object_id: String,
    pub friendly_name: Option<String>,
    pub suggested_area: Option<String>,
    pub device_class: String,
    /// Seconds for a full-range move (`full_travel_seconds`).
    pub cover_run_time: f64,
    /// Seconds the tilt sub-position needs for its full range; 0 disables tilt.
    pub tilt_change_time: f64,
    pub cover_up: String,
    pub cover_down: String,
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            object_id: String::new(),
            friendly_name: None,
            suggested_area: None,
            device_class: String::new(),
            cover_run_time: 0.0,
            tilt_change_time: 0.0,
            cover_up: String::new(),
            cover_down: String::new(),
        }
    }
}

impl CoverConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("object_id", &self.object_id),
            ("device_class", &self.device_class),
            ("cover_up", &self.cover_up),
            ("cover_down", &self.cover_down),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingCoverKey {
                    object_id: self.object_id.clone(),
                    key: key.to_string(),
                });
            }
        }

        check_slug("covers.object_id", &self.object_id)?;

        if !COVER_DEVICE_CLASSES.contains(&self.device_class.as_str()) {
            return Err(ConfigError::InvalidCoverDeviceClass {
                value: self.device_class.clone(),
                allowed: COVER_DEVICE_CLASSES.join(" "),
            });
        }

        if self.cover_run_time <= 0.0 {
            return Err(ConfigError::InvalidCoverRunTime {
                object_id: self.object_id.clone(),
                value: format!("{}", self.cover_run_time),
            });
        }

        Ok(())
    }

    pub fn run_time(&self) -> Duration {
        Duration::from_secs_f64(self.cover_run_time)
    }

    pub fn tilt_time(&self) -> Duration {
        Duration::from_secs_f64(self.tilt_change_time)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    /// Use `/var/tmp/unipi` instead of `/tmp/unipi` for scratch files.
    pub persistent_tmp_dir: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_info: DeviceInfo,
    pub mqtt: MqttConfig,
    pub homeassistant: HomeAssistantConfig,
    pub modbus_tcp: ModbusTcpConfig,
    pub modbus_serial: ModbusSerialConfig,
    pub features: HashMap<String, FeatureConfig>,
    pub covers: Vec<CoverConfig>,
    pub logging: LoggingConfig,
    pub advanced: AdvancedConfig,

    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_info: DeviceInfo::default(),
            mqtt: MqttConfig::default(),
            homeassistant: HomeAssistantConfig::default(),
            modbus_tcp: ModbusTcpConfig::default(),
            modbus_serial: ModbusSerialConfig::default(),
            features: HashMap::new(),
            covers: Vec::new(),
            logging: LoggingConfig::default(),
            advanced: AdvancedConfig::default(),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }
}

impl Config {
    /// Read and validate `<dir>/control.yaml`. A missing file yields the
    /// defaults (the daemon can run on hardware definitions alone).
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("control.yaml");

        let mut config: Config = if path.exists() {
            let text = fs::read_to_string(&path)
                .map_err(|e| ConfigError::Yaml { path: path.clone(), reason: e.to_string() })?;
            serde_yaml::from_str(&text)
                .map_err(|e| ConfigError::Yaml { path: path.clone(), reason: e.to_string() })?
        } else {
            Config::default()
        };

        config.config_dir = dir.to_path_buf();
        config.validate()?;
        config.create_tmp_dir()?;

        Ok(config)
    }

    /// Parse from a YAML string (tests and tooling).
    pub fn from_yaml(text: &str, dir: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(text).map_err(|e| ConfigError::Yaml {
            path: dir.join("control.yaml"),
            reason: e.to_string(),
        })?;
        config.config_dir = dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_slug("homeassistant.discovery_prefix", &self.homeassistant.discovery_prefix)?;

        if logging_level_unknown(&self.logging.level) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if !ALLOWED_BAUD_RATES.contains(&self.modbus_serial.baud_rate) {
            return Err(ConfigError::InvalidBaudRate { value: self.modbus_serial.baud_rate });
        }

        if !matches!(self.modbus_serial.parity.as_str(), "N" | "E" | "O") {
            return Err(ConfigError::InvalidParity { value: self.modbus_serial.parity.clone() });
        }

        for (circuit, feature) in &self.features {
            if let Some(id) = &feature.id {
                check_slug(&format!("features.{circuit}.id"), id)?;
            }
        }

        for cover in &self.covers {
            cover.validate()?;
        }
        self.validate_cover_circuits()?;
        self.validate_cover_object_ids()?;

        Ok(())
    }

    fn validate_cover_circuits(&self) -> Result<(), ConfigError> {
        let circuits = self.cover_circuits();
        for circuit in &circuits {
            if circuits.iter().filter(|c| c == &circuit).count() > 1 {
                return Err(ConfigError::DuplicateCoverCircuit);
            }
        }
        Ok(())
    }

    fn validate_cover_object_ids(&self) -> Result<(), ConfigError> {
        for (i, cover) in self.covers.iter().enumerate() {
            if self.covers[..i].iter().any(|c| c.object_id == cover.object_id) {
                return Err(ConfigError::DuplicateObjectId(cover.object_id.clone()));
            }
        }
        Ok(())
    }

    /// All relay circuits claimed by covers. These are not exposed as MQTT
    /// switches; the cover owns them.
    pub fn cover_circuits(&self) -> Vec<String> {
        self.covers
            .iter()
            .flat_map(|c| [c.cover_up.clone(), c.cover_down.clone()])
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Topic and discovery slug of this device.
    pub fn device_slug(&self) -> String {
        slugify(&self.device_info.name)
    }

    pub fn hardware_dir(&self) -> PathBuf {
        self.config_dir.join("hardware")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        if self.advanced.persistent_tmp_dir {
            PathBuf::from("/var/tmp/unipi")
        } else {
            PathBuf::from("/tmp/unipi")
        }
    }

    fn create_tmp_dir(&self) -> Result<(), ConfigError> {
        let path = self.tmp_dir();
        fs::create_dir_all(&path).map_err(|source| ConfigError::TempDir { path, source })
    }
}

fn logging_level_unknown(level: &str) -> bool {
    crate::logging::config_level(level).is_none()
}
