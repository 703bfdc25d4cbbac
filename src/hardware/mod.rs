/*!
Hardware identification and definition loading.

Purpose:
- Identify the PLC family and model from the I²C sys-bus EEPROMs. The model
  selects the board definition file; a missing EEPROM or definition is fatal
  at startup.
- Load the board definition plus one definition per declared RTU extension
  into a [`HardwareMap`]. The map is consulted by the scanner (register
  blocks) and the feature model (feature templates) and does no I/O after
  load.

EEPROM layouts:
- Unipi 1 (`1-0050`): 256 bytes; bytes 226/227 select the variant, a 4-byte
  serial follows at 228.
- Patron/Neuron (`2-0057`, `1-0057`, `0-0057`): 128 bytes; ASCII model at
  106..110, version encoded at bytes 99 (major) and 98 (minor), 4-byte
  serial at 100.
*/

pub mod definition;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::error::HardwareError;
use crate::logging::prefix;

pub use definition::{FeatureTemplate, HardwareDefinition, RegisterBlockDef, RegisterType};

/// Identity of the PLC read from its EEPROM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HardwareInfo {
    pub name: String,
    pub model: String,
    pub version: String,
    pub serial: u32,
}

impl HardwareInfo {
    pub const SYS_BUS: &'static str = "/sys/bus/i2c/devices";

    /// Probe the known EEPROM paths in order and decode the first match.
    pub fn read(sys_bus: &Path) -> Result<Self, HardwareError> {
        let unipi_1 = sys_bus.join("1-0050/eeprom");
        if unipi_1.is_file() {
            return Self::read_unipi_1(&unipi_1);
        }

        for (path, name) in [
            (sys_bus.join("2-0057/eeprom"), "Unipi Patron"),
            (sys_bus.join("1-0057/eeprom"), "Unipi Neuron"),
            (sys_bus.join("0-0057/eeprom"), "Unipi Neuron"),
        ] {
            if path.is_file() {
                return Self::read_neuron(&path, name);
            }
        }

        Err(HardwareError::NoEeprom(sys_bus.to_path_buf()))
    }

    fn read_unipi_1(path: &Path) -> Result<Self, HardwareError> {
        let bytes = read_eeprom(path, 256)?;
        let (name, version) = match (bytes[226], bytes[227]) {
            (1, 1) => ("Unipi", "1.1"),
            (11, 1) => ("Unipi Lite", "1.1"),
            _ => ("Unipi", "1.0"),
        };
        Ok(Self {
            name: name.to_string(),
            model: "unknown".to_string(),
            version: version.to_string(),
            serial: u32::from_le_bytes([bytes[228], bytes[229], bytes[230], bytes[231]]),
        })
    }

    fn read_neuron(path: &Path, name: &str) -> Result<Self, HardwareError> {
        let bytes = read_eeprom(path, 128)?;
        Ok(Self {
            name: name.to_string(),
            model: String::from_utf8_lossy(&bytes[106..110]).trim_end_matches('\0').to_string(),
            version: format!("{}.{}", bytes[99], bytes[98]),
            serial: u32::from_le_bytes([bytes[100], bytes[101], bytes[102], bytes[103]]),
        })
    }
}

fn read_eeprom(path: &Path, len: usize) -> Result<Vec<u8>, HardwareError> {
    let bytes = fs::read(path)
        .map_err(|source| HardwareError::Eeprom { path: path.to_path_buf(), source })?;
    if bytes.len() < len {
        return Err(HardwareError::Eeprom {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected at least {len} bytes, got {}", bytes.len()),
            ),
        });
    }
    Ok(bytes)
}

/// One RTU extension: unit wiring from the configuration plus its parsed
/// definition file.
#[derive(Clone, Debug)]
pub struct Extension {
    pub unit: u8,
    pub device_name: Option<String>,
    pub suggested_area: Option<String>,
    pub definition: HardwareDefinition,
}

/// All loaded definitions: the PLC board plus declared extensions.
#[derive(Clone, Debug)]
pub struct HardwareMap {
    pub info: HardwareInfo,
    pub neuron: HardwareDefinition,
    pub extensions: Vec<Extension>,
}

impl HardwareMap {
    /// Load `<config>/hardware/neuron/<MODEL>.yaml` and one
    /// `<config>/hardware/extensions/<identifier>.yaml` per declared unit.
    pub fn load(config: &Config, info: HardwareInfo) -> Result<Self, HardwareError> {
        let hardware_dir = config.hardware_dir();

        let neuron_path = hardware_dir.join("neuron").join(format!("{}.yaml", info.model));
        if !neuron_path.is_file() {
            return Err(HardwareError::MissingDefinition(info.model.clone()));
        }
        let neuron = HardwareDefinition::load(&neuron_path)?;
        debug!("{} YAML definition loaded: {}", prefix::CONFIG, neuron_path.display());

        let mut extensions = Vec::new();
        for unit in &config.modbus_serial.units {
            let path: PathBuf =
                hardware_dir.join("extensions").join(format!("{}.yaml", unit.identifier));
            if !path.is_file() {
                return Err(HardwareError::MissingExtensionDefinition(unit.identifier.clone()));
            }
            let definition = HardwareDefinition::load(&path)?;
            debug!("{} YAML definition loaded: {}", prefix::CONFIG, path.display());

            extensions.push(Extension {
                unit: unit.unit,
                device_name: unit.device_name.clone(),
                suggested_area: unit.suggested_area.clone(),
                definition,
            });
        }

        info!(
            "{} {} hardware definition(s) found.",
            prefix::CONFIG,
            1 + extensions.len()
        );

        Ok(Self { info, neuron, extensions })
    }

    /// Display model, e.g. "Unipi Neuron L203".
    pub fn device_model(&self) -> String {
        format!("{} {}", self.info.name, self.info.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestDir;

    fn neuron_eeprom(model: &[u8; 4], major: u8, minor: u8, serial: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; 128];
        bytes[106..110].copy_from_slice(model);
        bytes[99] = major;
        bytes[98] = minor;
        bytes[100..104].copy_from_slice(&serial.to_le_bytes());
        bytes
    }

    #[test]
    fn neuron_eeprom_decodes_model_version_serial() {
        let dir = TestDir::new("hardware-neuron");
        dir.write("1-0057/eeprom", &neuron_eeprom(b"L203", 1, 2, 0xDEAD_BEEF));

        let info = HardwareInfo::read(dir.path()).unwrap();
        assert_eq!(info.name, "Unipi Neuron");
        assert_eq!(info.model, "L203");
        assert_eq!(info.version, "1.2");
        assert_eq!(info.serial, 0xDEAD_BEEF);
    }

    #[test]
    fn patron_eeprom_wins_over_neuron_paths() {
        let dir = TestDir::new("hardware-patron");
        dir.write("2-0057/eeprom", &neuron_eeprom(b"M523", 2, 0, 7));
        dir.write("1-0057/eeprom", &neuron_eeprom(b"L203", 1, 0, 8));

        let info = HardwareInfo::read(dir.path()).unwrap();
        assert_eq!(info.name, "Unipi Patron");
        assert_eq!(info.model, "M523");
    }

    #[test]
    fn unipi_1_variants_decode_from_flag_bytes() {
        let dir = TestDir::new("hardware-unipi1");
        let mut bytes = vec![0u8; 256];
        bytes[226] = 11;
        bytes[227] = 1;
        bytes[228..232].copy_from_slice(&42u32.to_le_bytes());
        dir.write("1-0050/eeprom", &bytes);

        let info = HardwareInfo::read(dir.path()).unwrap();
        assert_eq!(info.name, "Unipi Lite");
        assert_eq!(info.version, "1.1");
        assert_eq!(info.serial, 42);
    }

    #[test]
    fn missing_eeprom_is_fatal() {
        let dir = TestDir::new("hardware-missing");
        assert!(matches!(HardwareInfo::read(dir.path()), Err(HardwareError::NoEeprom(_))));
    }
}
