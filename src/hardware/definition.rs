/*!
Hardware definition YAML: register blocks and feature templates.

A board or extension definition declares which contiguous register ranges
the scanner reads (`modbus_register_blocks`) and which features those
registers expand into (`modbus_features`). Everything here is a
deterministic function of the YAML; no I/O happens after load.
*/

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::HardwareError;
use crate::features::FeatureKind;

/// Register table a block is read from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    #[default]
    Input,
    Holding,
    Coil,
}

/// A contiguous register range scanned as a single Modbus read.
#[derive(Copy, Clone, Debug, Deserialize)]
pub struct RegisterBlockDef {
    /// SPI board (and Modbus unit) the block belongs to. Extensions leave
    /// this at 1 and carry their unit in the runtime configuration.
    #[serde(default = "default_group")]
    pub board_index: u8,
    pub start_reg: u16,
    pub count: u16,
    #[serde(default)]
    pub register_type: RegisterType,
}

/// Template expanding into `count` concrete features.
#[derive(Clone, Debug, Deserialize)]
pub struct FeatureTemplate {
    pub feature_type: FeatureKind,
    #[serde(default = "default_group")]
    pub major_group: u8,
    #[serde(default = "default_count")]
    pub count: u16,
    pub val_reg: u16,
    #[serde(default)]
    pub val_coil: Option<u16>,
    /// Meter measurand name; also seeds the meter's object id.
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(default)]
    pub state_class: Option<String>,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    /// Decimal places for rendered meter values.
    #[serde(default = "default_precision")]
    pub precision: usize,
}

fn default_group() -> u8 {
    1
}

fn default_count() -> u16 {
    1
}

fn default_precision() -> usize {
    2
}

/// One parsed definition file (PLC model or extension).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HardwareDefinition {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub modbus_register_blocks: Vec<RegisterBlockDef>,
    #[serde(default)]
    pub modbus_features: Vec<FeatureTemplate>,
}

impl HardwareDefinition {
    pub fn load(path: &Path) -> Result<Self, HardwareError> {
        let text = fs::read_to_string(path).map_err(|e| HardwareError::Definition {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|reason| HardwareError::Definition {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    }

    /// Blocks belonging to one board, in declaration order.
    pub fn blocks_for_board(&self, board_index: u8) -> impl Iterator<Item = &RegisterBlockDef> {
        self.modbus_register_blocks.iter().filter(move |b| b.board_index == board_index)
    }

    /// Templates belonging to one board group, in declaration order.
    pub fn templates_for_group(&self, major_group: u8) -> impl Iterator<Item = &FeatureTemplate> {
        self.modbus_features.iter().filter(move |t| t.major_group == major_group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::NEURON_DEFINITION_YAML;

    #[test]
    fn neuron_definition_parses() {
        let definition = HardwareDefinition::parse(NEURON_DEFINITION_YAML).unwrap();
        assert_eq!(definition.modbus_register_blocks.len(), 4);
        assert_eq!(definition.modbus_features.len(), 7);

        let led = definition
            .modbus_features
            .iter()
            .find(|t| t.feature_type == FeatureKind::Led)
            .unwrap();
        assert_eq!(led.val_reg, 20);
        assert_eq!(led.val_coil, Some(8));
        assert_eq!(led.count, 4);
    }

    #[test]
    fn blocks_filter_by_board() {
        let definition = HardwareDefinition::parse(NEURON_DEFINITION_YAML).unwrap();
        let board_1: Vec<u16> = definition.blocks_for_board(1).map(|b| b.start_reg).collect();
        assert_eq!(board_1, vec![0, 20]);
        let board_2: Vec<u16> = definition.blocks_for_board(2).map(|b| b.start_reg).collect();
        assert_eq!(board_2, vec![100]);
    }

    #[test]
    fn register_type_defaults_to_input() {
        let definition =
            HardwareDefinition::parse("modbus_register_blocks:\n  - start_reg: 0\n    count: 2\n")
                .unwrap();
        assert_eq!(definition.modbus_register_blocks[0].register_type, RegisterType::Input);
        assert_eq!(definition.modbus_register_blocks[0].board_index, 1);
    }

    #[test]
    fn malformed_definition_is_an_error() {
        assert!(HardwareDefinition::parse("modbus_register_blocks: 5\n").is_err());
    }
}
