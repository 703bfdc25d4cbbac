//! Shared test utilities: definition/config YAML and pre-wired fixtures.
//!
//! These builders de-duplicate fixture construction across the config,
//! hardware, feature, cover, and discovery tests. The hardware YAML mirrors
//! a trimmed L203 layout (three boards, DI/DO/LED/RO groups) plus an Eastron
//! SDM120M extension with a handful of measurands.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::config::Config;
use crate::features::FeatureMap;
use crate::hardware::{Extension, HardwareDefinition, HardwareInfo, HardwareMap};
use crate::modbus::{Board, CoilWrite, ProbedExtension, write_channel};
use crate::registers::{Bus, SharedCache, shared_cache};

pub const NEURON_DEFINITION_YAML: &str = "\
manufacturer: Unipi
model: MOCKED_MODEL
modbus_register_blocks:
    # DI 1.x / DO 1.x
  - board_index: 1
    start_reg: 0
    count: 2
    # LED 1.x
  - board_index: 1
    start_reg: 20
    count: 1
    # DI 2.x / RO 2.x
  - board_index: 2
    start_reg: 100
    count: 2
    # DI 3.x / RO 3.x
  - board_index: 3
    start_reg: 200
    count: 2
modbus_features:
  - feature_type: DI
    count: 4
    major_group: 1
    val_reg: 0
  - feature_type: DO
    count: 4
    major_group: 1
    val_reg: 1
    val_coil: 0
  - feature_type: LED
    major_group: 1
    count: 4
    val_coil: 8
    val_reg: 20
  - feature_type: DI
    count: 16
    major_group: 2
    val_reg: 100
  - feature_type: RO
    major_group: 2
    count: 14
    val_reg: 101
    val_coil: 100
  - feature_type: DI
    count: 16
    major_group: 3
    val_reg: 200
  - feature_type: RO
    major_group: 3
    count: 14
    val_reg: 201
    val_coil: 200
";

pub const EASTRON_DEFINITION_YAML: &str = "\
manufacturer: Eastron
model: SDM120M
modbus_register_blocks:
  - start_reg: 0
    count: 2
  - start_reg: 6
    count: 2
  - start_reg: 12
    count: 2
  - start_reg: 18
    count: 2
  - start_reg: 24
    count: 2
  - start_reg: 30
    count: 2
  - start_reg: 70
    count: 6
  - start_reg: 342
    count: 2
modbus_features:
  - feature_type: METER
    friendly_name: Voltage
    device_class: voltage
    state_class: measurement
    unit_of_measurement: V
    val_reg: 0
  - feature_type: METER
    friendly_name: Current
    device_class: current
    state_class: measurement
    unit_of_measurement: A
    val_reg: 6
  - feature_type: METER
    friendly_name: Active power
    device_class: power
    state_class: measurement
    unit_of_measurement: W
    val_reg: 12
  - feature_type: METER
    friendly_name: Apparent power
    device_class: apparent_power
    state_class: measurement
    unit_of_measurement: VA
    val_reg: 18
  - feature_type: METER
    friendly_name: Reactive power
    device_class: reactive_power
    state_class: measurement
    unit_of_measurement: var
    val_reg: 24
  - feature_type: METER
    friendly_name: Power factor
    device_class: power_factor
    state_class: measurement
    val_reg: 30
  - feature_type: METER
    friendly_name: Frequency
    device_class: frequency
    state_class: measurement
    unit_of_measurement: Hz
    val_reg: 70
  - feature_type: METER
    friendly_name: Imported energy
    device_class: energy
    state_class: total_increasing
    unit_of_measurement: kWh
    val_reg: 72
  - feature_type: METER
    friendly_name: Exported energy
    device_class: energy
    state_class: total_increasing
    unit_of_measurement: kWh
    val_reg: 74
  - feature_type: METER
    friendly_name: Total energy
    device_class: energy
    state_class: total_increasing
    unit_of_measurement: kWh
    val_reg: 342
";

pub const CONFIG_YAML: &str = "\
device_info:
  name: MOCKED UNIPI
mqtt:
  host: localhost
  port: 1883
modbus_serial:
  units:
    - unit: 1
      identifier: MOCKED_EASTRON
      device_name: MOCKED Eastron
";

pub const COVER_CONFIG_YAML: &str = "\
device_info:
  name: MOCKED UNIPI
covers:
  - object_id: blind_1
    friendly_name: Blind 1
    device_class: blind
    cover_run_time: 10.0
    tilt_change_time: 0.0
    cover_up: ro_3_01
    cover_down: ro_3_02
modbus_serial:
  units:
    - unit: 1
      identifier: MOCKED_EASTRON
";

/// Unique scratch directory, removed on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "unipi-control-test-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id(),
        ));
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn test_config(yaml: &str) -> Config {
    Config::from_yaml(yaml, Path::new("/tmp")).unwrap()
}

/// Hardware map with a mocked EEPROM identity and one extension at unit 1.
pub fn hardware_map(neuron_yaml: &str, eastron_yaml: &str) -> HardwareMap {
    HardwareMap {
        info: HardwareInfo {
            name: "MOCKED_NAME".to_string(),
            model: "MOCKED_MODEL".to_string(),
            version: "MOCKED_VERSION".to_string(),
            serial: 0,
        },
        neuron: HardwareDefinition::parse(neuron_yaml).unwrap(),
        extensions: vec![Extension {
            unit: 1,
            device_name: Some("MOCKED Eastron".to_string()),
            suggested_area: None,
            definition: HardwareDefinition::parse(eastron_yaml).unwrap(),
        }],
    }
}

/// Cache, write queues, and a fully built feature map for one mocked PLC.
pub struct TestRig {
    pub config: Config,
    pub hardware: HardwareMap,
    pub cache: SharedCache,
    pub features: FeatureMap,
    pub tcp_writes: mpsc::Receiver<CoilWrite>,
    pub rtu_writes: mpsc::Receiver<CoilWrite>,
}

impl TestRig {
    pub fn new(config_yaml: &str) -> Self {
        let config = test_config(config_yaml);
        let hardware = hardware_map(NEURON_DEFINITION_YAML, EASTRON_DEFINITION_YAML);
        let cache = shared_cache();
        let (tcp_tx, tcp_rx) = write_channel();
        let (rtu_tx, rtu_rx) = write_channel();

        let boards = vec![
            Board { index: 1, firmware: "0.0".to_string() },
            Board { index: 2, firmware: "0.0".to_string() },
            Board { index: 3, firmware: "0.0".to_string() },
        ];
        let extensions = vec![ProbedExtension { unit: 1, firmware: Some("2.4".to_string()) }];

        let features =
            FeatureMap::build(&config, &hardware, &boards, &extensions, &cache, &tcp_tx, &rtu_tx)
                .unwrap();

        Self { config, hardware, cache, features, tcp_writes: tcp_rx, rtu_writes: rtu_rx }
    }

    /// Drain queued TCP coil writes without blocking.
    pub fn drain_tcp_writes(&mut self) -> Vec<CoilWrite> {
        let mut writes = Vec::new();
        while let Ok(write) = self.tcp_writes.try_recv() {
            writes.push(write);
        }
        writes
    }

    /// Play queued TCP coil writes back into the cache the way a scan tick
    /// would observe them on the mocked register layout.
    pub fn apply_tcp_writes(&mut self) -> Vec<CoilWrite> {
        let writes = self.drain_tcp_writes();
        for write in &writes {
            let (reg, bit) = coil_register(write.unit, write.coil)
                .unwrap_or_else(|| panic!("no register mapping for coil {}", write.coil));
            set_cache_bit(&self.cache, write.unit, reg, bit, write.value);
        }
        writes
    }
}

/// Coil-to-register mapping of the mocked definition above.
pub fn coil_register(unit: u8, coil: u16) -> Option<(u16, u16)> {
    match (unit, coil) {
        (1, 0..=3) => Some((1, coil)),
        (1, 8..=11) => Some((20, coil - 8)),
        (2, 100..=113) => Some((101, coil - 100)),
        (3, 200..=213) => Some((201, coil - 200)),
        _ => None,
    }
}

/// Flip one observed input/output bit, as if a scan tick had read it.
pub fn set_cache_bit(cache: &SharedCache, unit: u8, reg: u16, bit: u16, value: bool) {
    let mut cache = cache.lock().unwrap();
    let mut word = cache.word(Bus::Tcp, unit, reg).unwrap_or(0);
    if value {
        word |= 1 << bit;
    } else {
        word &= !(1 << bit);
    }
    cache.update_block(Bus::Tcp, unit, reg, &[word]);
}
