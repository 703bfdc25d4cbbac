/*!
Feature model: typed handles over register ranges.

Purpose:
- A feature is one user-visible I/O point (digital input, digital output,
  relay, LED, meter value) derived from the register cache. Binary features
  read a single bit of a value register; meters read a register pair as an
  IEEE-754 single.
- Outputs additionally carry a coil address. Writing goes through the bus
  scanner's write queue; the feature never touches the Modbus client.
- The `FeatureMap` holds every feature in definition order (board index,
  template order, bit index ascending). That order is user-visible through
  Home Assistant discovery.

Semantics:
- `payload()` renders "ON"/"OFF" after inversion for binary features and a
  fixed-precision decimal for meters.
- `changed()` is true iff the payload differs from the last value a
  publisher observed; `mark_published()` records that observation.
- `set_state()` is idempotent: requesting the currently observed raw state
  performs no bus write.
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{Config, slugify};
use crate::error::ConfigError;
use crate::hardware::{Extension, FeatureTemplate, HardwareMap};
use crate::modbus::{Board, CoilWrite, ProbedExtension};
use crate::registers::{Bus, SharedCache};

/// Binary payloads on the wire.
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

/// The five feature kinds, as named in the hardware definition YAML.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub enum FeatureKind {
    #[serde(rename = "DI")]
    DigitalInput,
    #[serde(rename = "DO")]
    DigitalOutput,
    #[serde(rename = "RO")]
    Relay,
    #[serde(rename = "LED")]
    Led,
    #[serde(rename = "METER")]
    Meter,
}

impl FeatureKind {
    /// Circuit id prefix, e.g. `ro` in `ro_2_01`.
    pub fn short(&self) -> &'static str {
        match self {
            FeatureKind::DigitalInput => "di",
            FeatureKind::DigitalOutput => "do",
            FeatureKind::Relay => "ro",
            FeatureKind::Led => "led",
            FeatureKind::Meter => "meter",
        }
    }

    /// Topic path component (`<device>/<component>/<object_id>`).
    pub fn topic_component(&self) -> &'static str {
        match self {
            FeatureKind::DigitalInput => "input",
            FeatureKind::DigitalOutput | FeatureKind::Relay => "relay",
            FeatureKind::Led => "led",
            FeatureKind::Meter => "meter",
        }
    }

    /// Human name used in default friendly names.
    pub fn human(&self) -> &'static str {
        match self {
            FeatureKind::DigitalInput => "Digital Input",
            FeatureKind::DigitalOutput => "Digital Output",
            FeatureKind::Relay => "Relay",
            FeatureKind::Led => "LED",
            FeatureKind::Meter => "Meter",
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(self, FeatureKind::DigitalOutput | FeatureKind::Relay | FeatureKind::Led)
    }
}

/// Register access pattern of a feature.
#[derive(Clone, Debug)]
pub enum FeatureIo {
    /// Single bit of the value register range at `val_reg`; outputs carry
    /// the coil used for writes.
    Bit { val_reg: u16, index: u16, coil: Option<u16> },
    /// Register pair decoded as IEEE-754 single.
    Float {
        val_reg: u16,
        precision: usize,
        unit_of_measurement: Option<String>,
        state_class: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("feature has no coil to write")]
    NotAnOutput,
    #[error("bus write queue is closed")]
    QueueClosed,
}

#[derive(Debug)]
pub struct Feature {
    pub kind: FeatureKind,
    pub bus: Bus,
    pub unit: u8,
    /// Hardware circuit id, e.g. `ro_2_01`.
    pub circuit: String,
    /// Published id; equals the circuit unless the configuration prefixes it.
    pub object_id: String,
    pub friendly_name: String,
    pub suggested_area: Option<String>,
    pub device_class: Option<String>,
    pub icon: Option<String>,
    pub invert_state: bool,
    /// Firmware of the owning board or extension.
    pub sw_version: String,
    /// Extension device name; features of the PLC itself leave this unset.
    pub device_name: Option<String>,
    pub io: FeatureIo,

    topic: String,
    cache: SharedCache,
    writes: Option<mpsc::Sender<CoilWrite>>,
    last_published: Mutex<Option<String>>,
}

impl Feature {
    /// `<device>/<component>/<object_id>`.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state_topic(&self) -> String {
        format!("{}/get", self.topic)
    }

    pub fn command_topic(&self) -> String {
        format!("{}/set", self.topic)
    }

    pub fn unique_id(&self, device_slug: &str) -> String {
        format!("{device_slug}_{}", self.object_id)
    }

    /// Raw bit as the PLC reports it, before inversion.
    pub fn raw_state(&self) -> Option<bool> {
        match self.io {
            FeatureIo::Bit { val_reg, index, .. } => {
                self.cache.lock().unwrap().bit(self.bus, self.unit, val_reg, index)
            }
            FeatureIo::Float { .. } => None,
        }
    }

    /// Logical binary state after inversion.
    pub fn state(&self) -> Option<bool> {
        self.raw_state().map(|on| on ^ self.invert_state)
    }

    /// Meter reading, if this is a meter feature with scanned registers.
    pub fn reading(&self) -> Option<f32> {
        match self.io {
            FeatureIo::Float { val_reg, .. } => {
                self.cache.lock().unwrap().float32(self.bus, self.unit, val_reg)
            }
            FeatureIo::Bit { .. } => None,
        }
    }

    /// Current logical value rendered for the bus. `None` until the owning
    /// register range has been scanned at least once.
    pub fn payload(&self) -> Option<String> {
        match self.io {
            FeatureIo::Bit { .. } => {
                self.state().map(|on| if on { PAYLOAD_ON } else { PAYLOAD_OFF }.to_string())
            }
            FeatureIo::Float { precision, .. } => {
                self.reading().map(|value| format!("{value:.precision$}"))
            }
        }
    }

    /// Whether the payload differs from the last published value.
    pub fn changed(&self) -> bool {
        match self.payload() {
            Some(payload) => self.last_published.lock().unwrap().as_deref() != Some(&payload),
            None => false,
        }
    }

    /// The payload, if it differs from the last published value.
    pub fn changed_payload(&self) -> Option<String> {
        let payload = self.payload()?;
        if self.last_published.lock().unwrap().as_deref() == Some(&payload) {
            return None;
        }
        Some(payload)
    }

    /// Record a publisher observation of `payload` and clear the changed
    /// flags of the backing registers.
    pub fn mark_published(&self, payload: &str) {
        *self.last_published.lock().unwrap() = Some(payload.to_string());

        let mut cache = self.cache.lock().unwrap();
        match self.io {
            FeatureIo::Bit { val_reg, index, .. } => {
                cache.clear_changed(self.bus, self.unit, val_reg + index / 16, 1);
            }
            FeatureIo::Float { val_reg, .. } => {
                cache.clear_changed(self.bus, self.unit, val_reg, 2);
            }
        }
    }

    /// Request a coil write through the owning scanner's queue.
    ///
    /// Returns `Ok(false)` without touching the bus when the requested state
    /// matches the currently observed one. Write failures on the bus are
    /// logged by the scanner and not retried; the next scan republishes the
    /// authoritative state.
    pub async fn set_state(&self, on: bool) -> Result<bool, WriteError> {
        let FeatureIo::Bit { coil: Some(coil), .. } = self.io else {
            return Err(WriteError::NotAnOutput);
        };
        if self.raw_state() == Some(on) {
            return Ok(false);
        }

        let writes = self.writes.as_ref().ok_or(WriteError::QueueClosed)?;
        writes
            .send(CoilWrite { unit: self.unit, coil, value: on, circuit: self.circuit.clone() })
            .await
            .map_err(|_| WriteError::QueueClosed)?;
        Ok(true)
    }
}

/// Ordered feature registry with unique object ids.
#[derive(Default)]
pub struct FeatureMap {
    features: Vec<Arc<Feature>>,
    index: HashMap<String, usize>,
    /// Every object id seen, including covers; enforces global uniqueness.
    claimed_ids: HashSet<String>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: Feature) -> Result<(), ConfigError> {
        if !self.claimed_ids.insert(feature.object_id.clone()) {
            return Err(ConfigError::DuplicateObjectId(feature.object_id.clone()));
        }
        self.index.insert(feature.object_id.clone(), self.features.len());
        self.features.push(Arc::new(feature));
        Ok(())
    }

    /// Reserve an object id for a non-feature entity (a cover).
    pub fn claim_object_id(&mut self, object_id: &str) -> Result<(), ConfigError> {
        if !self.claimed_ids.insert(object_id.to_string()) {
            return Err(ConfigError::DuplicateObjectId(object_id.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, object_id: &str) -> Option<&Arc<Feature>> {
        self.index.get(object_id).map(|&i| &self.features[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Feature>> {
        self.features.iter()
    }

    /// Features of the given kinds, in definition order.
    pub fn by_kinds<'a>(
        &'a self,
        kinds: &'a [FeatureKind],
    ) -> impl Iterator<Item = &'a Arc<Feature>> + 'a {
        self.features.iter().filter(move |f| kinds.contains(&f.kind))
    }

    /// Features of the given kinds on one bus, in definition order.
    pub fn by_bus_and_kinds<'a>(
        &'a self,
        bus: Bus,
        kinds: &'a [FeatureKind],
    ) -> impl Iterator<Item = &'a Arc<Feature>> + 'a {
        self.by_kinds(kinds).filter(move |f| f.bus == bus)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Materialize features from the probed boards and extensions.
    pub fn build(
        config: &Config,
        hardware: &HardwareMap,
        boards: &[Board],
        extensions: &[ProbedExtension],
        cache: &SharedCache,
        tcp_writes: &mpsc::Sender<CoilWrite>,
        rtu_writes: &mpsc::Sender<CoilWrite>,
    ) -> Result<Self, ConfigError> {
        let mut map = Self::new();
        let slug = config.device_slug();

        for board in boards {
            for template in hardware.neuron.templates_for_group(board.index) {
                for i in 1..=template.count {
                    let feature = build_board_feature(
                        config, &slug, board, template, i, cache, tcp_writes,
                    );
                    map.insert(feature)?;
                }
            }
        }

        for extension in &hardware.extensions {
            let firmware = extensions
                .iter()
                .find(|p| p.unit == extension.unit)
                .and_then(|p| p.firmware.clone())
                .unwrap_or_else(|| "unknown".to_string());

            for template in &extension.definition.modbus_features {
                for i in 1..=template.count {
                    let feature = build_extension_feature(
                        config, &slug, extension, &firmware, template, i, cache, rtu_writes,
                    );
                    map.insert(feature)?;
                }
            }
        }

        Ok(map)
    }
}

#[allow(clippy::too_many_arguments)]
fn build_board_feature(
    config: &Config,
    slug: &str,
    board: &Board,
    template: &FeatureTemplate,
    index: u16,
    cache: &SharedCache,
    writes: &mpsc::Sender<CoilWrite>,
) -> Feature {
    let kind = template.feature_type;
    let circuit = format!("{}_{}_{:02}", kind.short(), template.major_group, index);
    let overrides = config.features.get(&circuit).cloned().unwrap_or_default();

    let object_id = match &overrides.id {
        Some(id) if !id.is_empty() => format!("{id}_{circuit}"),
        _ => circuit.clone(),
    };
    let friendly_name = overrides.friendly_name.clone().unwrap_or_else(|| {
        format!("{}: {} {}.{:02}", config.device_info.name, kind.human(), template.major_group, index)
    });

    Feature {
        kind,
        bus: Bus::Tcp,
        unit: board.index,
        topic: format!("{slug}/{}/{object_id}", kind.topic_component()),
        circuit,
        object_id,
        friendly_name,
        suggested_area: overrides.suggested_area.or_else(|| config.device_info.suggested_area.clone()),
        device_class: overrides.device_class,
        icon: overrides.icon,
        invert_state: overrides.invert_state,
        sw_version: board.firmware.clone(),
        device_name: None,
        io: FeatureIo::Bit {
            val_reg: template.val_reg,
            index: index - 1,
            coil: if kind.is_output() { template.val_coil.map(|c| c + index - 1) } else { None },
        },
        cache: cache.clone(),
        writes: if kind.is_output() { Some(writes.clone()) } else { None },
        last_published: Mutex::new(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_extension_feature(
    config: &Config,
    slug: &str,
    extension: &Extension,
    firmware: &str,
    template: &FeatureTemplate,
    index: u16,
    cache: &SharedCache,
    writes: &mpsc::Sender<CoilWrite>,
) -> Feature {
    let kind = template.feature_type;
    let measurand = template
        .friendly_name
        .clone()
        .unwrap_or_else(|| kind.human().to_string());
    let circuit = if template.count == 1 {
        format!("{}_{}", slugify(&measurand), extension.unit)
    } else {
        format!("{}_{}_{}", slugify(&measurand), index, extension.unit)
    };
    let overrides = config.features.get(&circuit).cloned().unwrap_or_default();

    let object_id = match &overrides.id {
        Some(id) if !id.is_empty() => format!("{id}_{circuit}"),
        _ => circuit.clone(),
    };
    let friendly_name = overrides
        .friendly_name
        .clone()
        .unwrap_or_else(|| format!("{measurand} {}", extension.unit));

    let io = match kind {
        FeatureKind::Meter => FeatureIo::Float {
            val_reg: template.val_reg + 2 * (index - 1),
            precision: template.precision,
            unit_of_measurement: template.unit_of_measurement.clone(),
            state_class: template.state_class.clone(),
        },
        _ => FeatureIo::Bit {
            val_reg: template.val_reg,
            index: index - 1,
            coil: if kind.is_output() { template.val_coil.map(|c| c + index - 1) } else { None },
        },
    };

    Feature {
        kind,
        bus: Bus::Rtu,
        unit: extension.unit,
        topic: format!("{slug}/{}/{object_id}", kind.topic_component()),
        circuit,
        object_id,
        friendly_name,
        suggested_area: overrides
            .suggested_area
            .or_else(|| extension.suggested_area.clone()),
        device_class: overrides.device_class.or_else(|| template.device_class.clone()),
        icon: overrides.icon,
        invert_state: overrides.invert_state,
        sw_version: firmware.to_string(),
        device_name: extension.device_name.clone(),
        io,
        cache: cache.clone(),
        writes: if kind.is_output() { Some(writes.clone()) } else { None },
        last_published: Mutex::new(None),
    }
}

#[cfg(test)]
mod tests;
