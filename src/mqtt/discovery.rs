/*!
Home Assistant MQTT discovery emitter.

One JSON config document per feature/cover, published retained at QoS 2 to
`<discovery_prefix>/<component>/<unique_id>/config` so a freshly started
Home Assistant sees the latest catalog. Component mapping:

- DI -> `binary_sensor` (payload_on/off swapped when the state is inverted)
- DO/RO -> `switch`, unless a cover claims the relay (the cover owns it and
  the relay is not advertised at all)
- METER -> `sensor` with unit/state-class/device-class
- covers -> `cover` with command/state/position topics

Features with a suggested area are grouped under a per-area device that
points back at the PLC through `via_device`; extension features are grouped
under the extension's device name the same way.
*/

use rumqttc::{AsyncClient, QoS};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Config;
use crate::covers::{Cover, CoverMap};
use crate::features::{Feature, FeatureIo, FeatureKind, FeatureMap};
use crate::hardware::HardwareMap;
use crate::logging::prefix;

/// Feature kinds that get a discovery entry.
const DISCOVERY_KINDS: &[FeatureKind] = &[
    FeatureKind::DigitalInput,
    FeatureKind::DigitalOutput,
    FeatureKind::Relay,
    FeatureKind::Meter,
];

/// Discovery topic and message for one feature, or `None` when the feature
/// kind has no Home Assistant component or a cover owns the relay.
pub fn feature_discovery(
    config: &Config,
    hardware: &HardwareMap,
    feature: &Feature,
) -> Option<(String, Value)> {
    let component = match feature.kind {
        FeatureKind::DigitalInput => "binary_sensor",
        FeatureKind::DigitalOutput | FeatureKind::Relay => {
            if config.cover_circuits().contains(&feature.circuit) {
                return None;
            }
            "switch"
        }
        FeatureKind::Meter => "sensor",
        FeatureKind::Led => return None,
    };

    let slug = config.device_slug();
    let unique_id = feature.unique_id(&slug);
    let topic =
        format!("{}/{component}/{unique_id}/config", config.homeassistant.discovery_prefix);

    let mut message = json!({
        "name": feature.friendly_name,
        "unique_id": unique_id,
        "state_topic": feature.state_topic(),
        "qos": 2,
        "device": device_json(
            config,
            hardware,
            &feature.sw_version,
            feature.suggested_area.as_deref(),
            feature.device_name.as_deref(),
        ),
    });
    let object = message.as_object_mut().unwrap();

    if feature.kind.is_output() {
        object.insert("command_topic".into(), feature.command_topic().into());
    }
    if feature.object_id != feature.circuit {
        object.insert("object_id".into(), feature.object_id.clone().into());
    }
    if let Some(icon) = &feature.icon {
        object.insert("icon".into(), icon.clone().into());
    }
    if let Some(device_class) = &feature.device_class {
        object.insert("device_class".into(), device_class.clone().into());
    }

    match &feature.io {
        FeatureIo::Bit { .. } => {
            if feature.invert_state {
                object.insert("payload_on".into(), "OFF".into());
                object.insert("payload_off".into(), "ON".into());
            }
        }
        FeatureIo::Float { unit_of_measurement, state_class, .. } => {
            if let Some(unit) = unit_of_measurement {
                object.insert("unit_of_measurement".into(), unit.clone().into());
            }
            if let Some(state_class) = state_class {
                object.insert("state_class".into(), state_class.clone().into());
            }
        }
    }

    Some((topic, message))
}

/// Discovery topic and message for one cover.
pub fn cover_discovery(config: &Config, hardware: &HardwareMap, cover: &Cover) -> (String, Value) {
    let slug = config.device_slug();
    let unique_id = format!("{slug}_{}", cover.object_id);
    let topic = format!("{}/cover/{unique_id}/config", config.homeassistant.discovery_prefix);

    let message = json!({
        "name": cover.friendly_name,
        "unique_id": unique_id,
        "command_topic": format!("{}/set", cover.topic()),
        "state_topic": cover.state_topic(),
        "position_topic": cover.position_topic(),
        "set_position_topic": format!("{}/set_position", cover.topic()),
        "qos": 2,
        "device_class": cover.device_class,
        "device": device_json(
            config,
            hardware,
            &hardware.info.version,
            cover.suggested_area.as_deref(),
            None,
        ),
    });

    (topic, message)
}

fn device_json(
    config: &Config,
    hardware: &HardwareMap,
    sw_version: &str,
    suggested_area: Option<&str>,
    device_name: Option<&str>,
) -> Value {
    let base_name = config.device_info.name.clone();

    let (name, via_device) = match (device_name, suggested_area) {
        (Some(extension), _) => (extension.to_string(), Some(base_name.clone())),
        (None, Some(area)) => (format!("{base_name} - {area}"), Some(base_name.clone())),
        (None, None) => (base_name, None),
    };

    let mut device = json!({
        "name": name.clone(),
        "identifiers": name,
        "model": hardware.device_model(),
        "sw_version": sw_version,
        "manufacturer": config.device_info.manufacturer,
    });
    let object = device.as_object_mut().unwrap();
    if let Some(area) = suggested_area {
        object.insert("suggested_area".into(), area.into());
    }
    if let Some(via) = via_device {
        object.insert("via_device".into(), via.into());
    }

    device
}

/// Publish the whole catalog, once per process on the first connection.
pub async fn publish_all(
    client: &AsyncClient,
    config: &Config,
    hardware: &HardwareMap,
    features: &FeatureMap,
    covers: &CoverMap,
) {
    for feature in features.by_kinds(DISCOVERY_KINDS) {
        if let Some((topic, message)) = feature_discovery(config, hardware, feature) {
            publish_config(client, topic, message).await;
        }
    }

    for cover in covers.iter() {
        let (topic, message) = cover_discovery(config, hardware, cover);
        publish_config(client, topic, message).await;
    }
}

async fn publish_config(client: &AsyncClient, topic: String, message: Value) {
    let payload = message.to_string();
    match client.publish(topic.clone(), QoS::ExactlyOnce, true, payload.clone()).await {
        Ok(()) => debug!("{} [{}] Publishing message: {}", prefix::MQTT, topic, payload),
        Err(err) => debug!("{} [{}] Publish failed: {}", prefix::MQTT, topic, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covers::CoverMap;
    use crate::test_utils::{CONFIG_YAML, COVER_CONFIG_YAML, TestRig, test_config};

    const OVERRIDES_YAML: &str = "\
device_info:
  name: MOCKED UNIPI
features:
  ro_2_01:
    id: mocked_id
    friendly_name: MOCKED_FRIENDLY_NAME
    suggested_area: MOCKED AREA 2
    invert_state: true
  ro_2_02:
    device_class: switch
    icon: mdi:power-standby
modbus_serial:
  units:
    - unit: 1
      identifier: MOCKED_EASTRON
      device_name: MOCKED Eastron
";

    #[test]
    fn switch_discovery_matches_the_expected_document() {
        let rig = TestRig::new(CONFIG_YAML);
        let relay = rig.features.get("ro_2_01").unwrap();

        let (topic, message) = feature_discovery(&rig.config, &rig.hardware, relay).unwrap();
        assert_eq!(topic, "homeassistant/switch/mocked_unipi_ro_2_01/config");
        assert_eq!(message["name"], "MOCKED UNIPI: Relay 2.01");
        assert_eq!(message["unique_id"], "mocked_unipi_ro_2_01");
        assert_eq!(message["command_topic"], "mocked_unipi/relay/ro_2_01/set");
        assert_eq!(message["state_topic"], "mocked_unipi/relay/ro_2_01/get");
        assert_eq!(message["qos"], 2);
        assert_eq!(message["device"]["name"], "MOCKED UNIPI");
        assert_eq!(message["device"]["identifiers"], "MOCKED UNIPI");
        assert_eq!(message["device"]["model"], "MOCKED_NAME MOCKED_MODEL");
        assert_eq!(message["device"]["sw_version"], "0.0");
        assert_eq!(message["device"]["manufacturer"], "Unipi technology");
        assert!(message.get("payload_on").is_none());
        assert!(message.get("object_id").is_none());
    }

    #[test]
    fn inverted_switch_swaps_payloads_and_groups_by_area() {
        let rig = TestRig::new(OVERRIDES_YAML);
        let relay = rig.features.get("mocked_id_ro_2_01").unwrap();

        let (topic, message) = feature_discovery(&rig.config, &rig.hardware, relay).unwrap();
        assert_eq!(topic, "homeassistant/switch/mocked_unipi_mocked_id_ro_2_01/config");
        assert_eq!(message["name"], "MOCKED_FRIENDLY_NAME");
        assert_eq!(message["object_id"], "mocked_id_ro_2_01");
        assert_eq!(message["payload_on"], "OFF");
        assert_eq!(message["payload_off"], "ON");
        assert_eq!(message["device"]["name"], "MOCKED UNIPI - MOCKED AREA 2");
        assert_eq!(message["device"]["identifiers"], "MOCKED UNIPI - MOCKED AREA 2");
        assert_eq!(message["device"]["suggested_area"], "MOCKED AREA 2");
        assert_eq!(message["device"]["via_device"], "MOCKED UNIPI");
    }

    #[test]
    fn device_class_and_icon_pass_through() {
        let rig = TestRig::new(OVERRIDES_YAML);
        let relay = rig.features.get("ro_2_02").unwrap();

        let (_, message) = feature_discovery(&rig.config, &rig.hardware, relay).unwrap();
        assert_eq!(message["device_class"], "switch");
        assert_eq!(message["icon"], "mdi:power-standby");
    }

    #[test]
    fn cover_claimed_relays_are_not_advertised() {
        let rig = TestRig::new(COVER_CONFIG_YAML);

        let claimed = rig.features.get("ro_3_01").unwrap();
        assert!(feature_discovery(&rig.config, &rig.hardware, claimed).is_none());
        let claimed = rig.features.get("ro_3_02").unwrap();
        assert!(feature_discovery(&rig.config, &rig.hardware, claimed).is_none());

        let free = rig.features.get("ro_3_03").unwrap();
        assert!(feature_discovery(&rig.config, &rig.hardware, free).is_some());
    }

    #[test]
    fn binary_sensors_have_no_command_topic() {
        let rig = TestRig::new(CONFIG_YAML);
        let input = rig.features.get("di_1_01").unwrap();

        let (topic, message) = feature_discovery(&rig.config, &rig.hardware, input).unwrap();
        assert_eq!(topic, "homeassistant/binary_sensor/mocked_unipi_di_1_01/config");
        assert!(message.get("command_topic").is_none());
    }

    #[test]
    fn leds_are_not_advertised() {
        let rig = TestRig::new(CONFIG_YAML);
        let led = rig.features.get("led_1_01").unwrap();
        assert!(feature_discovery(&rig.config, &rig.hardware, led).is_none());
    }

    #[test]
    fn meter_discovery_carries_measurement_metadata() {
        let rig = TestRig::new(CONFIG_YAML);
        let voltage = rig.features.get("voltage_1").unwrap();

        let (topic, message) = feature_discovery(&rig.config, &rig.hardware, voltage).unwrap();
        assert_eq!(topic, "homeassistant/sensor/mocked_unipi_voltage_1/config");
        assert_eq!(message["unit_of_measurement"], "V");
        assert_eq!(message["state_class"], "measurement");
        assert_eq!(message["device_class"], "voltage");
        assert_eq!(message["device"]["name"], "MOCKED Eastron");
        assert_eq!(message["device"]["via_device"], "MOCKED UNIPI");
        assert_eq!(message["device"]["sw_version"], "2.4");
    }

    #[test]
    fn cover_discovery_exposes_position_topics() {
        let mut rig = TestRig::new(COVER_CONFIG_YAML);
        let config = test_config(COVER_CONFIG_YAML);
        let covers = CoverMap::build(&config, &mut rig.features).unwrap();
        let cover = covers.iter().next().unwrap();

        let (topic, message) = cover_discovery(&rig.config, &rig.hardware, cover);
        assert_eq!(topic, "homeassistant/cover/mocked_unipi_blind_1/config");
        assert_eq!(message["name"], "Blind 1");
        assert_eq!(message["unique_id"], "mocked_unipi_blind_1");
        assert_eq!(message["command_topic"], "mocked_unipi/cover/blind_1/set");
        assert_eq!(message["state_topic"], "mocked_unipi/cover/blind_1/state");
        assert_eq!(message["position_topic"], "mocked_unipi/cover/blind_1/position");
        assert_eq!(message["set_position_topic"], "mocked_unipi/cover/blind_1/set_position");
        assert_eq!(message["device_class"], "blind");
        assert_eq!(message["qos"], 2);
    }
}
