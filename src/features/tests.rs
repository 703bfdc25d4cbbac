use crate::features::{FeatureKind, PAYLOAD_OFF, PAYLOAD_ON, WriteError};
use crate::registers::Bus;
use crate::test_utils::{CONFIG_YAML, TestRig, set_cache_bit};

const OVERRIDES_YAML: &str = "\
device_info:
  name: MOCKED UNIPI
features:
  ro_2_01:
    id: mocked_id
    friendly_name: MOCKED_FRIENDLY_NAME
    suggested_area: MOCKED AREA 2
    invert_state: true
  di_1_01:
    invert_state: true
modbus_serial:
  units:
    - unit: 1
      identifier: MOCKED_EASTRON
";

#[test]
fn features_enumerate_in_definition_order() {
    let rig = TestRig::new(CONFIG_YAML);

    // Three boards of 12/30/30 features plus ten extension meters.
    assert_eq!(rig.features.len(), 82);

    let ids: Vec<&str> = rig.features.iter().map(|f| f.object_id.as_str()).collect();
    assert_eq!(&ids[..5], &["di_1_01", "di_1_02", "di_1_03", "di_1_04", "do_1_01"]);

    // Board order before template order before bit index.
    let di_2_01 = ids.iter().position(|id| *id == "di_2_01").unwrap();
    let ro_2_01 = ids.iter().position(|id| *id == "ro_2_01").unwrap();
    let ro_3_01 = ids.iter().position(|id| *id == "ro_3_01").unwrap();
    assert!(di_2_01 < ro_2_01 && ro_2_01 < ro_3_01);

    // Extension meters come last, in declaration order.
    assert_eq!(ids[72], "voltage_1");
    assert_eq!(ids[73], "current_1");
    assert_eq!(ids[81], "total_energy_1");
}

#[test]
fn topics_follow_the_kind_component() {
    let rig = TestRig::new(CONFIG_YAML);

    assert_eq!(rig.features.get("di_1_01").unwrap().topic(), "mocked_unipi/input/di_1_01");
    assert_eq!(rig.features.get("do_1_01").unwrap().topic(), "mocked_unipi/relay/do_1_01");
    assert_eq!(rig.features.get("ro_2_01").unwrap().topic(), "mocked_unipi/relay/ro_2_01");
    assert_eq!(rig.features.get("led_1_01").unwrap().topic(), "mocked_unipi/led/led_1_01");
    assert_eq!(rig.features.get("voltage_1").unwrap().topic(), "mocked_unipi/meter/voltage_1");
}

#[test]
fn default_friendly_names_carry_kind_and_index() {
    let rig = TestRig::new(CONFIG_YAML);
    let relay = rig.features.get("ro_2_03").unwrap();
    assert_eq!(relay.friendly_name, "MOCKED UNIPI: Relay 2.03");
}

#[test]
fn configured_id_prefixes_the_circuit() {
    let rig = TestRig::new(OVERRIDES_YAML);

    assert!(rig.features.get("ro_2_01").is_none());
    let relay = rig.features.get("mocked_id_ro_2_01").unwrap();
    assert_eq!(relay.circuit, "ro_2_01");
    assert_eq!(relay.friendly_name, "MOCKED_FRIENDLY_NAME");
    assert_eq!(relay.unique_id("mocked_unipi"), "mocked_unipi_mocked_id_ro_2_01");
    assert_eq!(relay.topic(), "mocked_unipi/relay/mocked_id_ro_2_01");
}

#[test]
fn binary_payload_renders_on_off_after_inversion() {
    let rig = TestRig::new(OVERRIDES_YAML);

    // Raw bit 0 of the DI register goes 0 -> 1; inverted payload reads OFF.
    let input = rig.features.get("di_1_01").unwrap();
    set_cache_bit(&rig.cache, 1, 0, 0, false);
    assert_eq!(input.payload().as_deref(), Some(PAYLOAD_ON));
    set_cache_bit(&rig.cache, 1, 0, 0, true);
    assert_eq!(input.payload().as_deref(), Some(PAYLOAD_OFF));

    let plain = rig.features.get("di_1_02").unwrap();
    set_cache_bit(&rig.cache, 1, 0, 1, true);
    assert_eq!(plain.payload().as_deref(), Some(PAYLOAD_ON));
}

#[test]
fn payload_is_none_until_scanned() {
    let rig = TestRig::new(CONFIG_YAML);
    let input = rig.features.get("di_1_01").unwrap();
    assert_eq!(input.payload(), None);
    assert!(!input.changed());
}

#[test]
fn meter_payload_renders_fixed_precision() {
    let rig = TestRig::new(CONFIG_YAML);
    let voltage = rig.features.get("voltage_1").unwrap();

    rig.cache.lock().unwrap().update_block(Bus::Rtu, 1, 0, &[0x4348, 0x6666]);
    assert_eq!(voltage.payload().as_deref(), Some("200.40"));
    assert_eq!(voltage.kind, FeatureKind::Meter);
    assert_eq!(voltage.sw_version, "2.4");
}

#[test]
fn changed_tracks_the_last_published_payload() {
    let rig = TestRig::new(CONFIG_YAML);
    let input = rig.features.get("di_1_01").unwrap();

    set_cache_bit(&rig.cache, 1, 0, 0, false);
    assert!(input.changed());

    let payload = input.changed_payload().unwrap();
    input.mark_published(&payload);
    assert!(!input.changed());
    assert_eq!(input.changed_payload(), None);
    // Publishing also clears the backing register's changed flag.
    assert!(!rig.cache.lock().unwrap().is_changed(Bus::Tcp, 1, 0));

    set_cache_bit(&rig.cache, 1, 0, 0, true);
    assert!(input.changed());
    assert_eq!(input.changed_payload().as_deref(), Some(PAYLOAD_ON));
}

#[tokio::test]
async fn set_state_writes_the_mapped_coil() {
    let mut rig = TestRig::new(CONFIG_YAML);
    let relay = rig.features.get("ro_2_01").unwrap().clone();

    set_cache_bit(&rig.cache, 2, 101, 0, false);
    assert!(relay.set_state(true).await.unwrap());

    let writes = rig.drain_tcp_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].unit, 2);
    assert_eq!(writes[0].coil, 100);
    assert!(writes[0].value);
}

#[tokio::test]
async fn set_state_is_idempotent() {
    let mut rig = TestRig::new(CONFIG_YAML);
    let relay = rig.features.get("do_1_01").unwrap().clone();

    set_cache_bit(&rig.cache, 1, 1, 0, true);
    assert!(!relay.set_state(true).await.unwrap());
    assert!(rig.drain_tcp_writes().is_empty());

    assert!(relay.set_state(false).await.unwrap());
    let writes = rig.drain_tcp_writes();
    assert_eq!(writes.len(), 1);
    assert!(!writes[0].value);
}

#[tokio::test]
async fn inputs_reject_writes() {
    let rig = TestRig::new(CONFIG_YAML);
    let input = rig.features.get("di_1_01").unwrap();
    assert!(matches!(input.set_state(true).await, Err(WriteError::NotAnOutput)));
}

#[test]
fn object_ids_are_globally_unique() {
    let mut rig = TestRig::new(CONFIG_YAML);
    assert!(rig.features.claim_object_id("blind_1").is_ok());
    assert!(rig.features.claim_object_id("blind_1").is_err());
    assert!(rig.features.claim_object_id("di_1_01").is_err());
}

#[test]
fn kind_queries_filter_and_preserve_order() {
    let rig = TestRig::new(CONFIG_YAML);

    let outputs: Vec<&str> = rig
        .features
        .by_kinds(&[FeatureKind::DigitalOutput, FeatureKind::Relay])
        .map(|f| f.object_id.as_str())
        .collect();
    assert_eq!(outputs.len(), 4 + 14 + 14);
    assert_eq!(outputs[0], "do_1_01");

    let meters: Vec<&str> = rig
        .features
        .by_bus_and_kinds(Bus::Rtu, &[FeatureKind::Meter])
        .map(|f| f.object_id.as_str())
        .collect();
    assert_eq!(meters.len(), 10);
}
