//! Publishes the aggregate as one virtual battery monitor.
//!
//! The publisher flattens an [`AggregateSnapshot`] into a path → value tree
//! and only sends the paths whose value differs from the last published
//! tree, so republishing an unchanged snapshot costs nothing on the bus.

use crate::aggregator::AggregateSnapshot;
use crate::bus::{BusClient, BusError, BusValue};
use crate::member::{paths, AlarmKind};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Static identity of the virtual device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub service_name: String,
    pub device_instance: u32,
    pub product_id: i64,
    pub product_name: String,
    pub custom_name: String,
    pub firmware_version: Option<i64>,
    pub serial: String,
    pub connection: String,
}

pub struct VirtualDevicePublisher {
    bus: Arc<dyn BusClient>,
    identity: DeviceIdentity,
    tree: BTreeMap<String, BusValue>,
    snapshot: AggregateSnapshot,
}

impl VirtualDevicePublisher {
    pub fn new(bus: Arc<dyn BusClient>, identity: DeviceIdentity) -> Self {
        Self {
            bus,
            identity,
            tree: BTreeMap::new(),
            snapshot: AggregateSnapshot::default(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Publishes the identity paths. Called once at start.
    pub fn publish_static(&mut self) -> Result<usize, BusError> {
        let identity = &self.identity;
        let entries: Vec<(&str, BusValue)> = vec![
            ("/Mgmt/ProcessName", env!("CARGO_PKG_NAME").into()),
            ("/Mgmt/ProcessVersion", env!("CARGO_PKG_VERSION").into()),
            ("/Mgmt/Connection", identity.connection.as_str().into()),
            (paths::DEVICE_INSTANCE, identity.device_instance.into()),
            (paths::PRODUCT_ID, identity.product_id.into()),
            (paths::PRODUCT_NAME, identity.product_name.as_str().into()),
            (paths::CUSTOM_NAME, identity.custom_name.as_str().into()),
            (paths::FIRMWARE_VERSION, identity.firmware_version.into()),
            ("/Serial", identity.serial.as_str().into()),
            ("/Connected", BusValue::Int(1)),
            ("/Settings/HasTemperature", BusValue::Int(1)),
            ("/Settings/HasStarterVoltage", BusValue::Int(0)),
            ("/Settings/HasMidVoltage", BusValue::Int(0)),
        ];
        self.send_changes(entries.into_iter().map(|(p, v)| (p.to_string(), v)))
    }

    /// Mirrors a member's firmware version. Returns true if it changed.
    pub fn set_firmware(&mut self, version: i64) -> Result<bool, BusError> {
        if self.identity.firmware_version == Some(version) {
            return Ok(false);
        }
        self.identity.firmware_version = Some(version);
        let update = (paths::FIRMWARE_VERSION.to_string(), BusValue::Int(version));
        let sent = self.send_changes([update])?;
        Ok(sent > 0)
    }

    /// Publishes every path of `snapshot` that changed since the last call.
    /// Backing member entries that disappeared are cleared. Returns the
    /// number of paths sent.
    pub fn publish(&mut self, snapshot: &AggregateSnapshot) -> Result<usize, BusError> {
        let mut tree = flatten(snapshot);

        // Clear member entries that are no longer backed.
        for path in self.tree.keys() {
            if path.starts_with("/Devices/") && !tree.contains_key(path) {
                tree.insert(path.clone(), BusValue::Empty);
            }
        }

        self.snapshot = snapshot.clone();
        self.send_changes(tree)
    }

    fn send_changes(
        &mut self,
        entries: impl IntoIterator<Item = (String, BusValue)>,
    ) -> Result<usize, BusError> {
        let mut sent = 0;
        for (path, value) in entries {
            if self.tree.get(&path) == Some(&value) {
                continue;
            }
            match self.bus.publish_property(&path, value.clone()) {
                Ok(()) => sent += 1,
                Err(BusError::UnsupportedPath(_)) => {
                    debug!(%path, "Path not carried by this bus");
                }
                Err(e) => return Err(e),
            }
            self.tree.insert(path, value);
        }
        Ok(sent)
    }

    /// Addresses of the members behind the last published snapshot.
    pub fn backing_members(&self) -> Vec<String> {
        self.snapshot
            .members
            .iter()
            .map(|m| m.address.clone())
            .collect()
    }

    /// Last published value of `path`.
    pub fn value(&self, path: &str) -> Option<&BusValue> {
        self.tree.get(path)
    }

    /// JSON view of the virtual device for operators.
    pub fn describe(&self) -> serde_json::Value {
        json!({
            "service": self.identity.service_name,
            "device_instance": self.identity.device_instance,
            "custom_name": self.identity.custom_name,
            "firmware_version": self.identity.firmware_version,
            "members": self.snapshot.members,
            "snapshot": self.snapshot,
        })
    }
}

/// Path → value tree of a snapshot. Every measurement path is present, with
/// `Empty` standing for "no data".
pub fn flatten(snapshot: &AggregateSnapshot) -> BTreeMap<String, BusValue> {
    let mut tree = BTreeMap::new();
    let mut put = |path: &str, value: BusValue| {
        tree.insert(path.to_string(), value);
    };

    put(paths::DC_VOLTAGE, snapshot.voltage.into());
    put(paths::DC_CURRENT, snapshot.current.into());
    put(paths::DC_POWER, snapshot.power.into());
    put(paths::DC_TEMPERATURE, snapshot.temperature.into());
    put(paths::STARTER_VOLTAGE, snapshot.starter_voltage.into());
    put(paths::SOC, snapshot.soc.into());
    put(paths::INSTALLED_CAPACITY, snapshot.installed_capacity.into());
    put(paths::CAPACITY, snapshot.remaining_capacity.into());
    put(paths::CONSUMED_AMPHOURS, snapshot.consumed_amphours.into());
    put(paths::TIME_TO_GO, snapshot.time_to_go.into());

    for kind in AlarmKind::ALL {
        let level = snapshot
            .alarms
            .as_ref()
            .map(|alarms| alarms.get(&kind).copied().unwrap_or_default().as_raw());
        put(kind.path(), level.into());
    }

    let h = &snapshot.history;
    let count = |v: Option<u64>| BusValue::from(v.map(|v| v as i64));
    put(paths::HISTORY_CHARGE_CYCLES, count(h.charge_cycles));
    put(paths::HISTORY_FULL_DISCHARGES, count(h.full_discharges));
    put(paths::HISTORY_AUTOMATIC_SYNCS, count(h.automatic_syncs));
    put(paths::HISTORY_LOW_VOLTAGE_ALARMS, count(h.low_voltage_alarms));
    put(paths::HISTORY_HIGH_VOLTAGE_ALARMS, count(h.high_voltage_alarms));
    put(paths::HISTORY_TOTAL_AH_DRAWN, h.total_ah_drawn.into());
    put(paths::HISTORY_CHARGED_ENERGY, h.charged_energy.into());
    put(paths::HISTORY_DISCHARGED_ENERGY, h.discharged_energy.into());
    put(paths::HISTORY_LAST_DISCHARGE, h.last_discharge.into());
    put(paths::HISTORY_AVERAGE_DISCHARGE, h.average_discharge.into());
    put(paths::HISTORY_DEEPEST_DISCHARGE, h.deepest_discharge.into());
    put(paths::HISTORY_TIME_SINCE_FULL_CHARGE, h.time_since_full_charge.into());
    put(paths::HISTORY_MIN_VOLTAGE, h.min_voltage.into());
    put(paths::HISTORY_MAX_VOLTAGE, h.max_voltage.into());
    put(paths::HISTORY_MIN_TEMPERATURE, h.min_temperature.into());
    put(paths::HISTORY_MAX_TEMPERATURE, h.max_temperature.into());
    put(paths::HISTORY_MIN_STARTER_VOLTAGE, h.min_starter_voltage.into());
    put(paths::HISTORY_MAX_STARTER_VOLTAGE, h.max_starter_voltage.into());

    let e = &snapshot.errors;
    put(paths::ERR_HEX_CHECKSUM, count(e.hex_checksum));
    put(paths::ERR_HEX_INVALID_CHARACTER, count(e.hex_invalid_character));
    put(paths::ERR_HEX_UNFINISHED, count(e.hex_unfinished));
    put(paths::ERR_TEXT_CHECKSUM, count(e.text_checksum));
    put(paths::ERR_TEXT_PARSE, count(e.text_parse));
    put(paths::ERR_TEXT_UNFINISHED, count(e.text_unfinished));

    if let Some(control) = &snapshot.charge_control {
        put(paths::MAX_CHARGE_VOLTAGE, control.max_charge_voltage.into());
        put(paths::MAX_CHARGE_CURRENT, control.max_charge_current.into());
        put(paths::MAX_DISCHARGE_CURRENT, control.max_discharge_current.into());
        put(paths::ALLOW_TO_CHARGE, control.allow_to_charge.into());
        put(paths::ALLOW_TO_DISCHARGE, control.allow_to_discharge.into());
    }

    for member in &snapshot.members {
        let base = format!("/Devices/{}", member.instance);
        put(&format!("{base}/CustomName"), member.name.as_str().into());
        put(&format!("{base}/DeviceInstance"), member.instance.into());
        put(&format!("{base}/ProductName"), member.product_name.clone().into());
        put(&format!("{base}/ServiceName"), member.address.as_str().into());
        put(&format!("{base}/FirmwareVersion"), member.firmware_version.into());
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{aggregate, AggregationParams};
    use crate::member::{AlarmLevel, MemberDevice, MemberSnapshot};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Bus that records every publish call.
    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, BusValue)>>,
        reject_text: bool,
    }

    impl RecordingBus {
        fn take(&self) -> Vec<(String, BusValue)> {
            std::mem::take(&mut *self.published.lock().unwrap())
        }
    }

    #[async_trait]
    impl BusClient for RecordingBus {
        async fn enumerate(&self, _prefix: &str) -> Result<Vec<String>, BusError> {
            Ok(Vec::new())
        }

        async fn read_property(
            &self,
            _address: &str,
            _path: &str,
        ) -> Result<Option<BusValue>, BusError> {
            Ok(None)
        }

        fn subscribe(&self, _address: &str, _path: &str) -> Result<(), BusError> {
            Ok(())
        }

        fn unsubscribe(&self, _address: &str, _path: &str) {}

        fn publish_property(&self, path: &str, value: BusValue) -> Result<(), BusError> {
            if self.reject_text && matches!(value, BusValue::Text(_)) {
                return Err(BusError::UnsupportedPath(path.to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((path.to_string(), value));
            Ok(())
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            service_name: "com.victronenergy.battery.aggregate".to_string(),
            device_instance: 100,
            product_id: 0xA389,
            product_name: "SmartShunt Aggregate".to_string(),
            custom_name: "House bank".to_string(),
            firmware_version: None,
            serial: "AGGREGATE01".to_string(),
            connection: "Virtual".to_string(),
        }
    }

    fn member(instance: u32, current: f64) -> MemberDevice {
        let address = format!("com.victronenergy.battery.ttyS{instance}");
        let mut device = MemberDevice::new(address, instance);
        device.snapshot = MemberSnapshot {
            voltage: Some(13.2),
            current: Some(current),
            soc: Some(80.0),
            capacity: Some(200.0),
            ..Default::default()
        };
        device
    }

    fn publisher(bus: &Arc<RecordingBus>) -> VirtualDevicePublisher {
        let dyn_bus: Arc<dyn BusClient> = bus.clone();
        VirtualDevicePublisher::new(dyn_bus, identity())
    }

    #[test]
    fn test_publish_is_idempotent() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        let members = [member(1, -5.0), member(2, -3.0)];
        let snapshot = aggregate(&members, &AggregationParams::default());

        let first = publisher.publish(&snapshot).unwrap();
        assert!(first > 0);
        assert_eq!(bus.take().len(), first);

        assert_eq!(publisher.publish(&snapshot).unwrap(), 0);
        assert!(bus.take().is_empty());
    }

    #[test]
    fn test_only_changed_paths_are_sent() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        let params = AggregationParams::default();
        publisher
            .publish(&aggregate(&[member(1, -5.0), member(2, -3.0)], &params))
            .unwrap();
        bus.take();

        let mut changed = member(2, -3.0);
        changed.snapshot.alarms.insert(AlarmKind::LowSoc, AlarmLevel::Warning);
        let sent = publisher
            .publish(&aggregate(&[member(1, -5.0), changed], &params))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(bus.take(), vec![("/Alarms/LowSoc".to_string(), BusValue::Int(1))]);
    }

    #[test]
    fn test_departed_member_entries_are_cleared() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        let params = AggregationParams::default();
        publisher
            .publish(&aggregate(&[member(1, -5.0), member(2, -3.0)], &params))
            .unwrap();
        assert_eq!(publisher.backing_members().len(), 2);
        bus.take();

        publisher.publish(&aggregate(&[member(1, -5.0)], &params)).unwrap();
        let published = bus.take();
        assert!(published.contains(&("/Devices/2/ServiceName".to_string(), BusValue::Empty)));
        assert!(published.contains(&(paths::DC_CURRENT.to_string(), BusValue::Float(-5.0))));
        assert_eq!(
            publisher.backing_members(),
            vec!["com.victronenergy.battery.ttyS1".to_string()]
        );
        assert_eq!(publisher.value("/Devices/1/CustomName"), Some(&BusValue::from("Shunt 1")));
    }

    #[test]
    fn test_empty_bank_publishes_no_data() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        publisher
            .publish(&aggregate(&[member(1, -5.0)], &AggregationParams::default()))
            .unwrap();
        publisher.publish(&AggregateSnapshot::default()).unwrap();
        assert_eq!(publisher.value(paths::DC_CURRENT), Some(&BusValue::Empty));
        assert_eq!(publisher.value(paths::SOC), Some(&BusValue::Empty));
        assert_eq!(publisher.value("/Alarms/LowVoltage"), Some(&BusValue::Empty));
        assert!(publisher.backing_members().is_empty());
    }

    #[test]
    fn test_static_identity_and_firmware_mirror() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        publisher.publish_static().unwrap();
        let published = bus.take();
        assert!(published.contains(&(paths::DEVICE_INSTANCE.to_string(), BusValue::Int(100))));
        assert!(published.contains(&(paths::FIRMWARE_VERSION.to_string(), BusValue::Empty)));
        assert_eq!(publisher.publish_static().unwrap(), 0);

        assert!(publisher.set_firmware(0x0417).unwrap());
        assert!(!publisher.set_firmware(0x0417).unwrap());
        assert_eq!(
            bus.take(),
            vec![(paths::FIRMWARE_VERSION.to_string(), BusValue::Int(0x0417))]
        );
    }

    #[test]
    fn test_unsupported_paths_are_skipped_once() {
        let bus = Arc::new(RecordingBus {
            reject_text: true,
            ..Default::default()
        });
        let mut publisher = publisher(&bus);
        let sent = publisher.publish_static().unwrap();
        assert!(bus.take().iter().all(|(_, v)| !matches!(v, BusValue::Text(_))));
        assert!(sent > 0);
        assert_eq!(publisher.publish_static().unwrap(), 0);
    }

    #[test]
    fn test_describe_lists_members() {
        let bus = Arc::new(RecordingBus::default());
        let mut publisher = publisher(&bus);
        publisher
            .publish(&aggregate(&[member(1, -5.0)], &AggregationParams::default()))
            .unwrap();
        let view = publisher.describe();
        assert_eq!(view["device_instance"], 100);
        assert_eq!(view["members"][0]["instance"], 1);
        assert_eq!(view["snapshot"]["current"], -5.0);
    }
}
