//! Member shunt records and the property paths they are built from.

use crate::bus::BusValue;
use serde_derive::Serialize;
use std::collections::BTreeMap;

/// Property paths shared by member shunts and the virtual device.
pub mod paths {
    pub const PRODUCT_NAME: &str = "/ProductName";
    pub const PRODUCT_ID: &str = "/ProductId";
    pub const CUSTOM_NAME: &str = "/CustomName";
    pub const DEVICE_INSTANCE: &str = "/DeviceInstance";
    pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";

    pub const DC_VOLTAGE: &str = "/Dc/0/Voltage";
    pub const DC_CURRENT: &str = "/Dc/0/Current";
    pub const DC_POWER: &str = "/Dc/0/Power";
    pub const DC_TEMPERATURE: &str = "/Dc/0/Temperature";
    pub const STARTER_VOLTAGE: &str = "/Dc/1/Voltage";
    pub const SOC: &str = "/Soc";
    pub const INSTALLED_CAPACITY: &str = "/InstalledCapacity";
    pub const CAPACITY: &str = "/Capacity";
    pub const CONSUMED_AMPHOURS: &str = "/ConsumedAmphours";
    pub const TIME_TO_GO: &str = "/TimeToGo";

    pub const HISTORY_CHARGE_CYCLES: &str = "/History/ChargeCycles";
    pub const HISTORY_FULL_DISCHARGES: &str = "/History/FullDischarges";
    pub const HISTORY_AUTOMATIC_SYNCS: &str = "/History/AutomaticSyncs";
    pub const HISTORY_LOW_VOLTAGE_ALARMS: &str = "/History/LowVoltageAlarms";
    pub const HISTORY_HIGH_VOLTAGE_ALARMS: &str = "/History/HighVoltageAlarms";
    pub const HISTORY_TOTAL_AH_DRAWN: &str = "/History/TotalAhDrawn";
    pub const HISTORY_CHARGED_ENERGY: &str = "/History/ChargedEnergy";
    pub const HISTORY_DISCHARGED_ENERGY: &str = "/History/DischargedEnergy";
    pub const HISTORY_LAST_DISCHARGE: &str = "/History/LastDischarge";
    pub const HISTORY_AVERAGE_DISCHARGE: &str = "/History/AverageDischarge";
    pub const HISTORY_DEEPEST_DISCHARGE: &str = "/History/DeepestDischarge";
    pub const HISTORY_TIME_SINCE_FULL_CHARGE: &str = "/History/TimeSinceLastFullCharge";
    pub const HISTORY_MIN_VOLTAGE: &str = "/History/MinimumVoltage";
    pub const HISTORY_MAX_VOLTAGE: &str = "/History/MaximumVoltage";
    pub const HISTORY_MIN_TEMPERATURE: &str = "/History/MinimumTemperature";
    pub const HISTORY_MAX_TEMPERATURE: &str = "/History/MaximumTemperature";
    pub const HISTORY_MIN_STARTER_VOLTAGE: &str = "/History/MinimumStarterVoltage";
    pub const HISTORY_MAX_STARTER_VOLTAGE: &str = "/History/MaximumStarterVoltage";

    pub const ERR_HEX_CHECKSUM: &str = "/VEDirect/HexChecksumErrors";
    pub const ERR_HEX_INVALID_CHARACTER: &str = "/VEDirect/HexInvalidCharacterErrors";
    pub const ERR_HEX_UNFINISHED: &str = "/VEDirect/HexUnfinishedErrors";
    pub const ERR_TEXT_CHECKSUM: &str = "/VEDirect/TextChecksumErrors";
    pub const ERR_TEXT_PARSE: &str = "/VEDirect/TextParseError";
    pub const ERR_TEXT_UNFINISHED: &str = "/VEDirect/TextUnfinishedErrors";

    pub const MAX_CHARGE_VOLTAGE: &str = "/Info/MaxChargeVoltage";
    pub const MAX_CHARGE_CURRENT: &str = "/Info/MaxChargeCurrent";
    pub const MAX_DISCHARGE_CURRENT: &str = "/Info/MaxDischargeCurrent";
    pub const ALLOW_TO_CHARGE: &str = "/Io/AllowToCharge";
    pub const ALLOW_TO_DISCHARGE: &str = "/Io/AllowToDischarge";

    pub const SETTINGS_CHARGED_VOLTAGE: &str = "/Settings/ChargedVoltage";
    pub const SETTINGS_TAIL_CURRENT: &str = "/Settings/TailCurrent";
    pub const SETTINGS_CHARGE_EFFICIENCY: &str = "/Settings/ChargeEfficiency";
    pub const SETTINGS_PEUKERT_EXPONENT: &str = "/Settings/PeukertExponent";
    pub const SETTINGS_CURRENT_THRESHOLD: &str = "/Settings/CurrentThreshold";
    pub const SETTINGS_DISCHARGE_FLOOR: &str = "/Settings/DischargeFloor";
}

/// Properties that must all resolve before a device is admitted.
pub const REQUIRED_PATHS: [&str; 4] = [
    paths::DEVICE_INSTANCE,
    paths::DC_VOLTAGE,
    paths::DC_CURRENT,
    paths::SOC,
];

/// Every member property the value cache keeps track of.
pub const MONITORED_PATHS: &[&str] = &[
    paths::PRODUCT_NAME,
    paths::PRODUCT_ID,
    paths::CUSTOM_NAME,
    paths::DEVICE_INSTANCE,
    paths::FIRMWARE_VERSION,
    paths::DC_VOLTAGE,
    paths::DC_CURRENT,
    paths::DC_POWER,
    paths::DC_TEMPERATURE,
    paths::STARTER_VOLTAGE,
    paths::SOC,
    paths::INSTALLED_CAPACITY,
    paths::CONSUMED_AMPHOURS,
    paths::TIME_TO_GO,
    "/Alarms/Alarm",
    "/Alarms/LowVoltage",
    "/Alarms/HighVoltage",
    "/Alarms/LowStarterVoltage",
    "/Alarms/HighStarterVoltage",
    "/Alarms/LowSoc",
    "/Alarms/LowTemperature",
    "/Alarms/HighTemperature",
    "/Alarms/MidVoltage",
    paths::HISTORY_CHARGE_CYCLES,
    paths::HISTORY_FULL_DISCHARGES,
    paths::HISTORY_AUTOMATIC_SYNCS,
    paths::HISTORY_LOW_VOLTAGE_ALARMS,
    paths::HISTORY_HIGH_VOLTAGE_ALARMS,
    paths::HISTORY_TOTAL_AH_DRAWN,
    paths::HISTORY_CHARGED_ENERGY,
    paths::HISTORY_DISCHARGED_ENERGY,
    paths::HISTORY_LAST_DISCHARGE,
    paths::HISTORY_AVERAGE_DISCHARGE,
    paths::HISTORY_DEEPEST_DISCHARGE,
    paths::HISTORY_TIME_SINCE_FULL_CHARGE,
    paths::HISTORY_MIN_VOLTAGE,
    paths::HISTORY_MAX_VOLTAGE,
    paths::HISTORY_MIN_TEMPERATURE,
    paths::HISTORY_MAX_TEMPERATURE,
    paths::HISTORY_MIN_STARTER_VOLTAGE,
    paths::HISTORY_MAX_STARTER_VOLTAGE,
    paths::ERR_HEX_CHECKSUM,
    paths::ERR_HEX_INVALID_CHARACTER,
    paths::ERR_HEX_UNFINISHED,
    paths::ERR_TEXT_CHECKSUM,
    paths::ERR_TEXT_PARSE,
    paths::ERR_TEXT_UNFINISHED,
    paths::SETTINGS_CHARGED_VOLTAGE,
    paths::SETTINGS_TAIL_CURRENT,
    paths::SETTINGS_CHARGE_EFFICIENCY,
    paths::SETTINGS_PEUKERT_EXPONENT,
    paths::SETTINGS_CURRENT_THRESHOLD,
    paths::SETTINGS_DISCHARGE_FLOOR,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AlarmKind {
    Alarm,
    LowVoltage,
    HighVoltage,
    LowStarterVoltage,
    HighStarterVoltage,
    LowSoc,
    LowTemperature,
    HighTemperature,
    MidVoltage,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 9] = [
        AlarmKind::Alarm,
        AlarmKind::LowVoltage,
        AlarmKind::HighVoltage,
        AlarmKind::LowStarterVoltage,
        AlarmKind::HighStarterVoltage,
        AlarmKind::LowSoc,
        AlarmKind::LowTemperature,
        AlarmKind::HighTemperature,
        AlarmKind::MidVoltage,
    ];

    pub fn path(self) -> &'static str {
        match self {
            AlarmKind::Alarm => "/Alarms/Alarm",
            AlarmKind::LowVoltage => "/Alarms/LowVoltage",
            AlarmKind::HighVoltage => "/Alarms/HighVoltage",
            AlarmKind::LowStarterVoltage => "/Alarms/LowStarterVoltage",
            AlarmKind::HighStarterVoltage => "/Alarms/HighStarterVoltage",
            AlarmKind::LowSoc => "/Alarms/LowSoc",
            AlarmKind::LowTemperature => "/Alarms/LowTemperature",
            AlarmKind::HighTemperature => "/Alarms/HighTemperature",
            AlarmKind::MidVoltage => "/Alarms/MidVoltage",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.path() == path)
    }
}

/// Severity as reported on the bus: 0 ok, 1 warning, 2 alarm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AlarmLevel {
    #[default]
    Ok,
    Warning,
    Alarm,
}

impl AlarmLevel {
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            i64::MIN..=0 => AlarmLevel::Ok,
            1 => AlarmLevel::Warning,
            _ => AlarmLevel::Alarm,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            AlarmLevel::Ok => 0,
            AlarmLevel::Warning => 1,
            AlarmLevel::Alarm => 2,
        }
    }

    pub fn is_set(self) -> bool {
        self != AlarmLevel::Ok
    }
}

pub type AlarmSet = BTreeMap<AlarmKind, AlarmLevel>;

/// Shunt configuration values that have to agree across a bank for the
/// members' state of charge to stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ShuntSetting {
    ChargedVoltage,
    TailCurrent,
    ChargeEfficiency,
    PeukertExponent,
    CurrentThreshold,
    DischargeFloor,
}

impl ShuntSetting {
    pub const ALL: [ShuntSetting; 6] = [
        ShuntSetting::ChargedVoltage,
        ShuntSetting::TailCurrent,
        ShuntSetting::ChargeEfficiency,
        ShuntSetting::PeukertExponent,
        ShuntSetting::CurrentThreshold,
        ShuntSetting::DischargeFloor,
    ];

    pub fn path(self) -> &'static str {
        match self {
            ShuntSetting::ChargedVoltage => paths::SETTINGS_CHARGED_VOLTAGE,
            ShuntSetting::TailCurrent => paths::SETTINGS_TAIL_CURRENT,
            ShuntSetting::ChargeEfficiency => paths::SETTINGS_CHARGE_EFFICIENCY,
            ShuntSetting::PeukertExponent => paths::SETTINGS_PEUKERT_EXPONENT,
            ShuntSetting::CurrentThreshold => paths::SETTINGS_CURRENT_THRESHOLD,
            ShuntSetting::DischargeFloor => paths::SETTINGS_DISCHARGE_FLOOR,
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|setting| setting.path() == path)
    }

    /// A mismatch in a critical setting makes the bank charge wrongly.
    /// The others only degrade SoC accuracy.
    pub fn is_critical(self) -> bool {
        self == ShuntSetting::ChargedVoltage
    }

    /// Spread below which two values count as equal.
    pub fn tolerance(self) -> f64 {
        match self {
            ShuntSetting::ChargeEfficiency | ShuntSetting::DischargeFloor => 0.5,
            _ => 0.01,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ShuntSetting::ChargedVoltage => "charged voltage",
            ShuntSetting::TailCurrent => "tail current",
            ShuntSetting::ChargeEfficiency => "charge efficiency",
            ShuntSetting::PeukertExponent => "Peukert exponent",
            ShuntSetting::CurrentThreshold => "current threshold",
            ShuntSetting::DischargeFloor => "discharge floor",
        }
    }
}

pub type ShuntSettings = BTreeMap<ShuntSetting, f64>;

/// Lifetime counters and extrema a shunt keeps about its battery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    pub charge_cycles: Option<u64>,
    pub full_discharges: Option<u64>,
    pub automatic_syncs: Option<u64>,
    pub low_voltage_alarms: Option<u64>,
    pub high_voltage_alarms: Option<u64>,
    pub total_ah_drawn: Option<f64>,
    pub charged_energy: Option<f64>,
    pub discharged_energy: Option<f64>,
    pub last_discharge: Option<f64>,
    pub average_discharge: Option<f64>,
    pub deepest_discharge: Option<f64>,
    pub time_since_full_charge: Option<f64>,
    pub min_voltage: Option<f64>,
    pub max_voltage: Option<f64>,
    pub min_temperature: Option<f64>,
    pub max_temperature: Option<f64>,
    pub min_starter_voltage: Option<f64>,
    pub max_starter_voltage: Option<f64>,
}

/// Serial link error counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorCounters {
    pub hex_checksum: Option<u64>,
    pub hex_invalid_character: Option<u64>,
    pub hex_unfinished: Option<u64>,
    pub text_checksum: Option<u64>,
    pub text_parse: Option<u64>,
    pub text_unfinished: Option<u64>,
}

/// Last known measurements of one shunt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemberSnapshot {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub soc: Option<f64>,
    pub temperature: Option<f64>,
    pub starter_voltage: Option<f64>,
    /// Installed capacity in Ah.
    pub capacity: Option<f64>,
    pub consumed_amphours: Option<f64>,
    /// The shunt's own time-to-go estimate, seconds.
    pub time_to_go: Option<f64>,
    pub alarms: AlarmSet,
    pub history: History,
    pub errors: ErrorCounters,
    pub settings: ShuntSettings,
}

fn as_count(value: &BusValue) -> Option<u64> {
    value
        .as_f64()
        .filter(|v| *v >= 0.0)
        .map(|v| v.round() as u64)
}

impl MemberSnapshot {
    /// Stores `value` under `path`. Returns false when the path is not a
    /// measurement this snapshot tracks.
    pub fn apply(&mut self, path: &str, value: &BusValue) -> bool {
        if let Some(kind) = AlarmKind::from_path(path) {
            match value.as_i64() {
                Some(raw) => {
                    self.alarms.insert(kind, AlarmLevel::from_raw(raw));
                }
                None => {
                    self.alarms.remove(&kind);
                }
            }
            return true;
        }
        if let Some(setting) = ShuntSetting::from_path(path) {
            match value.as_f64() {
                Some(v) => {
                    self.settings.insert(setting, v);
                }
                None => {
                    self.settings.remove(&setting);
                }
            }
            return true;
        }

        let number = value.as_f64();
        let history = &mut self.history;
        let errors = &mut self.errors;
        match path {
            paths::DC_VOLTAGE => self.voltage = number,
            paths::DC_CURRENT => self.current = number,
            paths::DC_POWER => self.power = number,
            paths::DC_TEMPERATURE => self.temperature = number,
            paths::STARTER_VOLTAGE => self.starter_voltage = number,
            paths::SOC => self.soc = number,
            paths::INSTALLED_CAPACITY => self.capacity = number,
            paths::CONSUMED_AMPHOURS => self.consumed_amphours = number,
            paths::TIME_TO_GO => self.time_to_go = number,
            paths::HISTORY_CHARGE_CYCLES => history.charge_cycles = as_count(value),
            paths::HISTORY_FULL_DISCHARGES => history.full_discharges = as_count(value),
            paths::HISTORY_AUTOMATIC_SYNCS => history.automatic_syncs = as_count(value),
            paths::HISTORY_LOW_VOLTAGE_ALARMS => history.low_voltage_alarms = as_count(value),
            paths::HISTORY_HIGH_VOLTAGE_ALARMS => history.high_voltage_alarms = as_count(value),
            paths::HISTORY_TOTAL_AH_DRAWN => history.total_ah_drawn = number,
            paths::HISTORY_CHARGED_ENERGY => history.charged_energy = number,
            paths::HISTORY_DISCHARGED_ENERGY => history.discharged_energy = number,
            paths::HISTORY_LAST_DISCHARGE => history.last_discharge = number,
            paths::HISTORY_AVERAGE_DISCHARGE => history.average_discharge = number,
            paths::HISTORY_DEEPEST_DISCHARGE => history.deepest_discharge = number,
            paths::HISTORY_TIME_SINCE_FULL_CHARGE => history.time_since_full_charge = number,
            paths::HISTORY_MIN_VOLTAGE => history.min_voltage = number,
            paths::HISTORY_MAX_VOLTAGE => history.max_voltage = number,
            paths::HISTORY_MIN_TEMPERATURE => history.min_temperature = number,
            paths::HISTORY_MAX_TEMPERATURE => history.max_temperature = number,
            paths::HISTORY_MIN_STARTER_VOLTAGE => history.min_starter_voltage = number,
            paths::HISTORY_MAX_STARTER_VOLTAGE => history.max_starter_voltage = number,
            paths::ERR_HEX_CHECKSUM => errors.hex_checksum = as_count(value),
            paths::ERR_HEX_INVALID_CHARACTER => errors.hex_invalid_character = as_count(value),
            paths::ERR_HEX_UNFINISHED => errors.hex_unfinished = as_count(value),
            paths::ERR_TEXT_CHECKSUM => errors.text_checksum = as_count(value),
            paths::ERR_TEXT_PARSE => errors.text_parse = as_count(value),
            paths::ERR_TEXT_UNFINISHED => errors.text_unfinished = as_count(value),
            _ => return false,
        }
        true
    }

    pub fn alarm(&self, kind: AlarmKind) -> AlarmLevel {
        self.alarms.get(&kind).copied().unwrap_or_default()
    }
}

/// One physical shunt backing the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberDevice {
    pub address: String,
    pub instance: u32,
    pub custom_name: Option<String>,
    pub product_name: Option<String>,
    pub product_id: Option<i64>,
    pub firmware_version: Option<i64>,
    /// Operator-assigned name, takes precedence over the bus name.
    pub alias: Option<String>,
    /// Cleared by the control surface; disabled members are not aggregated.
    pub enabled: bool,
    pub snapshot: MemberSnapshot,
}

impl MemberDevice {
    pub fn new(address: impl Into<String>, instance: u32) -> Self {
        Self {
            address: address.into(),
            instance,
            custom_name: None,
            product_name: None,
            product_id: None,
            firmware_version: None,
            alias: None,
            enabled: true,
            snapshot: MemberSnapshot::default(),
        }
    }

    pub fn display_name(&self) -> String {
        match self.alias.as_ref().or(self.custom_name.as_ref()) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("Shunt {}", self.instance),
        }
    }

    /// Applies a property update to identity or measurements.
    pub fn apply(&mut self, path: &str, value: &BusValue) -> bool {
        match path {
            paths::CUSTOM_NAME => self.custom_name = value.as_text().map(str::to_string),
            paths::PRODUCT_NAME => self.product_name = value.as_text().map(str::to_string),
            paths::PRODUCT_ID => self.product_id = value.as_i64(),
            paths::FIRMWARE_VERSION => self.firmware_version = value.as_i64(),
            // The instance is the member's identity and never changes in place.
            paths::DEVICE_INSTANCE => {}
            _ => return self.snapshot.apply(path, value),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_paths_round_trip_through_kinds() {
        for kind in AlarmKind::ALL {
            assert_eq!(AlarmKind::from_path(kind.path()), Some(kind));
            assert!(MONITORED_PATHS.contains(&kind.path()));
        }
        assert_eq!(AlarmKind::from_path("/Alarms/Unknown"), None);
    }

    #[test]
    fn test_alarm_level_from_raw() {
        assert_eq!(AlarmLevel::from_raw(0), AlarmLevel::Ok);
        assert_eq!(AlarmLevel::from_raw(1), AlarmLevel::Warning);
        assert_eq!(AlarmLevel::from_raw(2), AlarmLevel::Alarm);
        assert!(!AlarmLevel::Ok.is_set());
        assert!(AlarmLevel::Warning.is_set());
    }

    #[test]
    fn test_apply_updates_only_the_named_field() {
        let mut snapshot = MemberSnapshot::default();
        assert!(snapshot.apply(paths::DC_VOLTAGE, &BusValue::Float(13.2)));
        assert!(snapshot.apply(paths::DC_CURRENT, &BusValue::Float(-4.5)));
        assert_eq!(snapshot.voltage, Some(13.2));
        assert_eq!(snapshot.current, Some(-4.5));
        assert_eq!(snapshot.soc, None);

        assert!(snapshot.apply(paths::DC_VOLTAGE, &BusValue::Empty));
        assert_eq!(snapshot.voltage, None);
        assert_eq!(snapshot.current, Some(-4.5));
    }

    #[test]
    fn test_apply_alarm_and_history() {
        let mut snapshot = MemberSnapshot::default();
        snapshot.apply("/Alarms/LowVoltage", &BusValue::Int(2));
        snapshot.apply(paths::HISTORY_CHARGE_CYCLES, &BusValue::Int(17));
        assert_eq!(snapshot.alarm(AlarmKind::LowVoltage), AlarmLevel::Alarm);
        assert_eq!(snapshot.alarm(AlarmKind::HighVoltage), AlarmLevel::Ok);
        assert_eq!(snapshot.history.charge_cycles, Some(17));

        snapshot.apply("/Alarms/LowVoltage", &BusValue::Empty);
        assert_eq!(snapshot.alarm(AlarmKind::LowVoltage), AlarmLevel::Ok);
    }

    #[test]
    fn test_capacity_follows_installed_capacity_only() {
        let mut snapshot = MemberSnapshot::default();
        snapshot.apply(paths::CONSUMED_AMPHOURS, &BusValue::Float(-50.0));
        snapshot.apply(paths::SOC, &BusValue::Float(50.0));
        assert_eq!(snapshot.capacity, None);

        snapshot.apply(paths::INSTALLED_CAPACITY, &BusValue::Int(300));
        assert_eq!(snapshot.capacity, Some(300.0));
        snapshot.apply(paths::INSTALLED_CAPACITY, &BusValue::Empty);
        assert_eq!(snapshot.capacity, None);
    }

    #[test]
    fn test_settings_are_tracked_per_kind() {
        for setting in ShuntSetting::ALL {
            assert_eq!(ShuntSetting::from_path(setting.path()), Some(setting));
            assert!(MONITORED_PATHS.contains(&setting.path()));
        }
        let mut snapshot = MemberSnapshot::default();
        assert!(snapshot.apply(paths::SETTINGS_CHARGED_VOLTAGE, &BusValue::Float(14.4)));
        assert_eq!(snapshot.settings.get(&ShuntSetting::ChargedVoltage), Some(&14.4));
        snapshot.apply(paths::SETTINGS_CHARGED_VOLTAGE, &BusValue::Empty);
        assert!(snapshot.settings.is_empty());
    }

    #[test]
    fn test_unmonitored_path_is_rejected() {
        let mut device = MemberDevice::new("com.victronenergy.battery.ttyS5", 278);
        assert!(!device.apply("/Relay/0/State", &BusValue::Int(1)));
        assert!(device.apply(paths::CUSTOM_NAME, &BusValue::from("House bank A")));
        assert_eq!(device.display_name(), "House bank A");
        device.alias = Some("Port".to_string());
        assert_eq!(device.display_name(), "Port");
    }

    #[test]
    fn test_display_name_falls_back_to_instance() {
        let device = MemberDevice::new("com.victronenergy.battery.ttyS6", 277);
        assert_eq!(device.display_name(), "Shunt 277");
    }
}
