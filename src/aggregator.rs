//! Fusion of member shunt readings into one battery bank.
//!
//! [`aggregate`] is a pure function: it only reads the members it is given
//! and always rebuilds the whole [`AggregateSnapshot`]. Only enabled members
//! take part. Every field of the snapshot is an `Option`; `None` means "no
//! data" and is what an empty bank reports.

use crate::member::{
    AlarmKind, AlarmLevel, AlarmSet, ErrorCounters, History, MemberDevice, ShuntSetting,
};
use serde_derive::Serialize;

/// Temperatures at or beyond these values are treated as dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureThresholds {
    pub cold_danger: f64,
    pub hot_danger: f64,
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self {
            cold_danger: 5.0,
            hot_danger: 45.0,
        }
    }
}

/// Configured ceilings exposed in charge-control mode. The charge voltage
/// is further capped by the lowest charged voltage any member is set to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChargeLimits {
    pub max_charge_voltage: Option<f64>,
    pub max_charge_current: Option<f64>,
    pub max_discharge_current: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregationParams {
    pub thresholds: TemperatureThresholds,
    /// `Some` when the engine runs as a virtual BMS.
    pub charge_limits: Option<ChargeLimits>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeControl {
    pub max_charge_voltage: Option<f64>,
    pub max_charge_current: Option<f64>,
    pub max_discharge_current: Option<f64>,
    pub allow_to_charge: Option<bool>,
    pub allow_to_discharge: Option<bool>,
}

/// Identity of a member currently backing the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackingMember {
    pub address: String,
    pub instance: u32,
    pub name: String,
    pub product_name: Option<String>,
    pub firmware_version: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub temperature: Option<f64>,
    pub soc: Option<f64>,
    pub starter_voltage: Option<f64>,
    pub installed_capacity: Option<f64>,
    pub remaining_capacity: Option<f64>,
    pub consumed_amphours: Option<f64>,
    /// Seconds until the bank is empty at the present discharge rate.
    pub time_to_go: Option<f64>,
    pub alarms: Option<AlarmSet>,
    pub history: History,
    pub errors: ErrorCounters,
    pub members: Vec<BackingMember>,
    pub charge_control: Option<ChargeControl>,
}

impl AggregateSnapshot {
    pub fn has_data(&self) -> bool {
        !self.members.is_empty()
    }
}

/// Alarms that forbid charging the bank.
const CHARGE_INHIBITING: [AlarmKind; 3] = [
    AlarmKind::HighVoltage,
    AlarmKind::HighTemperature,
    AlarmKind::LowTemperature,
];

/// Alarms that forbid discharging the bank.
const DISCHARGE_INHIBITING: [AlarmKind; 3] = [
    AlarmKind::LowVoltage,
    AlarmKind::LowSoc,
    AlarmKind::HighTemperature,
];

pub fn aggregate<'a, I>(members: I, params: &AggregationParams) -> AggregateSnapshot
where
    I: IntoIterator<Item = &'a MemberDevice>,
{
    let enabled: Vec<&MemberDevice> = members.into_iter().filter(|m| m.enabled).collect();

    if enabled.is_empty() {
        return AggregateSnapshot {
            charge_control: params.charge_limits.map(|limits| ChargeControl {
                max_charge_voltage: limits.max_charge_voltage,
                max_charge_current: limits.max_charge_current,
                max_discharge_current: limits.max_discharge_current,
                allow_to_charge: None,
                allow_to_discharge: None,
            }),
            ..Default::default()
        };
    }

    let current = sum(enabled.iter().map(|m| m.snapshot.current));
    let soc = fuse_soc(&enabled);
    let installed_capacity = sum(
        enabled
            .iter()
            .map(|m| m.snapshot.capacity.filter(|c| *c > 0.0)),
    );
    let remaining_capacity = match (installed_capacity, soc) {
        (Some(capacity), Some(soc)) => Some(capacity * soc / 100.0),
        _ => None,
    };
    let time_to_go = match (remaining_capacity, current) {
        (Some(remaining), Some(current)) if current < 0.0 => Some(remaining / -current * 3600.0),
        _ => None,
    };
    let alarms = merge_alarms(&enabled);

    let charge_control = params.charge_limits.map(|limits| ChargeControl {
        max_charge_voltage: charge_voltage_limit(limits.max_charge_voltage, &enabled),
        max_charge_current: limits.max_charge_current,
        max_discharge_current: limits.max_discharge_current,
        allow_to_charge: Some(!any_set(&alarms, &CHARGE_INHIBITING)),
        allow_to_discharge: Some(!any_set(&alarms, &DISCHARGE_INHIBITING)),
    });

    AggregateSnapshot {
        voltage: fuse_voltage(&enabled),
        current,
        power: sum(enabled.iter().map(|m| {
            let s = &m.snapshot;
            s.power.or_else(|| Some(s.voltage? * s.current?))
        })),
        temperature: fuse_temperature(&enabled, &params.thresholds),
        soc,
        starter_voltage: min(enabled
            .iter()
            .filter_map(|m| m.snapshot.starter_voltage.filter(|v| *v > 0.0))),
        installed_capacity,
        remaining_capacity,
        consumed_amphours: sum(enabled.iter().map(|m| m.snapshot.consumed_amphours)),
        time_to_go,
        alarms: Some(alarms),
        history: merge_history(&enabled),
        errors: merge_errors(&enabled),
        members: enabled
            .iter()
            .map(|m| BackingMember {
                address: m.address.clone(),
                instance: m.instance,
                name: m.display_name(),
                product_name: m.product_name.clone(),
                firmware_version: m.firmware_version,
            })
            .collect(),
        charge_control,
    }
}

/// Members disagreeing on one shunt setting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingMismatch {
    pub setting: ShuntSetting,
    pub min: f64,
    pub max: f64,
    /// Display name and value of every member reporting the setting.
    pub values: Vec<(String, f64)>,
}

/// Compares the shunt settings of the enabled members. Members that do not
/// report a setting are left out of its comparison.
pub fn check_settings<'a, I>(members: I) -> Vec<SettingMismatch>
where
    I: IntoIterator<Item = &'a MemberDevice>,
{
    let enabled: Vec<&MemberDevice> = members.into_iter().filter(|m| m.enabled).collect();
    ShuntSetting::ALL
        .into_iter()
        .filter_map(|setting| {
            let values: Vec<(String, f64)> = enabled
                .iter()
                .filter_map(|m| {
                    let value = m.snapshot.settings.get(&setting)?;
                    Some((m.display_name(), *value))
                })
                .collect();
            let min = min(values.iter().map(|(_, v)| *v))?;
            let max = max(values.iter().map(|(_, v)| *v))?;
            (max - min > setting.tolerance()).then_some(SettingMismatch {
                setting,
                min,
                max,
                values,
            })
        })
        .collect()
}

/// The configured limit, never above the lowest member charged voltage.
fn charge_voltage_limit(configured: Option<f64>, members: &[&MemberDevice]) -> Option<f64> {
    let lowest = min(members.iter().filter_map(|m| {
        let charged = m.snapshot.settings.get(&ShuntSetting::ChargedVoltage)?;
        (*charged > 0.0).then_some(*charged)
    }));
    match (configured, lowest) {
        (Some(limit), Some(lowest)) => Some(limit.min(lowest)),
        (limit, lowest) => limit.or(lowest),
    }
}

/// Worst-case voltage while any member alarms, mean otherwise.
/// Low voltage wins over high voltage.
fn fuse_voltage(members: &[&MemberDevice]) -> Option<f64> {
    let readings: Vec<f64> = members.iter().filter_map(|m| m.snapshot.voltage).collect();
    let low = members
        .iter()
        .any(|m| m.snapshot.alarm(AlarmKind::LowVoltage).is_set());
    let high = members
        .iter()
        .any(|m| m.snapshot.alarm(AlarmKind::HighVoltage).is_set());

    if low {
        min(readings.iter().copied())
    } else if high {
        max(readings.iter().copied())
    } else {
        mean(&readings)
    }
}

/// Coldest or hottest reading once a danger threshold is reached. When both
/// are breached the reading furthest past its threshold wins, cold on a tie.
fn fuse_temperature(members: &[&MemberDevice], thresholds: &TemperatureThresholds) -> Option<f64> {
    let readings: Vec<f64> = members
        .iter()
        .filter_map(|m| m.snapshot.temperature)
        .collect();
    let coldest = min(readings.iter().copied())?;
    let hottest = max(readings.iter().copied())?;

    let cold = coldest <= thresholds.cold_danger;
    let hot = hottest >= thresholds.hot_danger;
    match (cold, hot) {
        (true, true) => {
            let cold_excursion = thresholds.cold_danger - coldest;
            let hot_excursion = hottest - thresholds.hot_danger;
            if hot_excursion > cold_excursion {
                Some(hottest)
            } else {
                Some(coldest)
            }
        }
        (true, false) => Some(coldest),
        (false, true) => Some(hottest),
        (false, false) => mean(&readings),
    }
}

/// Capacity-weighted SoC. Members without a usable capacity carry no weight;
/// if nobody has one the plain mean is used instead.
fn fuse_soc(members: &[&MemberDevice]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut weight = 0.0;
    for member in members {
        if let (Some(soc), Some(capacity)) = (member.snapshot.soc, member.snapshot.capacity) {
            if capacity > 0.0 {
                weighted += soc * capacity;
                weight += capacity;
            }
        }
    }
    if weight > 0.0 {
        return Some(weighted / weight);
    }
    let readings: Vec<f64> = members.iter().filter_map(|m| m.snapshot.soc).collect();
    mean(&readings)
}

fn merge_alarms(members: &[&MemberDevice]) -> AlarmSet {
    AlarmKind::ALL
        .into_iter()
        .map(|kind| {
            let level = members
                .iter()
                .map(|m| m.snapshot.alarm(kind))
                .max()
                .unwrap_or(AlarmLevel::Ok);
            (kind, level)
        })
        .collect()
}

fn any_set(alarms: &AlarmSet, kinds: &[AlarmKind]) -> bool {
    kinds
        .iter()
        .any(|kind| alarms.get(kind).is_some_and(|level| level.is_set()))
}

fn merge_history(members: &[&MemberDevice]) -> History {
    let field =
        |f: fn(&History) -> Option<f64>| members.iter().map(move |m| f(&m.snapshot.history));
    let count =
        |f: fn(&History) -> Option<u64>| members.iter().map(move |m| f(&m.snapshot.history));
    let average_discharge: Vec<f64> = field(|h| h.average_discharge).flatten().collect();

    History {
        charge_cycles: sum_counts(count(|h| h.charge_cycles)),
        full_discharges: sum_counts(count(|h| h.full_discharges)),
        automatic_syncs: sum_counts(count(|h| h.automatic_syncs)),
        low_voltage_alarms: sum_counts(count(|h| h.low_voltage_alarms)),
        high_voltage_alarms: sum_counts(count(|h| h.high_voltage_alarms)),
        total_ah_drawn: sum(field(|h| h.total_ah_drawn)),
        charged_energy: sum(field(|h| h.charged_energy)),
        discharged_energy: sum(field(|h| h.discharged_energy)),
        last_discharge: sum(field(|h| h.last_discharge)),
        average_discharge: mean(&average_discharge),
        // Discharges are negative, the deepest one is the minimum.
        deepest_discharge: min(field(|h| h.deepest_discharge).flatten()),
        time_since_full_charge: max(field(|h| h.time_since_full_charge).flatten()),
        min_voltage: min(field(|h| h.min_voltage).flatten()),
        max_voltage: max(field(|h| h.max_voltage).flatten()),
        min_temperature: min(field(|h| h.min_temperature).flatten()),
        max_temperature: max(field(|h| h.max_temperature).flatten()),
        min_starter_voltage: min(field(|h| h.min_starter_voltage).flatten().filter(|v| *v > 0.0)),
        max_starter_voltage: max(field(|h| h.max_starter_voltage).flatten().filter(|v| *v > 0.0)),
    }
}

fn merge_errors(members: &[&MemberDevice]) -> ErrorCounters {
    let count =
        |f: fn(&ErrorCounters) -> Option<u64>| members.iter().map(move |m| f(&m.snapshot.errors));
    ErrorCounters {
        hex_checksum: sum_counts(count(|e| e.hex_checksum)),
        hex_invalid_character: sum_counts(count(|e| e.hex_invalid_character)),
        hex_unfinished: sum_counts(count(|e| e.hex_unfinished)),
        text_checksum: sum_counts(count(|e| e.text_checksum)),
        text_parse: sum_counts(count(|e| e.text_parse)),
        text_unfinished: sum_counts(count(|e| e.text_unfinished)),
    }
}

/// Sum of the known values, `None` if there are none.
fn sum(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values
        .flatten()
        .fold(None::<f64>, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn sum_counts(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values
        .flatten()
        .fold(None::<u64>, |acc, v| Some(acc.unwrap_or(0).saturating_add(v)))
}

fn min(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
}

fn max(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
