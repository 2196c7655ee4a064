//! Holding register layout of a battery monitor, shared by the Modbus
//! adapter (reading member shunts through a gateway) and the exporter
//! (serving the virtual device).
//!
//! Every property maps to a fixed register, an integer kind and a scale
//! factor. A register holding the kind's sentinel means "no data".

use crate::bus::BusValue;
use crate::member::paths;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    U16,
    I16,
    U32,
    I32,
}

impl RegisterKind {
    /// Number of 16 bit registers the value occupies.
    pub fn width(self) -> u16 {
        match self {
            RegisterKind::U16 | RegisterKind::I16 => 1,
            RegisterKind::U32 | RegisterKind::I32 => 2,
        }
    }

    fn sentinel(self) -> i64 {
        match self {
            RegisterKind::U16 => u16::MAX as i64,
            RegisterKind::I16 => i16::MAX as i64,
            RegisterKind::U32 => u32::MAX as i64,
            RegisterKind::I32 => i32::MAX as i64,
        }
    }

    /// Largest and smallest encodable raw values, the sentinel excluded.
    fn range(self) -> (i64, i64) {
        match self {
            RegisterKind::U16 | RegisterKind::U32 => (0, self.sentinel() - 1),
            RegisterKind::I16 => (i16::MIN as i64, self.sentinel() - 1),
            RegisterKind::I32 => (i32::MIN as i64, self.sentinel() - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterSpec {
    pub path: &'static str,
    pub register: u16,
    pub kind: RegisterKind,
    /// Raw register value = property value * scale.
    pub scale: f64,
}

const fn spec(
    path: &'static str,
    register: u16,
    kind: RegisterKind,
    scale: f64,
) -> RegisterSpec {
    RegisterSpec {
        path,
        register,
        kind,
        scale,
    }
}

use RegisterKind::{I16, I32, U16, U32};

pub const REGISTER_MAP: &[RegisterSpec] = &[
    spec(paths::DC_VOLTAGE, 259, U16, 100.0),
    spec(paths::STARTER_VOLTAGE, 260, U16, 100.0),
    spec(paths::DC_CURRENT, 261, I16, 10.0),
    spec(paths::DC_TEMPERATURE, 262, I16, 10.0),
    spec(paths::SOC, 266, U16, 10.0),
    spec("/Alarms/Alarm", 267, U16, 1.0),
    spec("/Alarms/LowVoltage", 268, U16, 1.0),
    spec("/Alarms/HighVoltage", 269, U16, 1.0),
    spec("/Alarms/LowStarterVoltage", 270, U16, 1.0),
    spec("/Alarms/HighStarterVoltage", 271, U16, 1.0),
    spec("/Alarms/LowSoc", 272, U16, 1.0),
    spec("/Alarms/LowTemperature", 273, U16, 1.0),
    spec("/Alarms/HighTemperature", 274, U16, 1.0),
    spec("/Alarms/MidVoltage", 275, U16, 1.0),
    spec(paths::HISTORY_DEEPEST_DISCHARGE, 281, I32, 10.0),
    spec(paths::HISTORY_LAST_DISCHARGE, 283, I32, 10.0),
    spec(paths::HISTORY_AVERAGE_DISCHARGE, 285, I32, 10.0),
    spec(paths::HISTORY_CHARGE_CYCLES, 287, U32, 1.0),
    spec(paths::HISTORY_FULL_DISCHARGES, 289, U32, 1.0),
    spec(paths::HISTORY_TOTAL_AH_DRAWN, 291, I32, 10.0),
    spec(paths::HISTORY_MIN_VOLTAGE, 293, U16, 100.0),
    spec(paths::HISTORY_MAX_VOLTAGE, 294, U16, 100.0),
    spec(paths::HISTORY_TIME_SINCE_FULL_CHARGE, 295, U32, 1.0),
    spec(paths::HISTORY_AUTOMATIC_SYNCS, 297, U32, 1.0),
    spec(paths::HISTORY_LOW_VOLTAGE_ALARMS, 299, U16, 1.0),
    spec(paths::HISTORY_HIGH_VOLTAGE_ALARMS, 300, U16, 1.0),
    spec(paths::HISTORY_MIN_STARTER_VOLTAGE, 301, U16, 100.0),
    spec(paths::HISTORY_MAX_STARTER_VOLTAGE, 302, U16, 100.0),
    spec(paths::HISTORY_DISCHARGED_ENERGY, 303, U32, 100.0),
    spec(paths::HISTORY_CHARGED_ENERGY, 305, U32, 100.0),
    spec(paths::TIME_TO_GO, 307, U32, 1.0),
    spec(paths::INSTALLED_CAPACITY, 309, U32, 10.0),
    spec(paths::CAPACITY, 311, U32, 10.0),
    spec(paths::HISTORY_MIN_TEMPERATURE, 313, I16, 10.0),
    spec(paths::HISTORY_MAX_TEMPERATURE, 314, I16, 10.0),
    spec(paths::ERR_HEX_CHECKSUM, 315, U16, 1.0),
    spec(paths::ERR_HEX_INVALID_CHARACTER, 316, U16, 1.0),
    spec(paths::ERR_HEX_UNFINISHED, 317, U16, 1.0),
    spec(paths::ERR_TEXT_CHECKSUM, 318, U16, 1.0),
    spec(paths::ERR_TEXT_PARSE, 319, U16, 1.0),
    spec(paths::ERR_TEXT_UNFINISHED, 320, U16, 1.0),
    spec(paths::MAX_CHARGE_VOLTAGE, 321, U16, 100.0),
    spec(paths::MAX_CHARGE_CURRENT, 322, U16, 10.0),
    spec(paths::MAX_DISCHARGE_CURRENT, 323, U16, 10.0),
    spec(paths::ALLOW_TO_CHARGE, 324, U16, 1.0),
    spec(paths::ALLOW_TO_DISCHARGE, 325, U16, 1.0),
    spec(paths::DEVICE_INSTANCE, 326, U16, 1.0),
    spec(paths::PRODUCT_ID, 327, U16, 1.0),
    spec(paths::FIRMWARE_VERSION, 328, U32, 1.0),
    spec(paths::DC_POWER, 330, I32, 1.0),
    spec(paths::CONSUMED_AMPHOURS, 332, I32, 10.0),
    spec(paths::SETTINGS_CHARGED_VOLTAGE, 334, U16, 100.0),
    spec(paths::SETTINGS_TAIL_CURRENT, 335, U16, 10.0),
    spec(paths::SETTINGS_CHARGE_EFFICIENCY, 336, U16, 1.0),
    spec(paths::SETTINGS_PEUKERT_EXPONENT, 337, U16, 100.0),
    spec(paths::SETTINGS_CURRENT_THRESHOLD, 338, U16, 100.0),
    spec(paths::SETTINGS_DISCHARGE_FLOOR, 339, U16, 10.0),
];

/// First register of the layout.
pub const BLOCK_START: u16 = 258;
/// Number of registers from [`BLOCK_START`] through the last mapped one.
pub const BLOCK_LEN: u16 = 340 - BLOCK_START;

pub fn lookup(path: &str) -> Option<&'static RegisterSpec> {
    REGISTER_MAP.iter().find(|spec| spec.path == path)
}

impl RegisterSpec {
    /// Encodes a property value, high word first. Values outside the
    /// register's range saturate.
    pub fn encode(&self, value: &BusValue) -> Vec<u16> {
        let raw = match value.as_f64() {
            Some(v) if v.is_finite() => {
                let (low, high) = self.kind.range();
                let scaled = (v * self.scale).round() as i64;
                let clamped = scaled.clamp(low, high);
                if clamped != scaled {
                    warn!(path = self.path, value = v, "Value out of register range, saturated");
                }
                clamped
            }
            _ => self.kind.sentinel(),
        };
        match self.kind.width() {
            1 => vec![raw as u16],
            _ => {
                let bits = raw as u32;
                vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16]
            }
        }
    }

    /// Decodes this property from `words`, which must start at
    /// `self.register`.
    pub fn decode(&self, words: &[u16]) -> BusValue {
        let raw = match (self.kind, words) {
            (U16, [w, ..]) => *w as i64,
            (I16, [w, ..]) => *w as i16 as i64,
            (U32, [hi, lo, ..]) => merge_u16_u32(*hi, *lo) as i64,
            (I32, [hi, lo, ..]) => merge_u16_u32(*hi, *lo) as i32 as i64,
            _ => return BusValue::Empty,
        };
        if raw == self.kind.sentinel() {
            BusValue::Empty
        } else if self.scale == 1.0 {
            BusValue::Int(raw)
        } else {
            BusValue::Float(raw as f64 / self.scale)
        }
    }

    /// Decodes this property out of a block read starting at `BLOCK_START`.
    pub fn decode_block(&self, block: &[u16]) -> BusValue {
        let offset = usize::from(self.register - BLOCK_START);
        block
            .get(offset..)
            .map_or(BusValue::Empty, |words| self.decode(words))
    }
}

/// Combines two registers into a u32, high word first.
fn merge_u16_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_has_no_overlaps() {
        let mut used = std::collections::HashSet::new();
        for spec in REGISTER_MAP {
            assert!(spec.register >= BLOCK_START);
            for r in spec.register..spec.register + spec.kind.width() {
                assert!(r < BLOCK_START + BLOCK_LEN, "{} outside block", spec.path);
                assert!(used.insert(r), "register {r} used twice");
            }
        }
    }

    #[test]
    fn test_scaled_values() {
        let voltage = lookup(paths::DC_VOLTAGE).unwrap();
        assert_eq!(voltage.encode(&BusValue::Float(13.21)), vec![1321]);
        assert_eq!(voltage.decode(&[1321]), BusValue::Float(13.21));

        let current = lookup(paths::DC_CURRENT).unwrap();
        assert_eq!(current.encode(&BusValue::Float(-12.5)), vec![(-125i16) as u16]);
        assert_eq!(current.decode(&[(-125i16) as u16]), BusValue::Float(-12.5));
    }

    #[test]
    fn test_no_data_uses_sentinels() {
        let soc = lookup(paths::SOC).unwrap();
        assert_eq!(soc.encode(&BusValue::Empty), vec![0xFFFF]);
        assert_eq!(soc.decode(&[0xFFFF]), BusValue::Empty);

        let current = lookup(paths::DC_CURRENT).unwrap();
        assert_eq!(current.encode(&BusValue::Empty), vec![0x7FFF]);
        assert_eq!(current.decode(&[0x7FFF]), BusValue::Empty);

        let ttg = lookup(paths::TIME_TO_GO).unwrap();
        assert_eq!(ttg.encode(&BusValue::Empty), vec![0xFFFF, 0xFFFF]);
        assert_eq!(ttg.decode(&[0xFFFF, 0xFFFF]), BusValue::Empty);

        let deepest = lookup(paths::HISTORY_DEEPEST_DISCHARGE).unwrap();
        assert_eq!(deepest.encode(&BusValue::Empty), vec![0x7FFF, 0xFFFF]);
    }

    #[test]
    fn test_out_of_range_values_saturate_below_sentinel() {
        let soc = lookup(paths::SOC).unwrap();
        assert_eq!(soc.encode(&BusValue::Float(1.0e9)), vec![0xFFFE]);
        assert_eq!(soc.encode(&BusValue::Float(-3.0)), vec![0]);
        assert_eq!(soc.encode(&BusValue::Float(f64::NAN)), vec![0xFFFF]);
    }

    #[test]
    fn test_bank_sized_power_and_consumed_ah_fit() {
        let power = lookup(paths::DC_POWER).unwrap();
        assert_eq!(power.kind, I32);
        let words = power.encode(&BusValue::Float(-45_000.0));
        assert_eq!(power.decode(&words), BusValue::Int(-45_000));

        let consumed = lookup(paths::CONSUMED_AMPHOURS).unwrap();
        let words = consumed.encode(&BusValue::Float(-4_250.5));
        assert_eq!(consumed.decode(&words), BusValue::Float(-4_250.5));
    }

    #[test]
    fn test_wide_values_are_high_word_first() {
        let ttg = lookup(paths::TIME_TO_GO).unwrap();
        assert_eq!(ttg.encode(&BusValue::Int(70_000)), vec![0x0001, 0x1170]);
        assert_eq!(ttg.decode(&[0x0001, 0x1170]), BusValue::Int(70_000));

        let deepest = lookup(paths::HISTORY_DEEPEST_DISCHARGE).unwrap();
        let words = deepest.encode(&BusValue::Float(-180.5));
        assert_eq!(deepest.decode(&words), BusValue::Float(-180.5));
    }

    #[test]
    fn test_decode_block_uses_offsets() {
        let mut block = vec![0u16; BLOCK_LEN as usize];
        block[usize::from(266 - BLOCK_START)] = 715;
        let soc = lookup(paths::SOC).unwrap();
        assert_eq!(soc.decode_block(&block), BusValue::Float(71.5));
        assert_eq!(soc.decode_block(&[]), BusValue::Empty);
    }

    #[test]
    fn test_text_paths_are_not_mapped() {
        assert!(lookup(paths::PRODUCT_NAME).is_none());
        assert!(lookup(paths::CUSTOM_NAME).is_none());
    }
}
