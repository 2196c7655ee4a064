//! Operator-facing switches the engine reads but never writes.
//!
//! The control surface decides which shunts take part in the aggregate, the
//! temperature danger thresholds and optional display names. Changes are
//! broadcast through a `watch` channel so the engine always sees the latest
//! settings without polling.

use crate::aggregator::TemperatureThresholds;
use crate::member::MemberDevice;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::watch;

/// Identifies a shunt either by device instance or by its custom name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShuntSelector {
    Instance(u32),
    Name(String),
}

impl ShuntSelector {
    pub fn matches(&self, device: &MemberDevice) -> bool {
        match self {
            ShuntSelector::Instance(instance) => *instance == device.instance,
            ShuntSelector::Name(name) => device.custom_name.as_deref() == Some(name.as_str()),
        }
    }
}

impl fmt::Display for ShuntSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShuntSelector::Instance(instance) => write!(f, "[{instance}]"),
            ShuntSelector::Name(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlSettings {
    pub excluded: Vec<ShuntSelector>,
    pub thresholds: TemperatureThresholds,
    /// Display names keyed by device instance.
    pub display_names: BTreeMap<u32, String>,
}

impl ControlSettings {
    pub fn is_enabled(&self, device: &MemberDevice) -> bool {
        !self.excluded.iter().any(|selector| selector.matches(device))
    }

    pub fn display_name(&self, instance: u32) -> Option<&str> {
        self.display_names.get(&instance).map(String::as_str)
    }
}

/// Writer side of the control surface.
///
/// Every mutator only notifies the engine when the settings actually change.
#[derive(Debug, Clone)]
pub struct ControlSurface {
    sender: watch::Sender<ControlSettings>,
}

impl ControlSurface {
    pub fn new(initial: ControlSettings) -> (Self, watch::Receiver<ControlSettings>) {
        let (sender, receiver) = watch::channel(initial);
        (Self { sender }, receiver)
    }

    pub fn current(&self) -> ControlSettings {
        self.sender.borrow().clone()
    }

    pub fn exclude(&self, selector: ShuntSelector) {
        self.sender.send_if_modified(|settings| {
            if settings.excluded.contains(&selector) {
                false
            } else {
                settings.excluded.push(selector);
                true
            }
        });
    }

    pub fn include(&self, selector: &ShuntSelector) {
        self.sender.send_if_modified(|settings| {
            let before = settings.excluded.len();
            settings.excluded.retain(|s| s != selector);
            settings.excluded.len() != before
        });
    }

    pub fn set_thresholds(&self, thresholds: TemperatureThresholds) {
        self.sender.send_if_modified(|settings| {
            if settings.thresholds == thresholds {
                false
            } else {
                settings.thresholds = thresholds;
                true
            }
        });
    }

    pub fn set_display_name(&self, instance: u32, name: impl Into<String>) {
        let name = name.into();
        self.sender.send_if_modified(|settings| {
            if settings.display_names.get(&instance) == Some(&name) {
                false
            } else {
                settings.display_names.insert(instance, name);
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(instance: u32, name: Option<&str>) -> MemberDevice {
        let address = format!("com.victronenergy.battery.tty{instance}");
        let mut device = MemberDevice::new(address, instance);
        device.custom_name = name.map(str::to_string);
        device
    }

    #[test]
    fn test_selector_matches_instance_or_name() {
        let starboard = device(278, Some("Starboard"));
        assert!(ShuntSelector::Instance(278).matches(&starboard));
        assert!(ShuntSelector::Name("Starboard".into()).matches(&starboard));
        assert!(!ShuntSelector::Instance(277).matches(&starboard));
        assert!(!ShuntSelector::Name("Port".into()).matches(&device(277, None)));
    }

    #[test]
    fn test_selector_deserializes_from_numbers_and_strings() {
        let selectors: Vec<ShuntSelector> = serde_json::from_str(r#"[278, "Starter"]"#).unwrap();
        assert_eq!(
            selectors,
            vec![
                ShuntSelector::Instance(278),
                ShuntSelector::Name("Starter".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_exclude_notifies_only_on_change() {
        let (surface, mut receiver) = ControlSurface::new(ControlSettings::default());
        receiver.borrow_and_update();

        surface.exclude(ShuntSelector::Instance(5));
        assert!(receiver.has_changed().unwrap());
        assert!(!receiver.borrow_and_update().is_enabled(&device(5, None)));

        surface.exclude(ShuntSelector::Instance(5));
        assert!(!receiver.has_changed().unwrap());

        surface.include(&ShuntSelector::Instance(5));
        assert!(receiver.has_changed().unwrap());
        assert!(receiver.borrow_and_update().is_enabled(&device(5, None)));

        surface.include(&ShuntSelector::Instance(5));
        assert!(!receiver.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_display_names_and_thresholds() {
        let (surface, receiver) = ControlSurface::new(ControlSettings::default());
        surface.set_display_name(7, "Forward bank");
        surface.set_thresholds(TemperatureThresholds {
            cold_danger: 2.0,
            hot_danger: 50.0,
        });
        let settings = receiver.borrow().clone();
        assert_eq!(settings.display_name(7), Some("Forward bank"));
        assert_eq!(settings.display_name(8), None);
        assert_eq!(settings.thresholds.cold_danger, 2.0);
        assert_eq!(surface.current(), settings);
    }
}
