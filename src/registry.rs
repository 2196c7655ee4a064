//! The set of admitted member shunts and the control settings applied to them.

use crate::bus::BusValue;
use crate::control::ControlSettings;
use crate::member::MemberDevice;
use std::collections::BTreeMap;

/// Admitted member shunts keyed by bus address.
///
/// The registry is the only owner of [`MemberDevice`] records. It is mutated
/// exclusively from the engine's serialized sequence, so every operation here
/// is synchronous and atomic with respect to recomputation.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, MemberDevice>,
}

/// What [`DeviceRegistry::apply_control`] changed.
#[derive(Debug, Default, PartialEq)]
pub struct ControlChanges {
    pub excluded: Vec<String>,
    pub included: Vec<String>,
    pub renamed: Vec<String>,
}

impl ControlChanges {
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty() && self.included.is_empty() && self.renamed.is_empty()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Registers a probed device, applying the control settings right away so
    /// an excluded shunt never contributes, not even for one recomputation.
    /// Returns false if the address was already registered.
    pub fn admit(&mut self, mut device: MemberDevice, control: &ControlSettings) -> bool {
        if self.devices.contains_key(&device.address) {
            return false;
        }
        device.enabled = control.is_enabled(&device);
        device.alias = control.display_name(device.instance).map(str::to_string);
        self.devices.insert(device.address.clone(), device);
        true
    }

    /// Applies one property change. Returns true when a monitored property of
    /// a known member was updated.
    pub fn on_change(&mut self, address: &str, path: &str, value: &BusValue) -> bool {
        match self.devices.get_mut(address) {
            Some(device) => device.apply(path, value),
            None => false,
        }
    }

    pub fn evict(&mut self, address: &str) -> Option<MemberDevice> {
        self.devices.remove(address)
    }

    /// Re-evaluates enabled flags and aliases against new control settings.
    pub fn apply_control(&mut self, control: &ControlSettings) -> ControlChanges {
        let mut changes = ControlChanges::default();
        for device in self.devices.values_mut() {
            let enabled = control.is_enabled(device);
            if enabled != device.enabled {
                device.enabled = enabled;
                if enabled {
                    changes.included.push(device.address.clone());
                } else {
                    changes.excluded.push(device.address.clone());
                }
            }
            let alias = control.display_name(device.instance).map(str::to_string);
            if alias != device.alias {
                device.alias = alias;
                changes.renamed.push(device.address.clone());
            }
        }
        changes
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberDevice> {
        self.devices.values()
    }

    pub fn get(&self, address: &str) -> Option<&MemberDevice> {
        self.devices.get(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.devices.values().filter(|d| d.enabled).count()
    }
}
