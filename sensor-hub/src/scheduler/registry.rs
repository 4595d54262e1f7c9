//! Device registry owned by the coordinator.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::domain::{DeviceIdentity, DeviceRecord, ScheduleConfig};

/// Outcome of registering a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Known name; address refreshed, everything else kept.
    Refreshed,
}

/// All currently known devices, keyed by name.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, or refresh the address of a known one.
    ///
    /// A name is never present twice; `config` is ignored on refresh.
    pub fn register(&mut self, identity: DeviceIdentity, config: ScheduleConfig) -> Registration {
        match self.devices.entry(identity.name.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().identity.address = identity.address;
                Registration::Refreshed
            }
            Entry::Vacant(entry) => {
                entry.insert(DeviceRecord::new(identity, config));
                Registration::Added
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<DeviceRecord> {
        self.devices.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.values_mut()
    }

    /// Names in sorted order, for deterministic bulk operations.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn any_scheduled(&self) -> bool {
        self.devices.values().any(|record| record.runtime.is_scheduled)
    }
}
