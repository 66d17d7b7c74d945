//! Device descriptors and the in-memory registry they are read from.
//!
//! The registry is seeded from configuration and swapped wholesale on reload, so
//! readers (health passes, command dispatch) always see one consistent device list.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolKind;

/// Identity and address of one controllable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device identifier.
    pub id: String,

    /// Transport address understood by the adapter (e.g. "10.0.0.20:5000").
    pub address: String,

    /// Protocol family used to reach the device.
    pub protocol: ProtocolKind,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, address: impl Into<String>, protocol: impl Into<ProtocolKind>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            protocol: protocol.into(),
        }
    }
}

/// Result of replacing the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Lock-free, swap-on-write device table.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: ArcSwap<BTreeMap<String, DeviceDescriptor>>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        Self {
            devices: ArcSwap::from_pointee(index(devices)),
        }
    }

    pub fn get(&self, id: &str) -> Option<DeviceDescriptor> {
        self.devices.load().get(id).cloned()
    }

    /// All devices, ordered by id.
    pub fn all(&self) -> Vec<DeviceDescriptor> {
        self.devices.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.load().is_empty()
    }

    /// Atomically replace the device list.
    pub fn replace(&self, devices: impl IntoIterator<Item = DeviceDescriptor>) -> RegistryChange {
        let next = Arc::new(index(devices));
        let previous = self.devices.swap(next.clone());

        let mut change = RegistryChange::default();
        for (id, descriptor) in next.iter() {
            match previous.get(id) {
                None => change.added.push(id.clone()),
                Some(old) if old != descriptor => change.changed.push(id.clone()),
                Some(_) => {}
            }
        }
        change.removed = previous
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();

        change
    }
}

fn index(devices: impl IntoIterator<Item = DeviceDescriptor>) -> BTreeMap<String, DeviceDescriptor> {
    devices.into_iter().map(|d| (d.id.clone(), d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_reports_changes() {
        let registry = DeviceRegistry::new(vec![
            DeviceDescriptor::new("matrix-1", "10.0.0.20:5000", ProtocolKind::MATRIX_LINE),
            DeviceDescriptor::new("ir-1", "10.0.0.30:4998", ProtocolKind::IR_BLASTER),
        ]);
        assert_eq!(registry.len(), 2);

        let change = registry.replace(vec![
            DeviceDescriptor::new("matrix-1", "10.0.0.21:5000", ProtocolKind::MATRIX_LINE),
            DeviceDescriptor::new("dsp-1", "10.0.0.40:1710", ProtocolKind::DSP_JSONRPC),
        ]);

        assert_eq!(change.added, vec!["dsp-1".to_string()]);
        assert_eq!(change.removed, vec!["ir-1".to_string()]);
        assert_eq!(change.changed, vec!["matrix-1".to_string()]);
        assert_eq!(registry.get("matrix-1").unwrap().address, "10.0.0.21:5000");
        assert!(registry.get("ir-1").is_none());
    }
}
