//! Deduplicated collection of discovered peripherals.

use crate::domain::models::PeripheralRef;
use std::collections::HashSet;

/// Peripherals in first-seen order, at most one entry per id
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    entries: Vec<PeripheralRef>,
    ids: HashSet<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peripheral unless its id is already known.
    ///
    /// Returns `true` if the entry was added. A repeated id is discarded
    /// without touching the stored entry.
    pub fn insert(&mut self, peripheral: PeripheralRef) -> bool {
        if !self.ids.insert(peripheral.id.clone()) {
            return false;
        }
        self.entries.push(peripheral);
        true
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralRef> {
        self.entries.iter().find(|p| p.id == id)
    }

    pub fn entries(&self) -> &[PeripheralRef] {
        &self.entries
    }

    /// Owned copy for publishing to callers
    pub fn snapshot(&self) -> Vec<PeripheralRef> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }
}
