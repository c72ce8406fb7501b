//! Port directory for sibling emulators.

use std::collections::HashMap;

use dashmap::DashMap;

/// Where the gateway finds sibling emulators (firestore, ...). The real
/// directory lives in the CLI shell; the gateway only reads it.
pub trait EmulatorRegistry: Send + Sync {
    fn lookup(&self, emulator: &str) -> Option<(String, u16)>;

    /// Port map handed to workers inside the runtime bundle.
    fn ports(&self) -> HashMap<String, u16>;
}

#[derive(Debug, Default)]
pub struct StaticRegistry {
    entries: DashMap<String, (String, u16)>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, emulator: impl Into<String>, host: impl Into<String>, port: u16) {
        self.entries.insert(emulator.into(), (host.into(), port));
    }
}

impl EmulatorRegistry for StaticRegistry {
    fn lookup(&self, emulator: &str) -> Option<(String, u16)> {
        self.entries.get(emulator).map(|entry| entry.value().clone())
    }

    fn ports(&self) -> HashMap<String, u16> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().1))
            .collect()
    }
}
