use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Severity of a published status condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub level: StatusLevel,
    pub message: String,
}

impl StatusReport {
    pub fn new(level: StatusLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Single-writer status slots keyed by producer name.
///
/// Each producer (e.g. the wallet monitor under `"wallet"`) owns its slot
/// and replaces it wholesale; readers get a snapshot.
#[derive(Default)]
pub struct StatusRegistry {
    slots: RwLock<HashMap<String, StatusReport>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, report: StatusReport) {
        self.slots
            .write()
            .expect("status registry lock poisoned")
            .insert(key.to_owned(), report);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<StatusReport> {
        self.slots
            .read()
            .expect("status registry lock poisoned")
            .get(key)
            .cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, StatusReport> {
        self.slots
            .read()
            .expect("status registry lock poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_replaced_wholesale() {
        let registry = StatusRegistry::new();

        registry.set(
            "wallet",
            StatusReport::new(StatusLevel::Error, "Cannot connect to network"),
        );
        registry.set("wallet", StatusReport::new(StatusLevel::Info, ""));

        let report = registry.get("wallet").unwrap();
        assert_eq!(report.level, StatusLevel::Info);
        assert_eq!(report.message, "");
        assert_eq!(registry.snapshot().len(), 1);
    }
}
