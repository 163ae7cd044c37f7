//! Camera registry: the one owner of alias, mode and state per camera

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::capture::backend::NegotiatedMode;

pub type CameraId = Arc<str>;

/// Lifecycle of one camera slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Uninitialized,
    /// Preview only
    Streaming,
    Recording,
    Error,
    Reinitializing,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Uninitialized => "uninitialized",
            SlotState::Streaming => "streaming",
            SlotState::Recording => "recording",
            SlotState::Error => "error",
            SlotState::Reinitializing => "reinitializing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CameraEntry {
    pub alias: CameraId,
    pub driver: String,
    pub mode: Option<NegotiatedMode>,
    pub state: SlotState,
    pub last_error: Option<String>,
}

impl CameraEntry {
    pub fn new(alias: CameraId) -> Self {
        Self {
            alias,
            driver: String::new(),
            mode: None,
            state: SlotState::Uninitialized,
            last_error: None,
        }
    }
}

/// Cheap to clone handle; readers never block writers.
#[derive(Clone)]
pub struct CameraRegistry {
    entries: Arc<ArcSwap<BTreeMap<CameraId, CameraEntry>>>,
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self {
            entries: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
        }
    }
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` to the entry for `alias`, creating it first if needed.
    pub fn update(&self, alias: &CameraId, f: impl Fn(&mut CameraEntry)) {
        self.entries.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            let entry = next
                .entry(alias.clone())
                .or_insert_with(|| CameraEntry::new(alias.clone()));
            f(entry);
            next
        });
    }

    pub fn set_state(&self, alias: &CameraId, state: SlotState) {
        self.update(alias, |entry| {
            entry.state = state;
            if state != SlotState::Error {
                entry.last_error = None;
            }
        });
    }

    pub fn set_error(&self, alias: &CameraId, reason: &str) {
        self.update(alias, |entry| {
            entry.state = SlotState::Error;
            entry.last_error = Some(reason.to_string());
        });
    }

    pub fn get(&self, alias: &str) -> Option<CameraEntry> {
        self.entries.load().get(alias).cloned()
    }

    pub fn state(&self, alias: &str) -> Option<SlotState> {
        self.entries.load().get(alias).map(|e| e.state)
    }

    pub fn entries(&self) -> Vec<CameraEntry> {
        self.entries.load().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_creates_and_mutates_entries() {
        let registry = CameraRegistry::new();
        let alias: CameraId = Arc::from("cam0");
        assert!(registry.get("cam0").is_none());

        registry.set_state(&alias, SlotState::Streaming);
        assert_eq!(registry.state("cam0"), Some(SlotState::Streaming));

        registry.set_error(&alias, "device lost");
        let entry = registry.get("cam0").unwrap();
        assert_eq!(entry.state, SlotState::Error);
        assert_eq!(entry.last_error.as_deref(), Some("device lost"));

        registry.set_state(&alias, SlotState::Reinitializing);
        assert!(registry.get("cam0").unwrap().last_error.is_none());
    }

    #[test]
    fn clones_share_state() {
        let registry = CameraRegistry::new();
        let view = registry.clone();
        registry.set_state(&Arc::from("a"), SlotState::Recording);
        assert_eq!(view.entries().len(), 1);
    }
}
