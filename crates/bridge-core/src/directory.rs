//! Instance directory: which miniapp instances are running, and of what.
//!
//! Transport sessions address a logical id (a miniapp definition) and need
//! the concrete instance currently running it. [`InstanceDirectory`] is the
//! seam; [`InstanceTable`] is the implementation the host context keeps
//! current on attach and detach.

use std::sync::{Arc, Mutex};

/// One running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveInstance {
    /// The miniapp definition this instance runs.
    pub logical_id: String,
    /// The concrete instance.
    pub instance_id: String,
}

/// Source of the logical id → instance id mapping.
pub trait InstanceDirectory: Send + Sync {
    /// Every active instance, oldest first.
    fn active_instances(&self) -> Vec<ActiveInstance>;

    /// The most recently started instance of `logical_id`.
    fn resolve(&self, logical_id: &str) -> Option<String> {
        self.active_instances()
            .into_iter()
            .rev()
            .find(|i| i.logical_id == logical_id)
            .map(|i| i.instance_id)
    }
}

/// In-memory [`InstanceDirectory`].
#[derive(Debug, Clone, Default)]
pub struct InstanceTable {
    instances: Arc<Mutex<Vec<ActiveInstance>>>,
}

impl InstanceTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, Vec<ActiveInstance>> {
        self.instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a started instance. Re-adding an id moves it to the end.
    pub fn add(&self, logical_id: impl Into<String>, instance_id: impl Into<String>) {
        let entry = ActiveInstance {
            logical_id: logical_id.into(),
            instance_id: instance_id.into(),
        };
        let mut instances = self.instances();
        instances.retain(|i| i.instance_id != entry.instance_id);
        instances.push(entry);
    }

    /// Forget an instance. Returns its entry if it was present.
    pub fn remove(&self, instance_id: &str) -> Option<ActiveInstance> {
        let mut instances = self.instances();
        let pos = instances.iter().position(|i| i.instance_id == instance_id)?;
        Some(instances.remove(pos))
    }

    /// Logical id of a running instance.
    pub fn logical_id_of(&self, instance_id: &str) -> Option<String> {
        self.instances()
            .iter()
            .find(|i| i.instance_id == instance_id)
            .map(|i| i.logical_id.clone())
    }
}

impl InstanceDirectory for InstanceTable {
    fn active_instances(&self) -> Vec<ActiveInstance> {
        self.instances().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_picks_latest_instance() {
        let table = InstanceTable::new();
        table.add("notes", "n-1");
        table.add("calc", "c-1");
        table.add("notes", "n-2");
        assert_eq!(table.resolve("notes").as_deref(), Some("n-2"));
        assert_eq!(table.resolve("calc").as_deref(), Some("c-1"));
        assert_eq!(table.resolve("weather"), None);
    }

    #[test]
    fn remove_falls_back_to_older_instance() {
        let table = InstanceTable::new();
        table.add("notes", "n-1");
        table.add("notes", "n-2");
        assert_eq!(table.remove("n-2").map(|i| i.logical_id), Some("notes".into()));
        assert_eq!(table.resolve("notes").as_deref(), Some("n-1"));
        assert!(table.remove("n-2").is_none());
    }

    #[test]
    fn logical_id_lookup() {
        let table = InstanceTable::new();
        table.add("calc", "c-1");
        assert_eq!(table.logical_id_of("c-1").as_deref(), Some("calc"));
        assert_eq!(table.logical_id_of("c-2"), None);
        assert_eq!(table.active_instances().len(), 1);
    }
}
