//! Tracks backups that are currently being created
//!
//! The backup-creation flow adds an entry before it starts writing a backup
//! and removes it when done. The deletion controller only asks whether a
//! backup is active, so a request never races a backup still in flight.

use dashmap::DashSet;

#[cfg(test)]
use mockall::automock;

/// Set of `(namespace, name)` backups currently in progress
#[cfg_attr(test, automock)]
pub trait BackupTracker: Send + Sync {
    /// Mark a backup as in progress
    fn add(&self, namespace: &str, name: &str);

    /// Clear the in-progress mark for a backup
    fn delete(&self, namespace: &str, name: &str);

    /// Whether the backup is currently in progress
    fn contains(&self, namespace: &str, name: &str) -> bool;
}

/// Process-local tracker backed by a concurrent set
#[derive(Debug, Default)]
pub struct InMemoryBackupTracker {
    backups: DashSet<(String, String)>,
}

impl InMemoryBackupTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupTracker for InMemoryBackupTracker {
    fn add(&self, namespace: &str, name: &str) {
        self.backups.insert((namespace.to_string(), name.to_string()));
    }

    fn delete(&self, namespace: &str, name: &str) {
        self.backups.remove(&(namespace.to_string(), name.to_string()));
    }

    fn contains(&self, namespace: &str, name: &str) -> bool {
        self.backups
            .contains(&(namespace.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_contains_delete() {
        let tracker = InMemoryBackupTracker::new();
        assert!(!tracker.contains("velero", "foo"));

        tracker.add("velero", "foo");
        assert!(tracker.contains("velero", "foo"));
        assert!(!tracker.contains("other", "foo"));

        tracker.delete("velero", "foo");
        assert!(!tracker.contains("velero", "foo"));
    }

    #[test]
    fn delete_of_unknown_entry_is_noop() {
        let tracker = InMemoryBackupTracker::new();
        tracker.delete("velero", "missing");
        assert!(!tracker.contains("velero", "missing"));
    }

    #[test]
    fn concurrent_adds_are_all_visible() {
        let tracker = Arc::new(InMemoryBackupTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || tracker.add("velero", &format!("backup-{}", i)))
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        for i in 0..8 {
            assert!(tracker.contains("velero", &format!("backup-{}", i)));
        }
    }
}
