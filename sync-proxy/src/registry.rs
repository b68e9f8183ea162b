//! In-memory target registry.
//!
//! Entries are created once per target ID and live for the rest of the
//! process. The map lock only covers insertion and lookup; each target guards
//! its own fields.

use crate::target::SyncTarget;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use syncproxy_types::TargetId;

/// Thread-safe map from target ID to live target.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: DashMap<TargetId, Arc<SyncTarget>>,
}

impl TargetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `id`, installing `candidate` if there is none.
    ///
    /// The flag is true when `candidate` was installed; otherwise it is
    /// dropped and the existing entry returned.
    pub fn get_or_create(
        &self,
        id: TargetId,
        candidate: Arc<SyncTarget>,
    ) -> (Arc<SyncTarget>, bool) {
        match self.targets.entry(id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(candidate.clone());
                (candidate, true)
            }
        }
    }

    /// Look up a target.
    pub fn get(&self, id: &TargetId) -> Option<Arc<SyncTarget>> {
        self.targets.get(id).map(|entry| entry.value().clone())
    }

    /// Number of known targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets are known.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Number of targets marked active.
    pub fn active_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// All targets, in no particular order.
    pub fn all(&self) -> Vec<Arc<SyncTarget>> {
        self.targets
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestProxy;

    #[tokio::test]
    async fn second_candidate_is_discarded() {
        let proxy = TestProxy::new().await;
        let registry = TargetRegistry::new();

        let first = proxy.detached_target("T1");
        let (entry, created) = registry.get_or_create("T1".into(), first.clone());
        assert!(created);
        assert!(Arc::ptr_eq(&entry, &first));

        let second = proxy.detached_target("T1");
        let (entry, created) = registry.get_or_create("T1".into(), second.clone());
        assert!(!created);
        assert!(Arc::ptr_eq(&entry, &first));
        assert!(!Arc::ptr_eq(&entry, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_installs_exactly_one() {
        let proxy = TestProxy::new().await;
        let registry = Arc::new(TargetRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let candidate = proxy.detached_target("T1");
                std::thread::spawn(move || registry.get_or_create("T1".into(), candidate))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let winner = &results[0].0;
        assert!(results.iter().all(|(t, _)| Arc::ptr_eq(t, winner)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn lookup_and_counts() {
        let proxy = TestProxy::new().await;
        let registry = TargetRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(&"T1".into()).is_none());

        registry.get_or_create("T1".into(), proxy.detached_target("T1"));
        registry.get_or_create("T2".into(), proxy.detached_target("T2"));

        assert!(registry.get(&"T1".into()).is_some());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all().len(), 2);
        assert_eq!(registry.active_count(), 0);
    }
}
