/*
    singleton.rs - Single-value CRDT over the observed-remove set model

    A singleton is a set constrained to at most one live entry: an Update is
    an atomic clear-of-dominated-entries plus add against the clock. When
    concurrent updates leave more than one live entry, the consumer view
    deterministically returns the entry with the smallest reference id.
*/

use super::errors::CrdtResult;
use super::set::{merge_set_data, SetData, VersionedValue};
use super::traits::{CrdtChange, CrdtModel, MergeChanges, Referencable};
use super::version_map::VersionMap;
use serde::{Deserialize, Serialize};

/// Singleton state shares the set's representation
pub type SingletonData<T> = SetData<T>;

/// Operations accepted by [`CrdtSingleton`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SingletonOperation<T> {
    /// Replace the current value; clears every entry the op has observed
    /// and installs the new one in a single version step
    Update {
        actor: String,
        versions: VersionMap,
        value: T,
    },

    /// Clear every entry the op has observed
    Clear { actor: String, versions: VersionMap },
}

/// Single-value CRDT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtSingleton<T> {
    data: SingletonData<T>,
}

impl<T: Referencable + Clone> CrdtSingleton<T> {
    /// Create a new empty singleton
    pub fn new() -> Self {
        CrdtSingleton {
            data: SingletonData::default(),
        }
    }

    /// Rehydrate a singleton from snapshot data
    pub fn from_data(data: SingletonData<T>) -> Self {
        CrdtSingleton { data }
    }

    /// Convenience: build and apply an actor-next update
    pub fn update(&mut self, actor: &str, value: T) -> bool {
        let mut versions = self.data.version_map.clone();
        let _ = versions.set(actor, self.data.version_map.get(actor) + 1);
        self.apply_operation(SingletonOperation::Update {
            actor: actor.to_string(),
            versions,
            value,
        })
    }

    /// Convenience: build and apply a clear of everything observed so far
    pub fn clear(&mut self, actor: &str) -> bool {
        self.apply_operation(SingletonOperation::Clear {
            actor: actor.to_string(),
            versions: self.data.version_map.clone(),
        })
    }

    /// True when no live value is present
    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    fn clear_dominated(&mut self, versions: &VersionMap) {
        self.data
            .values
            .retain(|_, entry| !versions.dominates(&entry.version_map));
    }
}

impl<T: Referencable + Clone> Default for CrdtSingleton<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Referencable + Clone> CrdtModel for CrdtSingleton<T> {
    type Data = SingletonData<T>;
    type Operation = SingletonOperation<T>;
    type View = Option<T>;

    fn apply_operation(&mut self, op: Self::Operation) -> bool {
        match op {
            SingletonOperation::Update {
                actor,
                versions,
                value,
            } => {
                if versions.get(&actor) != self.data.version_map.get(&actor) + 1 {
                    return false;
                }
                self.clear_dominated(&versions);
                self.data.values.insert(
                    value.reference_id(),
                    VersionedValue {
                        value,
                        version_map: versions.clone(),
                    },
                );
                self.data.version_map.merge(&versions);
                true
            }
            SingletonOperation::Clear { versions, .. } => {
                self.clear_dominated(&versions);
                self.data.version_map.merge(&versions);
                true
            }
        }
    }

    fn merge(
        &mut self,
        other: Self::Data,
    ) -> CrdtResult<MergeChanges<SingletonData<T>, SingletonOperation<T>>> {
        self.data = merge_set_data(&self.data, &other);
        Ok(MergeChanges {
            model_change: CrdtChange::Data(self.data.clone()),
            other_change: CrdtChange::Data(self.data.clone()),
        })
    }

    fn data(&self) -> SingletonData<T> {
        self.data.clone()
    }

    /// The live value, or the smallest-id entry when concurrency has left
    /// more than one alive
    fn consumer_view(&self) -> Option<T> {
        self.data
            .values
            .values()
            .next()
            .map(|entry| entry.value.clone())
    }

    fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_singleton() {
        let s: CrdtSingleton<String> = CrdtSingleton::new();
        assert!(s.is_empty());
        assert_eq!(s.consumer_view(), None);
    }

    #[test]
    fn test_update_replaces_value() {
        let mut s: CrdtSingleton<String> = CrdtSingleton::new();
        assert!(s.update("alice", "first".to_string()));
        assert!(s.update("alice", "second".to_string()));

        assert_eq!(s.consumer_view(), Some("second".to_string()));
        assert_eq!(s.data().values.len(), 1);
    }

    #[test]
    fn test_update_rejects_stale_version() {
        let mut s: CrdtSingleton<String> = CrdtSingleton::new();
        s.update("alice", "first".to_string());

        let stale = SingletonOperation::Update {
            actor: "alice".to_string(),
            versions: VersionMap::of("alice", 1),
            value: "late".to_string(),
        };
        assert!(!s.apply_operation(stale));
        assert_eq!(s.consumer_view(), Some("first".to_string()));
    }

    #[test]
    fn test_clear() {
        let mut s: CrdtSingleton<String> = CrdtSingleton::new();
        s.update("alice", "value".to_string());
        assert!(s.clear("alice"));
        assert!(s.is_empty());
    }

    #[test]
    fn test_clear_does_not_affect_unobserved() {
        let mut s: CrdtSingleton<String> = CrdtSingleton::new();
        s.update("alice", "v1".to_string());
        let observed = s.version_map().clone();
        s.update("alice", "v2".to_string());

        // Clear built before v2 was observed leaves v2 alone
        let op = SingletonOperation::Clear {
            actor: "bob".to_string(),
            versions: observed,
        };
        assert!(s.apply_operation(op));
        assert_eq!(s.consumer_view(), Some("v2".to_string()));
    }

    #[test]
    fn test_concurrent_updates_resolve_deterministically() {
        let mut a: CrdtSingleton<String> = CrdtSingleton::new();
        let mut b = CrdtSingleton::from_data(a.data());

        a.update("alice", "banana".to_string());
        b.update("bob", "apple".to_string());

        let a_data = a.data();
        let b_data = b.data();
        a.merge(b_data).unwrap();
        b.merge(a_data).unwrap();

        // Both entries survive the merge; the view picks the smallest id
        assert_eq!(a.data(), b.data());
        assert_eq!(a.consumer_view(), Some("apple".to_string()));
        assert_eq!(b.consumer_view(), Some("apple".to_string()));
    }

    #[test]
    fn test_merge_propagates_update() {
        let mut a: CrdtSingleton<String> = CrdtSingleton::new();
        a.update("alice", "v1".to_string());

        let mut b = CrdtSingleton::from_data(a.data());
        b.update("bob", "v2".to_string());

        a.merge(b.data()).unwrap();
        assert_eq!(a.consumer_view(), Some("v2".to_string()));
        assert_eq!(a.data().values.len(), 1);
    }
}
