/*
    set.rs - Observed-remove set CRDT over referenceable values

    Entries are keyed by the value's reference id and each carries the
    version map it was last written under. An add must be actor-next against
    the set's clock; a remove only applies when its clock dominates the
    stored entry's clock, so a concurrent add survives a concurrent remove
    (tie-break: add wins / favor existing).
*/

use super::errors::CrdtResult;
use super::traits::{CrdtChange, CrdtModel, MergeChanges, Referencable};
use super::version_map::{VersionMap, VersionOrdering};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A stored value together with the clock it was written under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue<T> {
    pub value: T,
    pub version_map: VersionMap,
}

/// Replicated state of an observed-remove set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetData<T> {
    /// The set's overall clock
    pub version_map: VersionMap,

    /// Live entries, keyed by reference id
    pub values: BTreeMap<String, VersionedValue<T>>,
}

impl<T> Default for SetData<T> {
    fn default() -> Self {
        SetData {
            version_map: VersionMap::new(),
            values: BTreeMap::new(),
        }
    }
}

/// Operations accepted by [`CrdtSet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetOperation<T> {
    /// Add a value; `versions` must be actor-next against the set's clock
    Add {
        actor: String,
        versions: VersionMap,
        added: T,
    },

    /// Remove the entry with the given reference id; `versions` must
    /// dominate the stored entry's clock
    Remove {
        actor: String,
        versions: VersionMap,
        removed: String,
    },
}

/// Observed-remove set CRDT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtSet<T> {
    data: SetData<T>,
}

impl<T: Referencable + Clone> CrdtSet<T> {
    /// Create a new empty set
    pub fn new() -> Self {
        CrdtSet {
            data: SetData::default(),
        }
    }

    /// Rehydrate a set from snapshot data
    pub fn from_data(data: SetData<T>) -> Self {
        CrdtSet { data }
    }

    /// Check membership by reference id
    pub fn contains(&self, id: &str) -> bool {
        self.data.values.contains_key(id)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.data.values.len()
    }

    /// True when the set holds no live entries
    pub fn is_empty(&self) -> bool {
        self.data.values.is_empty()
    }

    /// Convenience: build and apply an actor-next add of `value`
    pub fn add(&mut self, actor: &str, value: T) -> bool {
        let mut versions = self.data.version_map.clone();
        // set cannot fail: current + 1 is always forward
        let _ = versions.set(actor, self.data.version_map.get(actor) + 1);
        self.apply_operation(SetOperation::Add {
            actor: actor.to_string(),
            versions,
            added: value,
        })
    }

    /// Convenience: build and apply a remove of the entry with `id`,
    /// using everything this replica has observed as the removal clock
    pub fn remove(&mut self, actor: &str, id: &str) -> bool {
        self.apply_operation(SetOperation::Remove {
            actor: actor.to_string(),
            versions: self.data.version_map.clone(),
            removed: id.to_string(),
        })
    }

    fn apply_add(&mut self, actor: &str, versions: VersionMap, added: T) -> bool {
        if versions.get(actor) != self.data.version_map.get(actor) + 1 {
            return false;
        }

        let id = added.reference_id();
        match self.data.values.get_mut(&id) {
            Some(existing) => {
                // Concurrent adds of the same id: union the clocks
                existing.version_map.merge(&versions);
            }
            None => {
                self.data.values.insert(
                    id,
                    VersionedValue {
                        value: added,
                        version_map: versions.clone(),
                    },
                );
            }
        }
        self.data.version_map.merge(&versions);
        true
    }

    fn apply_remove(&mut self, versions: VersionMap, removed: &str) -> bool {
        let Some(entry) = self.data.values.get(removed) else {
            return false;
        };
        // Removal wins only when it has observed the stored entry; a
        // concurrent add keeps the entry alive.
        if !versions.dominates(&entry.version_map) {
            return false;
        }
        self.data.values.remove(removed);
        self.data.version_map.merge(&versions);
        true
    }
}

impl<T: Referencable + Clone> Default for CrdtSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared merge of two set-shaped data states, used by both the set and the
/// singleton CRDT. Entries present on both sides resolve by entry-clock
/// dominance; truly concurrent same-id entries keep the existing value under
/// the merged clock. A one-sided entry survives only when the other side's
/// global clock has not observed (dominated) it.
pub(crate) fn merge_set_data<T: Clone>(ours: &SetData<T>, theirs: &SetData<T>) -> SetData<T> {
    let merged_clock = ours.version_map.merged(&theirs.version_map);
    let mut merged_values: BTreeMap<String, VersionedValue<T>> = BTreeMap::new();

    let ids: std::collections::BTreeSet<&String> =
        ours.values.keys().chain(theirs.values.keys()).collect();

    for id in ids {
        match (ours.values.get(id), theirs.values.get(id)) {
            (Some(mine), Some(other)) => {
                let entry = match mine.version_map.compare(&other.version_map) {
                    VersionOrdering::Equal | VersionOrdering::GreaterThan => mine.clone(),
                    VersionOrdering::LessThan => other.clone(),
                    VersionOrdering::Concurrent => VersionedValue {
                        value: mine.value.clone(),
                        version_map: mine.version_map.merged(&other.version_map),
                    },
                };
                merged_values.insert(id.clone(), entry);
            }
            (Some(mine), None) => {
                if !theirs.version_map.dominates(&mine.version_map) {
                    merged_values.insert(id.clone(), mine.clone());
                }
            }
            (None, Some(other)) => {
                if !ours.version_map.dominates(&other.version_map) {
                    merged_values.insert(id.clone(), other.clone());
                }
            }
            (None, None) => unreachable!(),
        }
    }

    SetData {
        version_map: merged_clock,
        values: merged_values,
    }
}

impl<T: Referencable + Clone> CrdtModel for CrdtSet<T> {
    type Data = SetData<T>;
    type Operation = SetOperation<T>;
    type View = Vec<T>;

    fn apply_operation(&mut self, op: Self::Operation) -> bool {
        match op {
            SetOperation::Add {
                actor,
                versions,
                added,
            } => self.apply_add(&actor, versions, added),
            SetOperation::Remove {
                versions, removed, ..
            } => self.apply_remove(versions, &removed),
        }
    }

    fn merge(&mut self, other: Self::Data) -> CrdtResult<MergeChanges<SetData<T>, SetOperation<T>>> {
        self.data = merge_set_data(&self.data, &other);
        Ok(MergeChanges {
            model_change: CrdtChange::Data(self.data.clone()),
            other_change: CrdtChange::Data(self.data.clone()),
        })
    }

    fn data(&self) -> SetData<T> {
        self.data.clone()
    }

    fn consumer_view(&self) -> Vec<T> {
        self.data.values.values().map(|v| v.value.clone()).collect()
    }

    fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_contains() {
        let mut set: CrdtSet<String> = CrdtSet::new();
        assert!(set.add("alice", "x".to_string()));
        assert!(set.contains("x"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_add_rejects_stale_version() {
        let mut set: CrdtSet<String> = CrdtSet::new();
        assert!(set.add("alice", "x".to_string()));

        // Replay the same clock
        let op = SetOperation::Add {
            actor: "alice".to_string(),
            versions: VersionMap::of("alice", 1),
            added: "y".to_string(),
        };
        assert!(!set.apply_operation(op));
        assert!(!set.contains("y"));
    }

    #[test]
    fn test_remove_after_add() {
        let mut set: CrdtSet<String> = CrdtSet::new();
        set.add("alice", "x".to_string());
        assert!(set.remove("alice", "x"));
        assert!(!set.contains("x"));
    }

    #[test]
    fn test_remove_of_unknown_id_rejected() {
        let mut set: CrdtSet<String> = CrdtSet::new();
        assert!(!set.remove("alice", "ghost"));
    }

    #[test]
    fn test_concurrent_add_survives_remove() {
        // bob removes "x" knowing only alice's first version, while alice
        // has concurrently re-added it at a newer version
        let mut set: CrdtSet<String> = CrdtSet::new();
        set.add("alice", "x".to_string());
        let observed = set.version_map().clone();

        set.remove("alice", "x");
        set.add("alice", "x".to_string());

        let stale_remove = SetOperation::Remove {
            actor: "bob".to_string(),
            versions: observed,
            removed: "x".to_string(),
        };
        assert!(!set.apply_operation(stale_remove));
        assert!(set.contains("x"));
    }

    #[test]
    fn test_merge_unions_independent_adds() {
        let mut a: CrdtSet<String> = CrdtSet::new();
        a.add("alice", "x".to_string());
        let mut b: CrdtSet<String> = CrdtSet::new();
        b.add("bob", "y".to_string());

        a.merge(b.data()).unwrap();
        assert!(a.contains("x"));
        assert!(a.contains("y"));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_merge_propagates_observed_remove() {
        let mut a: CrdtSet<String> = CrdtSet::new();
        a.add("alice", "x".to_string());

        // b saw the add, then removed it
        let mut b = CrdtSet::from_data(a.data());
        b.remove("bob", "x");

        a.merge(b.data()).unwrap();
        assert!(!a.contains("x"));
    }

    #[test]
    fn test_merge_keeps_unobserved_entry() {
        // a's add is concurrent with everything b has seen, so it survives
        let mut a: CrdtSet<String> = CrdtSet::new();
        a.add("alice", "x".to_string());
        let b: CrdtSet<String> = CrdtSet::new();

        a.merge(b.data()).unwrap();
        assert!(a.contains("x"));
    }

    #[test]
    fn test_merge_mutual_convergence() {
        let mut a: CrdtSet<String> = CrdtSet::new();
        a.add("alice", "x".to_string());
        a.add("alice", "y".to_string());
        let mut b: CrdtSet<String> = CrdtSet::new();
        b.add("bob", "z".to_string());

        let a_data = a.data();
        let b_data = b.data();
        a.merge(b_data).unwrap();
        b.merge(a_data).unwrap();

        assert_eq!(a.data(), b.data());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn build_set(actor: &str, elements: &[u8]) -> CrdtSet<String> {
        let mut set = CrdtSet::new();
        for e in elements {
            set.add(actor, format!("e{}", e));
        }
        set
    }

    // Property: merge is commutative over membership
    proptest! {
        #[test]
        fn prop_merge_commutative(
            xs in prop::collection::vec(0u8..50, 0..10),
            ys in prop::collection::vec(0u8..50, 0..10),
        ) {
            let mut ab = build_set("a", &xs);
            let mut ba = build_set("b", &ys);
            let a_data = ab.data();
            let b_data = ba.data();

            ab.merge(b_data).unwrap();
            ba.merge(a_data).unwrap();

            prop_assert_eq!(ab.data(), ba.data());
        }
    }

    // Property: merge is idempotent
    proptest! {
        #[test]
        fn prop_merge_idempotent(xs in prop::collection::vec(0u8..50, 0..10)) {
            let mut set = build_set("a", &xs);
            let before = set.data();
            set.merge(before.clone()).unwrap();
            prop_assert_eq!(set.data(), before);
        }
    }

    // Property: merge is associative over membership
    proptest! {
        #[test]
        fn prop_merge_associative(
            xs in prop::collection::vec(0u8..30, 0..6),
            ys in prop::collection::vec(0u8..30, 0..6),
            zs in prop::collection::vec(0u8..30, 0..6),
        ) {
            let a = build_set("a", &xs);
            let b = build_set("b", &ys);
            let c = build_set("c", &zs);

            let mut left = CrdtSet::from_data(a.data());
            left.merge(b.data()).unwrap();
            left.merge(c.data()).unwrap();

            let mut bc = CrdtSet::from_data(b.data());
            bc.merge(c.data()).unwrap();
            let mut right = CrdtSet::from_data(a.data());
            right.merge(bc.data()).unwrap();

            prop_assert_eq!(left.data(), right.data());
        }
    }
}
