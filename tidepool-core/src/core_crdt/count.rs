/*
    count.rs - Grow-only distributed counter CRDT

    Each actor contributes a non-negative increment total; the consumer view
    is the sum over all actors. Operations carry a (from, to) version pair
    and are applicable only when `from` matches the actor's current version,
    so replays and reordered deliveries are silently rejected.

    Merge reconciles both sides to the per-actor maximum and expresses the
    reconciliation as MultiIncrement operations for each side, so a merge
    can be transported or audited as ordinary operations.
*/

use super::errors::{CrdtError, CrdtResult};
use super::traits::{CrdtChange, CrdtModel, MergeChanges};
use super::version_map::VersionMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replicated state of a counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountData {
    /// Per-actor contribution (never decreases)
    pub values: BTreeMap<String, u64>,

    /// Per-actor operation clock
    pub version_map: VersionMap,
}

/// Operations accepted by [`CrdtCount`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountOperation {
    /// Add 1 to an actor's contribution
    Increment { actor: String, from: u64, to: u64 },

    /// Add an arbitrary amount in a single version step
    MultiIncrement {
        actor: String,
        value: u64,
        from: u64,
        to: u64,
    },
}

/// Grow-only counter CRDT
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtCount {
    data: CountData,
}

impl CrdtCount {
    /// Create a new empty counter
    pub fn new() -> Self {
        CrdtCount {
            data: CountData::default(),
        }
    }

    /// Rehydrate a counter from snapshot data
    pub fn from_data(data: CountData) -> Self {
        CrdtCount { data }
    }

    /// An actor's individual contribution
    pub fn value_for_actor(&self, actor: &str) -> u64 {
        self.data.values.get(actor).copied().unwrap_or(0)
    }

    /// Convenience: build and apply a single increment for `actor`
    pub fn increment(&mut self, actor: &str) -> bool {
        let from = self.data.version_map.get(actor);
        self.apply_operation(CountOperation::Increment {
            actor: actor.to_string(),
            from,
            to: from + 1,
        })
    }

    /// Convenience: build and apply a multi-increment for `actor`
    pub fn increment_by(&mut self, actor: &str, amount: u64) -> bool {
        let from = self.data.version_map.get(actor);
        self.apply_operation(CountOperation::MultiIncrement {
            actor: actor.to_string(),
            value: amount,
            from,
            to: from + 1,
        })
    }
}

impl CrdtModel for CrdtCount {
    type Data = CountData;
    type Operation = CountOperation;
    type View = u64;

    fn apply_operation(&mut self, op: Self::Operation) -> bool {
        let (actor, amount, from, to) = match op {
            CountOperation::Increment { actor, from, to } => (actor, 1, from, to),
            CountOperation::MultiIncrement {
                actor,
                value,
                from,
                to,
            } => (actor, value, from, to),
        };

        // Each op must advance the actor's clock by exactly one step.
        if to != from + 1 || from != self.data.version_map.get(&actor) {
            return false;
        }

        *self.data.values.entry(actor.clone()).or_insert(0) += amount;
        // set cannot fail here: to = current + 1
        let _ = self.data.version_map.set(&actor, to);
        true
    }

    fn merge(&mut self, other: Self::Data) -> CrdtResult<MergeChanges<CountData, CountOperation>> {
        let mut model_ops = Vec::new();
        let mut other_ops = Vec::new();

        let actors: std::collections::BTreeSet<String> = self
            .data
            .version_map
            .actors()
            .chain(other.version_map.actors())
            .cloned()
            .collect();

        for actor in actors {
            let self_value = self.data.values.get(&actor).copied().unwrap_or(0);
            let other_value = other.values.get(&actor).copied().unwrap_or(0);
            let self_version = self.data.version_map.get(&actor);
            let other_version = other.version_map.get(&actor);

            match self_version.cmp(&other_version) {
                std::cmp::Ordering::Less => {
                    if other_value < self_value {
                        return Err(CrdtError::ApparentDecrement {
                            actor,
                            from: self_value,
                            to: other_value,
                        });
                    }
                    if other_value > self_value {
                        model_ops.push(CountOperation::MultiIncrement {
                            actor: actor.clone(),
                            value: other_value - self_value,
                            from: self_version,
                            to: other_version,
                        });
                    }
                    self.data.values.insert(actor.clone(), other_value);
                    self.data.version_map.set(&actor, other_version)?;
                }
                std::cmp::Ordering::Greater => {
                    if self_value < other_value {
                        return Err(CrdtError::ApparentDecrement {
                            actor,
                            from: other_value,
                            to: self_value,
                        });
                    }
                    if self_value > other_value {
                        other_ops.push(CountOperation::MultiIncrement {
                            actor: actor.clone(),
                            value: self_value - other_value,
                            from: other_version,
                            to: self_version,
                        });
                    }
                }
                std::cmp::Ordering::Equal => {
                    if self_value != other_value {
                        return Err(CrdtError::Divergence(format!(
                            "actor {} at version {} reports both {} and {}",
                            actor, self_version, self_value, other_value
                        )));
                    }
                }
            }
        }

        Ok(MergeChanges {
            model_change: CrdtChange::Operations(model_ops),
            other_change: CrdtChange::Operations(other_ops),
        })
    }

    fn data(&self) -> CountData {
        self.data.clone()
    }

    fn consumer_view(&self) -> u64 {
        self.data.values.values().sum()
    }

    fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_count_is_zero() {
        let count = CrdtCount::new();
        assert_eq!(count.consumer_view(), 0);
    }

    #[test]
    fn test_increment() {
        let mut count = CrdtCount::new();
        assert!(count.increment("alice"));
        assert!(count.increment("alice"));
        assert!(count.increment("bob"));

        assert_eq!(count.consumer_view(), 3);
        assert_eq!(count.value_for_actor("alice"), 2);
        assert_eq!(count.value_for_actor("bob"), 1);
    }

    #[test]
    fn test_stale_op_rejected() {
        let mut count = CrdtCount::new();
        assert!(count.increment("alice"));

        // Replay of the first increment: from = 0 but clock is at 1
        let replay = CountOperation::Increment {
            actor: "alice".to_string(),
            from: 0,
            to: 1,
        };
        assert!(!count.apply_operation(replay));
        assert_eq!(count.consumer_view(), 1);
    }

    #[test]
    fn test_version_gap_rejected() {
        let mut count = CrdtCount::new();
        let op = CountOperation::MultiIncrement {
            actor: "alice".to_string(),
            value: 5,
            from: 0,
            to: 2,
        };
        assert!(!count.apply_operation(op));
        assert_eq!(count.consumer_view(), 0);
    }

    #[test]
    fn test_merge_two_actors() {
        let mut alice = CrdtCount::new();
        alice.increment_by("a", 6);

        let mut bob = CrdtCount::new();
        bob.increment_by("b", 5);

        let changes = alice.merge(bob.data()).unwrap();
        assert_eq!(alice.consumer_view(), 11);

        // Shipping the other-side changes to bob converges both replicas
        if let CrdtChange::Operations(ops) = changes.other_change {
            for op in ops {
                assert!(bob.apply_operation(op));
            }
        }
        assert_eq!(bob.consumer_view(), 11);
        assert_eq!(alice.data(), bob.data());
    }

    #[test]
    fn test_merge_idempotent() {
        let mut a = CrdtCount::new();
        a.increment_by("x", 3);
        let snapshot = a.data();

        let changes = a.merge(snapshot.clone()).unwrap();
        assert_eq!(a.consumer_view(), 3);
        assert!(changes.model_change.is_empty());
        assert!(changes.other_change.is_empty());
    }

    #[test]
    fn test_merge_detects_apparent_decrement() {
        let mut a = CrdtCount::new();
        a.increment_by("x", 5);

        // Forge a remote state claiming a newer version with a smaller value
        let mut forged = a.data();
        forged.values.insert("x".to_string(), 2);
        forged.version_map.set("x", 2).unwrap();

        let err = a.merge(forged).unwrap_err();
        assert!(matches!(err, CrdtError::ApparentDecrement { .. }));
    }

    #[test]
    fn test_merge_detects_same_version_divergence() {
        let mut a = CrdtCount::new();
        a.increment_by("x", 5);

        let mut forged = a.data();
        forged.values.insert("x".to_string(), 9);

        let err = a.merge(forged).unwrap_err();
        assert!(matches!(err, CrdtError::Divergence(_)));
    }

    #[test]
    fn test_merge_change_ops_reapply() {
        // model_change ops describe exactly what merge already absorbed
        let mut a = CrdtCount::new();
        a.increment_by("a", 2);
        let mut b = CrdtCount::new();
        b.increment_by("b", 4);

        let pre_merge = CrdtCount::from_data(a.data());
        let changes = a.merge(b.data()).unwrap();

        let mut replayed = pre_merge;
        if let CrdtChange::Operations(ops) = changes.model_change {
            for op in ops {
                assert!(replayed.apply_operation(op));
            }
        }
        assert_eq!(replayed.data(), a.data());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Property: mutual merge converges both replicas to the same total
    proptest! {
        #[test]
        fn prop_mutual_merge_converges(
            a_amounts in prop::collection::vec(0u64..100, 0..8),
            b_amounts in prop::collection::vec(0u64..100, 0..8),
        ) {
            let mut a = CrdtCount::new();
            for amount in &a_amounts {
                a.increment_by("a", *amount);
            }
            let mut b = CrdtCount::new();
            for amount in &b_amounts {
                b.increment_by("b", *amount);
            }

            let a_data = a.data();
            let b_data = b.data();

            a.merge(b_data).unwrap();
            b.merge(a_data).unwrap();

            prop_assert_eq!(a.consumer_view(), b.consumer_view());
            prop_assert_eq!(a.data(), b.data());
        }
    }

    // Property: merge is idempotent
    proptest! {
        #[test]
        fn prop_merge_idempotent(amounts in prop::collection::vec(1u64..50, 0..8)) {
            let mut a = CrdtCount::new();
            for amount in &amounts {
                a.increment_by("a", *amount);
            }
            let before = a.data();
            a.merge(before.clone()).unwrap();
            prop_assert_eq!(a.data(), before);
        }
    }
}
