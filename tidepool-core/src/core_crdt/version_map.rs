/*
    version_map.rs - Per-actor logical clock

    A version map tracks one monotonically increasing version per actor and
    is the ordering/merge primitive for every CRDT in the model layer.
    Comparison is four-way: two maps can be equal, ordered either way, or
    concurrent (neither dominates).
*/

use super::errors::{CrdtError, CrdtResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Actor identifier for version maps
pub type ActorId = String;

/// Outcome of comparing two version maps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Equal,
    LessThan,
    GreaterThan,
    Concurrent,
}

/// Map from actor id to that actor's latest observed version
///
/// Backed by a `BTreeMap` so that serialized form is canonical; the storage
/// layer relies on this when interning version maps as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionMap {
    versions: BTreeMap<ActorId, u64>,
}

impl VersionMap {
    /// Create a new empty version map
    pub fn new() -> Self {
        VersionMap {
            versions: BTreeMap::new(),
        }
    }

    /// Create a version map holding a single actor entry
    pub fn of(actor: &str, version: u64) -> Self {
        let mut map = VersionMap::new();
        map.versions.insert(actor.to_string(), version);
        map
    }

    /// Get the version for an actor (0 when the actor is unknown)
    pub fn get(&self, actor: &str) -> u64 {
        self.versions.get(actor).copied().unwrap_or(0)
    }

    /// Increment an actor's version, returning the new value
    pub fn increment(&mut self, actor: &str) -> u64 {
        let entry = self.versions.entry(actor.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Set an actor's version; versions may never move backwards
    pub fn set(&mut self, actor: &str, version: u64) -> CrdtResult<()> {
        let current = self.get(actor);
        if version < current {
            return Err(CrdtError::InvalidVersion {
                actor: actor.to_string(),
                current,
                attempted: version,
            });
        }
        self.versions.insert(actor.to_string(), version);
        Ok(())
    }

    /// Merge another map into this one (pointwise maximum)
    pub fn merge(&mut self, other: &VersionMap) {
        for (actor, &version) in &other.versions {
            let entry = self.versions.entry(actor.clone()).or_insert(0);
            *entry = (*entry).max(version);
        }
    }

    /// Return a merged copy without mutating self
    pub fn merged(&self, other: &VersionMap) -> VersionMap {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// True when every entry in `other` is <= the corresponding entry here
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other
            .versions
            .iter()
            .all(|(actor, &version)| self.get(actor) >= version)
    }

    /// Four-way comparison against another map
    pub fn compare(&self, other: &VersionMap) -> VersionOrdering {
        let mut any_less = false;
        let mut any_greater = false;

        for (actor, &version) in &self.versions {
            let theirs = other.get(actor);
            if version < theirs {
                any_less = true;
            } else if version > theirs {
                any_greater = true;
            }
        }
        for (actor, &version) in &other.versions {
            if !self.versions.contains_key(actor) && version > 0 {
                any_less = true;
            }
        }

        match (any_less, any_greater) {
            (false, false) => VersionOrdering::Equal,
            (true, false) => VersionOrdering::LessThan,
            (false, true) => VersionOrdering::GreaterThan,
            (true, true) => VersionOrdering::Concurrent,
        }
    }

    /// All actor ids tracked by this map
    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.versions.keys()
    }

    /// Number of actors tracked
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True when no actor has been observed
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl fmt::Display for VersionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (actor, version)) in self.versions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", actor, version)?;
        }
        write!(f, "}}")
    }
}
