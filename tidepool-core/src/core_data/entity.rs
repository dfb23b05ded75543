/*
    entity.rs - Raw (non-CRDT) entity representation

    The consumer-facing shape of an entity: named singleton fields holding
    at most one value and named collection fields holding a set of values,
    plus identity and write-once timestamps. Timestamps use -1 for "unset".
*/

use super::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Sentinel for an unset creation/expiration timestamp
pub const UNSET_TIMESTAMP: i64 = -1;

/// Plain entity value
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawEntity {
    /// Entity identity; immutable once assigned
    pub id: String,

    /// Creation time in ms since epoch, -1 when unset; write-once
    pub creation_timestamp_ms: i64,

    /// Expiration time in ms since epoch, -1 when unset; write-once
    pub expiration_timestamp_ms: i64,

    /// Singleton fields; `None` models an explicit null
    pub singletons: BTreeMap<String, Option<FieldValue>>,

    /// Collection fields
    pub collections: BTreeMap<String, BTreeSet<FieldValue>>,
}

impl RawEntity {
    /// Create an empty entity with the given id
    pub fn new(id: &str) -> Self {
        RawEntity {
            id: id.to_string(),
            creation_timestamp_ms: UNSET_TIMESTAMP,
            expiration_timestamp_ms: UNSET_TIMESTAMP,
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    /// Builder-style singleton assignment
    pub fn with_singleton(mut self, field: &str, value: Option<FieldValue>) -> Self {
        self.singletons.insert(field.to_string(), value);
        self
    }

    /// Builder-style collection entry
    pub fn with_collection_entry(mut self, field: &str, value: FieldValue) -> Self {
        self.collections
            .entry(field.to_string())
            .or_default()
            .insert(value);
        self
    }

    /// Builder-style empty collection declaration
    pub fn with_empty_collection(mut self, field: &str) -> Self {
        self.collections.entry(field.to_string()).or_default();
        self
    }

    pub fn with_creation_timestamp(mut self, millis: i64) -> Self {
        self.creation_timestamp_ms = millis;
        self
    }

    pub fn with_expiration_timestamp(mut self, millis: i64) -> Self {
        self.expiration_timestamp_ms = millis;
        self
    }

    /// True when the entity has an expiration in the past relative to `now`
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_timestamp_ms != UNSET_TIMESTAMP && self.expiration_timestamp_ms <= now_ms
    }
}
