/*
    entity.rs - Entity CRDT composed of per-field set and singleton states

    An entity is a map of named singleton fields and named collection
    fields, each carrying set-shaped replicated state, under a single
    entity-level clock. Operations are versioned against the entity clock;
    merging resolves field by field and refuses to merge entities whose
    identities disagree.
*/

use super::errors::{CrdtError, CrdtResult};
use super::set::{merge_set_data, SetData, VersionedValue};
use super::singleton::SingletonData;
use super::traits::{CrdtChange, CrdtModel, MergeChanges, Referencable};
use super::version_map::VersionMap;
use crate::core_data::entity::{RawEntity, UNSET_TIMESTAMP};
use crate::core_data::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replicated state of an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    /// Entity identity; merging entities with different ids is an error
    pub id: String,

    /// Creation time in ms since epoch, -1 when unset
    pub creation_timestamp_ms: i64,

    /// Expiration time in ms since epoch, -1 when unset
    pub expiration_timestamp_ms: i64,

    /// The entity-level clock all operations are versioned against
    pub version_map: VersionMap,

    /// Singleton fields
    pub singletons: BTreeMap<String, SingletonData<FieldValue>>,

    /// Collection fields
    pub collections: BTreeMap<String, SetData<FieldValue>>,
}

/// Operations accepted by [`CrdtEntity`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityOperation {
    /// Replace a singleton field's value; `versions` must be actor-next
    /// against the entity clock
    SetSingleton {
        actor: String,
        versions: VersionMap,
        field: String,
        value: FieldValue,
    },

    /// Clear every entry of a singleton field that `versions` has observed
    ClearSingleton {
        actor: String,
        versions: VersionMap,
        field: String,
    },

    /// Add a value to a collection field; `versions` must be actor-next
    /// against the entity clock
    AddToCollection {
        actor: String,
        versions: VersionMap,
        field: String,
        added: FieldValue,
    },

    /// Remove a collection entry by reference id; `versions` must dominate
    /// the stored entry's clock
    RemoveFromCollection {
        actor: String,
        versions: VersionMap,
        field: String,
        removed: String,
    },

    /// Clear every observed entry across all fields
    ClearAll { actor: String, versions: VersionMap },
}

/// Entity CRDT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtEntity {
    data: EntityData,
}

impl CrdtEntity {
    /// Create an empty entity with the given id
    pub fn new(id: &str) -> Self {
        CrdtEntity {
            data: EntityData {
                id: id.to_string(),
                creation_timestamp_ms: UNSET_TIMESTAMP,
                expiration_timestamp_ms: UNSET_TIMESTAMP,
                ..EntityData::default()
            },
        }
    }

    /// Rehydrate an entity from snapshot data
    pub fn from_data(data: EntityData) -> Self {
        CrdtEntity { data }
    }

    /// Build the replicated form of a raw entity, attributing every field
    /// write to `actor` as successive versions
    pub fn from_raw(raw: &RawEntity, actor: &str) -> Self {
        let mut entity = CrdtEntity::new(&raw.id);
        entity.data.creation_timestamp_ms = raw.creation_timestamp_ms;
        entity.data.expiration_timestamp_ms = raw.expiration_timestamp_ms;

        for (field, value) in &raw.singletons {
            entity.data.singletons.entry(field.clone()).or_default();
            if let Some(value) = value {
                entity.set_singleton(actor, field, value.clone());
            }
        }
        for (field, values) in &raw.collections {
            entity.data.collections.entry(field.clone()).or_default();
            for value in values {
                entity.add_to_collection(actor, field, value.clone());
            }
        }
        entity
    }

    /// Convenience: build and apply an actor-next singleton update
    pub fn set_singleton(&mut self, actor: &str, field: &str, value: FieldValue) -> bool {
        let versions = self.next_versions(actor);
        self.apply_operation(EntityOperation::SetSingleton {
            actor: actor.to_string(),
            versions,
            field: field.to_string(),
            value,
        })
    }

    /// Convenience: build and apply a clear of a singleton field
    pub fn clear_singleton(&mut self, actor: &str, field: &str) -> bool {
        self.apply_operation(EntityOperation::ClearSingleton {
            actor: actor.to_string(),
            versions: self.data.version_map.clone(),
            field: field.to_string(),
        })
    }

    /// Convenience: build and apply an actor-next collection add
    pub fn add_to_collection(&mut self, actor: &str, field: &str, value: FieldValue) -> bool {
        let versions = self.next_versions(actor);
        self.apply_operation(EntityOperation::AddToCollection {
            actor: actor.to_string(),
            versions,
            field: field.to_string(),
            added: value,
        })
    }

    /// Convenience: build and apply a collection remove by reference id
    pub fn remove_from_collection(&mut self, actor: &str, field: &str, id: &str) -> bool {
        self.apply_operation(EntityOperation::RemoveFromCollection {
            actor: actor.to_string(),
            versions: self.data.version_map.clone(),
            field: field.to_string(),
            removed: id.to_string(),
        })
    }

    fn next_versions(&self, actor: &str) -> VersionMap {
        let mut versions = self.data.version_map.clone();
        let _ = versions.set(actor, self.data.version_map.get(actor) + 1);
        versions
    }

    fn is_actor_next(&self, actor: &str, versions: &VersionMap) -> bool {
        versions.get(actor) == self.data.version_map.get(actor) + 1
    }

    fn merge_timestamps(&mut self, other: &EntityData) {
        // Write-once fields: adopt the other side's value when unset; when
        // both are set the earliest observed value wins
        if self.data.creation_timestamp_ms == UNSET_TIMESTAMP {
            self.data.creation_timestamp_ms = other.creation_timestamp_ms;
        } else if other.creation_timestamp_ms != UNSET_TIMESTAMP {
            self.data.creation_timestamp_ms = self
                .data
                .creation_timestamp_ms
                .min(other.creation_timestamp_ms);
        }
        if self.data.expiration_timestamp_ms == UNSET_TIMESTAMP {
            self.data.expiration_timestamp_ms = other.expiration_timestamp_ms;
        } else if other.expiration_timestamp_ms != UNSET_TIMESTAMP {
            self.data.expiration_timestamp_ms = self
                .data
                .expiration_timestamp_ms
                .min(other.expiration_timestamp_ms);
        }
    }
}

impl CrdtModel for CrdtEntity {
    type Data = EntityData;
    type Operation = EntityOperation;
    type View = RawEntity;

    fn apply_operation(&mut self, op: Self::Operation) -> bool {
        match op {
            EntityOperation::SetSingleton {
                actor,
                versions,
                field,
                value,
            } => {
                if !self.is_actor_next(&actor, &versions) {
                    return false;
                }
                let state = self.data.singletons.entry(field).or_default();
                state
                    .values
                    .retain(|_, entry| !versions.dominates(&entry.version_map));
                state.values.insert(
                    value.reference_id(),
                    VersionedValue {
                        value,
                        version_map: versions.clone(),
                    },
                );
                state.version_map.merge(&versions);
                self.data.version_map.merge(&versions);
                true
            }
            EntityOperation::ClearSingleton {
                versions, field, ..
            } => {
                let state = self.data.singletons.entry(field).or_default();
                state
                    .values
                    .retain(|_, entry| !versions.dominates(&entry.version_map));
                state.version_map.merge(&versions);
                self.data.version_map.merge(&versions);
                true
            }
            EntityOperation::AddToCollection {
                actor,
                versions,
                field,
                added,
            } => {
                if !self.is_actor_next(&actor, &versions) {
                    return false;
                }
                let state = self.data.collections.entry(field).or_default();
                let id = added.reference_id();
                match state.values.get_mut(&id) {
                    Some(existing) => existing.version_map.merge(&versions),
                    None => {
                        state.values.insert(
                            id,
                            VersionedValue {
                                value: added,
                                version_map: versions.clone(),
                            },
                        );
                    }
                }
                state.version_map.merge(&versions);
                self.data.version_map.merge(&versions);
                true
            }
            EntityOperation::RemoveFromCollection {
                versions,
                field,
                removed,
                ..
            } => {
                let Some(state) = self.data.collections.get_mut(&field) else {
                    return false;
                };
                let Some(entry) = state.values.get(&removed) else {
                    return false;
                };
                // A concurrent add keeps the entry alive
                if !versions.dominates(&entry.version_map) {
                    return false;
                }
                state.values.remove(&removed);
                state.version_map.merge(&versions);
                self.data.version_map.merge(&versions);
                true
            }
            EntityOperation::ClearAll { versions, .. } => {
                for state in self.data.singletons.values_mut() {
                    state
                        .values
                        .retain(|_, entry| !versions.dominates(&entry.version_map));
                    state.version_map.merge(&versions);
                }
                for state in self.data.collections.values_mut() {
                    state
                        .values
                        .retain(|_, entry| !versions.dominates(&entry.version_map));
                    state.version_map.merge(&versions);
                }
                self.data.version_map.merge(&versions);
                true
            }
        }
    }

    fn merge(&mut self, other: Self::Data) -> CrdtResult<MergeChanges<EntityData, EntityOperation>> {
        if self.data.id != other.id {
            return Err(CrdtError::MetadataMismatch(format!(
                "cannot merge entity '{}' with entity '{}'",
                self.data.id, other.id
            )));
        }

        self.merge_timestamps(&other);

        let field_names: std::collections::BTreeSet<String> = self
            .data
            .singletons
            .keys()
            .chain(other.singletons.keys())
            .cloned()
            .collect();
        for field in field_names {
            let mine = self.data.singletons.entry(field.clone()).or_default();
            let theirs = other.singletons.get(&field).cloned().unwrap_or_default();
            *mine = merge_set_data(mine, &theirs);
        }

        let field_names: std::collections::BTreeSet<String> = self
            .data
            .collections
            .keys()
            .chain(other.collections.keys())
            .cloned()
            .collect();
        for field in field_names {
            let mine = self.data.collections.entry(field.clone()).or_default();
            let theirs = other.collections.get(&field).cloned().unwrap_or_default();
            *mine = merge_set_data(mine, &theirs);
        }

        self.data.version_map.merge(&other.version_map);
        Ok(MergeChanges {
            model_change: CrdtChange::Data(self.data.clone()),
            other_change: CrdtChange::Data(self.data.clone()),
        })
    }

    fn data(&self) -> EntityData {
        self.data.clone()
    }

    /// The consumer-facing entity; a singleton field left with more than one
    /// live entry by concurrency resolves to the smallest-id entry
    fn consumer_view(&self) -> RawEntity {
        let mut raw = RawEntity::new(&self.data.id);
        raw.creation_timestamp_ms = self.data.creation_timestamp_ms;
        raw.expiration_timestamp_ms = self.data.expiration_timestamp_ms;

        for (field, state) in &self.data.singletons {
            let value = state.values.values().next().map(|entry| entry.value.clone());
            raw.singletons.insert(field.clone(), value);
        }
        for (field, state) in &self.data.collections {
            raw.collections.insert(
                field.clone(),
                state.values.values().map(|entry| entry.value.clone()).collect(),
            );
        }
        raw
    }

    fn version_map(&self) -> &VersionMap {
        &self.data.version_map
    }
}
