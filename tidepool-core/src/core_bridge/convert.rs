/*
    convert.rs - CRDT model / database representation conversions

    A driver moves full snapshots between the CRDT layer and the storage
    engine. Going toward storage, the model's clocks ride along on the
    membership entries; coming back, per-entry clocks rebuild set-shaped
    state and the stored entity clock stands in for per-field clocks the
    relational layout does not keep.
*/

use crate::core_crdt::entity::EntityData;
use crate::core_crdt::set::{SetData, VersionedValue};
use crate::core_crdt::singleton::SingletonData;
use crate::core_crdt::traits::Referencable;
use crate::core_database::data::{
    DatabaseCollection, DatabaseData, DatabaseEntity, DatabaseSingleton, ReferenceWithVersion,
};
use crate::core_data::entity::RawEntity;
use crate::core_data::reference::RawReference;
use crate::core_data::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full CRDT snapshot a driver exchanges with its store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CrdtData {
    Entity(EntityData),
    Singleton(SingletonData<RawReference>),
    Set(SetData<RawReference>),
}

/// Render a CRDT snapshot in the engine's representation. The schema
/// hash and target database version come from the driver, not the model.
pub fn crdt_to_database(data: &CrdtData, schema_hash: &str, database_version: i64) -> DatabaseData {
    match data {
        CrdtData::Entity(entity) => DatabaseData::Entity(DatabaseEntity {
            raw: entity_consumer_view(entity),
            schema_hash: schema_hash.to_string(),
            database_version,
            version_map: entity.version_map.clone(),
        }),
        CrdtData::Singleton(singleton) => DatabaseData::Singleton(DatabaseSingleton {
            value: membership_values(singleton).into_iter().next(),
            schema_hash: schema_hash.to_string(),
            database_version,
            version_map: singleton.version_map.clone(),
        }),
        CrdtData::Set(set) => DatabaseData::Collection(DatabaseCollection {
            values: membership_values(set),
            schema_hash: schema_hash.to_string(),
            database_version,
            version_map: set.version_map.clone(),
        }),
    }
}

/// Rebuild CRDT state from the engine's representation
pub fn database_to_crdt(data: &DatabaseData) -> CrdtData {
    match data {
        DatabaseData::Entity(entity) => CrdtData::Entity(entity_data_from_stored(entity)),
        DatabaseData::Singleton(singleton) => {
            let mut state = SingletonData {
                version_map: singleton.version_map.clone(),
                values: BTreeMap::new(),
            };
            if let Some(value) = &singleton.value {
                state.values.insert(
                    value.reference.id.clone(),
                    VersionedValue {
                        value: value.reference.clone(),
                        version_map: value.version_map.clone(),
                    },
                );
            }
            CrdtData::Singleton(state)
        }
        DatabaseData::Collection(collection) => {
            let mut state: SetData<RawReference> = SetData {
                version_map: collection.version_map.clone(),
                values: BTreeMap::new(),
            };
            for value in &collection.values {
                state.values.insert(
                    value.reference.id.clone(),
                    VersionedValue {
                        value: value.reference.clone(),
                        version_map: value.version_map.clone(),
                    },
                );
            }
            CrdtData::Set(state)
        }
    }
}

fn membership_values(state: &SetData<RawReference>) -> Vec<ReferenceWithVersion> {
    state
        .values
        .values()
        .map(|entry| ReferenceWithVersion {
            reference: entry.value.clone(),
            version_map: entry.version_map.clone(),
        })
        .collect()
}

fn entity_consumer_view(entity: &EntityData) -> RawEntity {
    let mut raw = RawEntity::new(&entity.id);
    raw.creation_timestamp_ms = entity.creation_timestamp_ms;
    raw.expiration_timestamp_ms = entity.expiration_timestamp_ms;
    for (field, state) in &entity.singletons {
        let value = state.values.values().next().map(|entry| entry.value.clone());
        raw.singletons.insert(field.clone(), value);
    }
    for (field, state) in &entity.collections {
        raw.collections.insert(
            field.clone(),
            state.values.values().map(|entry| entry.value.clone()).collect(),
        );
    }
    raw
}

/// Stored entities keep one clock for the whole row; every live field
/// entry is rebuilt under it
fn entity_data_from_stored(entity: &DatabaseEntity) -> EntityData {
    let clock = entity.version_map.clone();
    let mut singletons: BTreeMap<String, SingletonData<FieldValue>> = BTreeMap::new();
    for (field, value) in &entity.raw.singletons {
        let mut state = SingletonData {
            version_map: clock.clone(),
            values: BTreeMap::new(),
        };
        if let Some(value) = value {
            state.values.insert(
                value.reference_id(),
                VersionedValue {
                    value: value.clone(),
                    version_map: clock.clone(),
                },
            );
        }
        singletons.insert(field.clone(), state);
    }
    let mut collections: BTreeMap<String, SetData<FieldValue>> = BTreeMap::new();
    for (field, values) in &entity.raw.collections {
        let mut state = SetData {
            version_map: clock.clone(),
            values: BTreeMap::new(),
        };
        for value in values {
            state.values.insert(
                value.reference_id(),
                VersionedValue {
                    value: value.clone(),
                    version_map: clock.clone(),
                },
            );
        }
        collections.insert(field.clone(), state);
    }

    EntityData {
        id: entity.raw.id.clone(),
        creation_timestamp_ms: entity.raw.creation_timestamp_ms,
        expiration_timestamp_ms: entity.raw.expiration_timestamp_ms,
        version_map: clock,
        singletons,
        collections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crdt::entity::CrdtEntity;
    use crate::core_crdt::set::CrdtSet;
    use crate::core_crdt::traits::CrdtModel;
    use crate::core_data::storage_key::StorageKey;

    fn backing() -> StorageKey {
        StorageKey::parse("db://backing").unwrap()
    }

    #[test]
    fn test_set_roundtrip_preserves_entry_clocks() {
        let mut set: CrdtSet<RawReference> = CrdtSet::new();
        set.add("alice", RawReference::new("e1", backing()));
        set.add("bob", RawReference::new("e2", backing()));

        let crdt = CrdtData::Set(set.data());
        let db = crdt_to_database(&crdt, "hash", 1);
        assert_eq!(database_to_crdt(&db), crdt);
    }

    #[test]
    fn test_singleton_keeps_smallest_id() {
        let mut state: SingletonData<RawReference> = SingletonData::default();
        for id in ["banana", "apple"] {
            state.values.insert(
                id.to_string(),
                VersionedValue {
                    value: RawReference::new(id, backing()),
                    version_map: crate::core_crdt::version_map::VersionMap::of(id, 1),
                },
            );
        }

        let db = crdt_to_database(&CrdtData::Singleton(state), "hash", 1);
        let DatabaseData::Singleton(singleton) = db else {
            panic!("expected singleton");
        };
        assert_eq!(singleton.value.unwrap().reference.id, "apple");
    }

    #[test]
    fn test_entity_to_database_uses_consumer_view() {
        let mut entity = CrdtEntity::new("e1");
        entity.set_singleton("alice", "name", FieldValue::text("bob"));

        let db = crdt_to_database(&CrdtData::Entity(entity.data()), "hash", 1);
        let DatabaseData::Entity(stored) = db else {
            panic!("expected entity");
        };
        assert_eq!(stored.raw, entity.consumer_view());
        assert_eq!(stored.version_map, *entity.version_map());
    }

    #[test]
    fn test_stored_entity_rebuilds_under_row_clock() {
        let mut entity = CrdtEntity::new("e1");
        entity.set_singleton("alice", "name", FieldValue::text("bob"));
        let stored = DatabaseEntity {
            raw: entity.consumer_view(),
            schema_hash: "hash".to_string(),
            database_version: 1,
            version_map: entity.version_map().clone(),
        };

        let CrdtData::Entity(rebuilt) = database_to_crdt(&DatabaseData::Entity(stored)) else {
            panic!("expected entity");
        };
        assert_eq!(rebuilt.id, "e1");
        assert_eq!(rebuilt.version_map, *entity.version_map());
        let field = rebuilt.singletons.get("name").unwrap();
        assert_eq!(field.values.len(), 1);
        assert_eq!(field.version_map, *entity.version_map());
    }
}
