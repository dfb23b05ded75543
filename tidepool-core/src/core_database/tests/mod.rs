/*
    Integration tests for the core_database subsystem

    Test suite covering:
    - Write/read round trips and version races
    - Schema validation and evolution
    - Garbage collection and TTL expiry
    - Client notification dispatch
*/

pub mod gc_tests;
pub mod schema_evolution_tests;

use super::data::DatabaseEntity;
use super::database::Database;
use crate::core_crdt::version_map::VersionMap;
use crate::core_data::entity::RawEntity;
use crate::core_data::schema::{FieldType, PrimitiveType, Schema, SchemaRegistry};
use crate::core_data::storage_key::StorageKey;
use std::sync::Arc;

pub const PERSON_HASH: &str = "person-hash";
pub const PET_HASH: &str = "pet-hash";

pub fn person_schema() -> Schema {
    Schema::new("Person", PERSON_HASH)
        .with_singleton("name", FieldType::Primitive(PrimitiveType::Text))
        .with_singleton("age", FieldType::Primitive(PrimitiveType::Number))
        .with_singleton(
            "buddy",
            FieldType::Reference {
                schema_hash: PERSON_HASH.to_string(),
            },
        )
        .with_singleton(
            "pet",
            FieldType::Inline {
                schema_hash: PET_HASH.to_string(),
            },
        )
        .with_collection("tags", FieldType::Primitive(PrimitiveType::Text))
        .with_collection(
            "friends",
            FieldType::Reference {
                schema_hash: PERSON_HASH.to_string(),
            },
        )
}

pub fn pet_schema() -> Schema {
    Schema::new("Pet", PET_HASH)
        .with_singleton("name", FieldType::Primitive(PrimitiveType::Text))
}

pub fn test_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    registry.register(person_schema());
    registry.register(pet_schema());
    Arc::new(registry)
}

pub fn memory_db() -> Database {
    Database::in_memory(test_registry()).expect("failed to open in-memory database")
}

pub fn key(raw: &str) -> StorageKey {
    StorageKey::parse(raw).expect("bad test key")
}

/// A person entity carrying every declared field, so reads compare equal
pub fn person_entity(id: &str, name: &str) -> RawEntity {
    RawEntity::new(id)
        .with_singleton("name", Some(crate::core_data::value::FieldValue::text(name)))
        .with_singleton("age", None)
        .with_singleton("buddy", None)
        .with_singleton("pet", None)
        .with_empty_collection("tags")
        .with_empty_collection("friends")
}

pub fn stored(raw: RawEntity, version: i64, actor: &str) -> DatabaseEntity {
    DatabaseEntity {
        raw,
        schema_hash: PERSON_HASH.to_string(),
        database_version: version,
        version_map: VersionMap::of(actor, version as u64),
    }
}
