/*
    bridging.rs - Reference-mode container mutations

    In reference mode a container holds references while the entity
    bodies live in a backing store. Every add or update writes the
    backing entity first, so a reader of the container can always
    dereference what it finds there.
*/

use crate::core_database::data::{
    DataKind, DatabaseCollection, DatabaseData, DatabaseEntity, DatabaseOp, DatabaseSingleton,
};
use crate::core_database::database::Database;
use crate::core_database::errors::DatabaseResult;
use crate::core_crdt::version_map::VersionMap;
use crate::core_data::entity::RawEntity;
use crate::core_data::reference::RawReference;
use crate::core_data::storage_key::StorageKey;
use serde::{Deserialize, Serialize};

/// A container mutation expressed over full entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgingOperation {
    /// Add an entity to a set container
    AddToSet { actor: String, entity: RawEntity },

    /// Remove the member with the given entity id
    RemoveFromSet { id: String },

    /// Replace a singleton container's value
    UpdateSingleton { actor: String, entity: RawEntity },

    /// Clear a singleton container
    ClearSingleton,
}

/// Apply a bridging operation: upsert the backing entity at
/// `backing.child(id)` first, then apply the reference delta to the
/// container. Creates the container on first use.
pub fn apply_bridging_op(
    database: &Database,
    container_key: &StorageKey,
    backing_key: &StorageKey,
    schema_hash: &str,
    kind: DataKind,
    op: &BridgingOperation,
    originating: Option<usize>,
) -> DatabaseResult<bool> {
    ensure_container(database, container_key, kind, schema_hash, originating)?;

    match op {
        BridgingOperation::AddToSet { actor, entity }
        | BridgingOperation::UpdateSingleton { actor, entity } => {
            let reference = write_backing_entity(
                database,
                backing_key,
                schema_hash,
                actor,
                entity,
                originating,
            )?;
            database.apply_op(
                container_key,
                &DatabaseOp::AddToCollection(reference),
                originating,
            )
        }
        BridgingOperation::RemoveFromSet { id } => database.apply_op(
            container_key,
            &DatabaseOp::RemoveFromCollection(id.clone()),
            originating,
        ),
        BridgingOperation::ClearSingleton => {
            database.apply_op(container_key, &DatabaseOp::ClearCollection, originating)
        }
    }
}

/// Upsert the entity body into the backing store and mint the reference
/// the container will hold
fn write_backing_entity(
    database: &Database,
    backing_key: &StorageKey,
    schema_hash: &str,
    actor: &str,
    entity: &RawEntity,
    originating: Option<usize>,
) -> DatabaseResult<RawReference> {
    let entity_key = backing_key.child(&entity.id);
    let (next_version, version_map) = match database.get_entity(&entity_key)? {
        Some(stored) => {
            let mut version_map = stored.version_map;
            version_map.increment(actor);
            (stored.database_version + 1, version_map)
        }
        None => (1, VersionMap::of(actor, 1)),
    };

    let stored = DatabaseEntity {
        raw: entity.clone(),
        schema_hash: schema_hash.to_string(),
        database_version: next_version,
        version_map: version_map.clone(),
    };
    database.insert_or_update_entity(&entity_key, &stored, originating)?;

    Ok(RawReference::to_entity(entity, backing_key.clone()).with_version_map(version_map))
}

fn ensure_container(
    database: &Database,
    container_key: &StorageKey,
    kind: DataKind,
    schema_hash: &str,
    originating: Option<usize>,
) -> DatabaseResult<()> {
    if database.get(container_key)?.is_some() {
        return Ok(());
    }
    let empty = match kind {
        DataKind::Singleton => DatabaseData::Singleton(DatabaseSingleton {
            value: None,
            schema_hash: schema_hash.to_string(),
            database_version: 1,
            version_map: VersionMap::new(),
        }),
        _ => DatabaseData::Collection(DatabaseCollection {
            values: vec![],
            schema_hash: schema_hash.to_string(),
            database_version: 1,
            version_map: VersionMap::new(),
        }),
    };
    database.insert_or_update(container_key, &empty, originating)?;
    Ok(())
}
