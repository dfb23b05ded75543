/*
    reference.rs - Lightweight reference to an entity in a backing store

    A reference names an entity by id plus the storage key of the backing
    store holding its body; dereferencing reads `backing_key.child(id)`.
    Hard references participate in cascading-delete sweeps against a
    foreign key space and are indexed for that purpose by the database.
*/

use super::entity::RawEntity;
use super::storage_key::StorageKey;
use crate::core_crdt::traits::Referencable;
use crate::core_crdt::version_map::VersionMap;
use serde::{Deserialize, Serialize};

/// Reference to an entity stored elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawReference {
    /// Id of the referenced entity
    pub id: String,

    /// Storage key of the backing store holding the entity body
    pub backing_key: StorageKey,

    /// Clock of the referenced value as of when the reference was minted
    pub version_map: Option<VersionMap>,

    /// Creation timestamp of the referenced entity (ms since epoch)
    pub creation_timestamp_ms: Option<i64>,

    /// Expiration timestamp of the referenced entity (ms since epoch)
    pub expiration_timestamp_ms: Option<i64>,

    /// Hard references are tracked for cascading foreign-key deletes
    pub is_hard_reference: bool,
}

impl RawReference {
    /// Create a plain (soft) reference
    pub fn new(id: &str, backing_key: StorageKey) -> Self {
        RawReference {
            id: id.to_string(),
            backing_key,
            version_map: None,
            creation_timestamp_ms: None,
            expiration_timestamp_ms: None,
            is_hard_reference: false,
        }
    }

    /// Mint a reference to an entity, carrying over its timestamps
    pub fn to_entity(entity: &RawEntity, backing_key: StorageKey) -> Self {
        RawReference {
            id: entity.id.clone(),
            backing_key,
            version_map: None,
            creation_timestamp_ms: Some(entity.creation_timestamp_ms),
            expiration_timestamp_ms: Some(entity.expiration_timestamp_ms),
            is_hard_reference: false,
        }
    }

    pub fn with_version_map(mut self, version_map: VersionMap) -> Self {
        self.version_map = Some(version_map);
        self
    }

    pub fn hard(mut self) -> Self {
        self.is_hard_reference = true;
        self
    }

    /// The storage key where the referenced entity body lives
    pub fn dereference_key(&self) -> StorageKey {
        self.backing_key.child(&self.id)
    }
}

impl Referencable for RawReference {
    fn reference_id(&self) -> String {
        self.id.clone()
    }
}
