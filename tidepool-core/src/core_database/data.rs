/*
    data.rs - Database-facing data model

    The shapes exchanged with the database engine: versioned entities,
    collections and singletons of references, the tagged read result,
    and incremental collection operations.
*/

use crate::core_crdt::version_map::VersionMap;
use crate::core_data::entity::RawEntity;
use crate::core_data::reference::RawReference;
use serde::{Deserialize, Serialize};

/// Actor id the database uses when it derives clocks for incremental
/// operations it applies itself. Distinct from any application actor.
pub const DATABASE_ACTOR_ID: &str = "tidepool::db";

/// Kind tag stored with every storage key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Entity,
    Singleton,
    Collection,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Entity => "entity",
            DataKind::Singleton => "singleton",
            DataKind::Collection => "collection",
        }
    }

    pub(crate) fn to_column(self) -> i64 {
        match self {
            DataKind::Entity => 0,
            DataKind::Singleton => 1,
            DataKind::Collection => 2,
        }
    }

    pub(crate) fn from_column(value: i64) -> Option<Self> {
        match value {
            0 => Some(DataKind::Entity),
            1 => Some(DataKind::Singleton),
            2 => Some(DataKind::Collection),
            _ => None,
        }
    }
}

/// A reference paired with the clock of the membership entry holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceWithVersion {
    pub reference: RawReference,
    pub version_map: VersionMap,
}

/// A versioned entity as stored at an entity key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseEntity {
    pub raw: RawEntity,
    pub schema_hash: String,
    /// Monotonic per-key version; a write must carry stored + 1
    pub database_version: i64,
    pub version_map: VersionMap,
}

/// A versioned set of references as stored at a collection key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseCollection {
    pub values: Vec<ReferenceWithVersion>,
    pub schema_hash: String,
    pub database_version: i64,
    pub version_map: VersionMap,
}

/// A versioned optional reference as stored at a singleton key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSingleton {
    pub value: Option<ReferenceWithVersion>,
    pub schema_hash: String,
    pub database_version: i64,
    pub version_map: VersionMap,
}

/// Tagged result of an untyped read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseData {
    Entity(DatabaseEntity),
    Singleton(DatabaseSingleton),
    Collection(DatabaseCollection),
}

impl DatabaseData {
    pub fn kind(&self) -> DataKind {
        match self {
            DatabaseData::Entity(_) => DataKind::Entity,
            DatabaseData::Singleton(_) => DataKind::Singleton,
            DatabaseData::Collection(_) => DataKind::Collection,
        }
    }

    pub fn database_version(&self) -> i64 {
        match self {
            DatabaseData::Entity(e) => e.database_version,
            DatabaseData::Singleton(s) => s.database_version,
            DatabaseData::Collection(c) => c.database_version,
        }
    }

    pub fn version_map(&self) -> &VersionMap {
        match self {
            DatabaseData::Entity(e) => &e.version_map,
            DatabaseData::Singleton(s) => &s.version_map,
            DatabaseData::Collection(c) => &c.version_map,
        }
    }
}

/// Incremental mutation of a collection or singleton key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseOp {
    /// Insert a reference into the membership
    AddToCollection(RawReference),

    /// Remove the membership entry for the given entity id
    RemoveFromCollection(String),

    /// Drop every membership entry
    ClearCollection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_column_roundtrip() {
        for kind in [DataKind::Entity, DataKind::Singleton, DataKind::Collection] {
            assert_eq!(DataKind::from_column(kind.to_column()), Some(kind));
        }
        assert_eq!(DataKind::from_column(9), None);
    }

    #[test]
    fn test_tagged_accessors() {
        let data = DatabaseData::Collection(DatabaseCollection {
            values: vec![],
            schema_hash: "h".to_string(),
            database_version: 3,
            version_map: VersionMap::new(),
        });
        assert_eq!(data.kind(), DataKind::Collection);
        assert_eq!(data.database_version(), 3);
    }
}
