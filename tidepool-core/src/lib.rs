/*
    tidepool-core - Local-first CRDT storage substrate

    Conflict-free replicated data models, a relational persistence
    engine with garbage collection and TTL expiry, and the driver layer
    bridging the two in reference mode.
*/

pub mod config;
pub mod core_bridge;
pub mod core_crdt;
pub mod core_data;
pub mod core_database;
pub mod logging;

pub use config::{FeatureFlags, FeatureManager};
pub use core_bridge::{BridgingOperation, CrdtData, DatabaseDriver, Driver};
pub use core_crdt::{
    CrdtCount, CrdtEntity, CrdtError, CrdtModel, CrdtResult, CrdtSet, CrdtSingleton, VersionMap,
    VersionOrdering,
};
pub use core_data::{
    FieldType, FieldValue, PrimitiveType, PrimitiveValue, RawEntity, RawReference, Schema,
    SchemaRegistry, StorageKey,
};
pub use core_database::{
    Database, DatabaseClient, DatabaseData, DatabaseEntity, DatabaseError, DatabaseOp,
    DatabaseResult,
};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = VersionMap::new();
    }
}
