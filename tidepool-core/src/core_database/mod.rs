/*
    core_database - Relational persistence engine

    Durable storage for entities, collections and singletons behind
    storage keys. Handles:
    - Schema, field, reference and primitive interning
    - Optimistic versioned writes and typed reads
    - Post-commit client notifications
    - Two-pass garbage collection and TTL expiry
*/

pub mod client;
pub mod data;
pub mod database;
pub mod errors;
pub mod gc;
pub mod migrations;

#[cfg(test)]
pub mod tests;

pub use client::{ClientRegistry, DatabaseClient, NotificationQueue};
pub use data::{
    DataKind, DatabaseCollection, DatabaseData, DatabaseEntity, DatabaseOp, DatabaseSingleton,
    ReferenceWithVersion, DATABASE_ACTOR_ID,
};
pub use database::Database;
pub use errors::{DatabaseError, DatabaseResult};
pub use gc::GcStats;
