/*
    migrations.rs - Versioned schema migrations for the database engine

    Each migration runs atomically and is recorded in the schema version
    table. The relational layout interns type names, field descriptors,
    references and primitive values so repeated writes of the same value
    share a single row.
*/

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Current schema version for the storage engine
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Type ids below this are reserved for primitives; registered schemas
/// allocate upward from here
pub const FIRST_SCHEMA_TYPE_ID: i64 = 64;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial storage engine schema",
        up_sql: r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS engine_schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            );

            -- One row per storage key; value_id points at the collections
            -- row for singleton and collection keys
            CREATE TABLE IF NOT EXISTS storage_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key TEXT NOT NULL UNIQUE,
                data_kind INTEGER NOT NULL,            -- 0 entity, 1 singleton, 2 collection
                value_id INTEGER,
                database_version INTEGER NOT NULL DEFAULT 1
            );

            -- Interned type names: primitive types at fixed low ids,
            -- schema hashes allocated upward from 64
            CREATE TABLE IF NOT EXISTS types (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                is_primitive INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO types (id, name, is_primitive) VALUES
                (1, 'Boolean', 1),
                (2, 'Number', 1),
                (3, 'Text', 1);

            -- Field descriptors, stable per (schema type, field name)
            CREATE TABLE IF NOT EXISTS fields (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                field_kind INTEGER NOT NULL,           -- 0 primitive, 1 reference, 2 inline
                value_type_id INTEGER NOT NULL,
                is_collection INTEGER NOT NULL DEFAULT 0,
                UNIQUE (type_id, name)
            );

            -- One row per stored entity, keyed by its storage key row
            CREATE TABLE IF NOT EXISTS entities (
                storage_key_id INTEGER PRIMARY KEY,
                entity_id TEXT NOT NULL,
                type_id INTEGER NOT NULL,
                creation_timestamp INTEGER NOT NULL DEFAULT -1,
                expiration_timestamp INTEGER NOT NULL DEFAULT -1,
                version_map TEXT NOT NULL,
                orphan INTEGER NOT NULL DEFAULT 0,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                inline INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_entities_expiration
                ON entities(expiration_timestamp);

            -- Singleton field slots; value_id NULL is an explicit null,
            -- interpretation of value_id follows the field descriptor
            CREATE TABLE IF NOT EXISTS field_values (
                entity_storage_key_id INTEGER NOT NULL,
                field_id INTEGER NOT NULL,
                value_id INTEGER,
                PRIMARY KEY (entity_storage_key_id, field_id)
            );

            -- Set storage shared by top-level collections/singletons and
            -- collection-valued entity fields
            CREATE TABLE IF NOT EXISTS collections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry_type_id INTEGER NOT NULL,
                entry_kind INTEGER NOT NULL,           -- 0 primitive, 1 reference
                version_map TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS collection_entries (
                collection_id INTEGER NOT NULL,
                value_id INTEGER NOT NULL,
                version_map TEXT NOT NULL DEFAULT '{}',
                UNIQUE (collection_id, value_id)
            );

            CREATE INDEX IF NOT EXISTS idx_collection_entries_collection
                ON collection_entries(collection_id);

            -- Interned references, unique over the full tuple; sentinel
            -- defaults keep the uniqueness check total
            CREATE TABLE IF NOT EXISTS entity_refs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                backing_storage_key TEXT NOT NULL,
                version_map TEXT NOT NULL DEFAULT '',
                creation_timestamp INTEGER NOT NULL DEFAULT -1,
                expiration_timestamp INTEGER NOT NULL DEFAULT -1,
                is_hard_reference INTEGER NOT NULL DEFAULT 0,
                UNIQUE (entity_id, backing_storage_key, version_map,
                        creation_timestamp, expiration_timestamp, is_hard_reference)
            );

            CREATE INDEX IF NOT EXISTS idx_entity_refs_backing
                ON entity_refs(backing_storage_key);

            -- Interned primitive values; booleans encode as the literal
            -- value ids 0 and 1 and need no table
            CREATE TABLE IF NOT EXISTS text_primitive_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS number_primitive_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                value REAL NOT NULL UNIQUE
            );
        "#,
    }]
}

/// Get current schema version from the database
fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> Result<i32, rusqlite::Error> {
    let conn = pool.get().map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(format!(
            "failed to get connection: {}",
            e
        ))))
    })?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS engine_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Result<i32, _> = conn.query_row(
        "SELECT version FROM engine_schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    );

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> Result<(), rusqlite::Error> {
    let current_version = get_current_version(pool)?;
    let pending: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    let conn = pool.get().map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(format!(
            "failed to get connection: {}",
            e
        ))))
    })?;

    for migration in pending {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        tx.execute(
            "INSERT INTO engine_schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now],
        )?;
        tx.commit()?;

        debug!(
            version = migration.version,
            "applied migration: {}", migration.description
        );
    }

    Ok(())
}

/// The latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_test_pool() -> Pool<SqliteConnectionManager> {
        let manager = SqliteConnectionManager::memory();
        Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("failed to create pool")
    }

    #[test]
    fn test_initial_migration() {
        let pool = setup_test_pool();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'entities'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_primitive_types_seeded() {
        let pool = setup_test_pool();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let name: String = conn
            .query_row("SELECT name FROM types WHERE id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Number");
    }

    #[test]
    fn test_idempotent_migrations() {
        let pool = setup_test_pool();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let version: i32 = conn
            .query_row(
                "SELECT MAX(version) FROM engine_schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_latest_version_matches_constant() {
        assert_eq!(get_latest_version(), CURRENT_SCHEMA_VERSION);
    }
}
