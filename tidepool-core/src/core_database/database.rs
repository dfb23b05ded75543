/*
    database.rs - Relational storage engine

    Persists entities, collections and singletons behind storage keys in
    SQLite. Schema names, field descriptors, references and primitive
    values are interned; writes are optimistic (a write must carry the
    stored version + 1 and loses with `Ok(false)` otherwise) and
    serialized by a per-database write mutex. Client notifications
    dispatch after commit through the ordered queue.
*/

use super::client::{ClientRegistry, DatabaseClient, NotificationQueue};
use super::data::{
    DataKind, DatabaseCollection, DatabaseData, DatabaseEntity, DatabaseOp, DatabaseSingleton,
    ReferenceWithVersion, DATABASE_ACTOR_ID,
};
use super::errors::{DatabaseError, DatabaseResult};
use super::migrations::{self, FIRST_SCHEMA_TYPE_ID};
use crate::config::FeatureManager;
use crate::core_crdt::version_map::VersionMap;
use crate::core_data::entity::{RawEntity, UNSET_TIMESTAMP};
use crate::core_data::reference::RawReference;
use crate::core_data::schema::{FieldType, Schema, SchemaRegistry};
use crate::core_data::storage_key::StorageKey;
use crate::core_data::value::{FieldValue, PrimitiveValue};
use metrics::counter;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Storage classification of a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    Primitive,
    Reference,
    Inline,
}

impl FieldKind {
    fn to_column(self) -> i64 {
        match self {
            FieldKind::Primitive => 0,
            FieldKind::Reference => 1,
            FieldKind::Inline => 2,
        }
    }

    fn from_column(value: i64) -> Option<Self> {
        match value {
            0 => Some(FieldKind::Primitive),
            1 => Some(FieldKind::Reference),
            2 => Some(FieldKind::Inline),
            _ => None,
        }
    }
}

/// Cached row of the `fields` table
#[derive(Debug, Clone)]
pub(crate) struct FieldRow {
    pub id: i64,
    pub kind: FieldKind,
    pub value_type_id: i64,
    pub is_collection: bool,
}

/// The storage engine
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    schemas: Arc<SchemaRegistry>,
    features: FeatureManager,
    clients: ClientRegistry,
    notifications: NotificationQueue,
    write_lock: Mutex<()>,
    type_ids: Mutex<HashMap<String, i64>>,
    field_rows: Mutex<HashMap<i64, BTreeMap<String, FieldRow>>>,
}

impl Database {
    /// Open an in-memory database. A single pooled connection keeps every
    /// caller on the same memory image.
    pub fn in_memory(schemas: Arc<SchemaRegistry>) -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::with_pool(pool, schemas)
    }

    /// Open (or create) a database file on disk
    pub fn on_disk(path: &Path, schemas: Arc<SchemaRegistry>) -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(4).build(manager)?;
        Self::with_pool(pool, schemas)
    }

    fn with_pool(
        pool: Pool<SqliteConnectionManager>,
        schemas: Arc<SchemaRegistry>,
    ) -> DatabaseResult<Self> {
        migrations::migrate(&pool)?;
        Ok(Database {
            pool,
            schemas,
            features: FeatureManager::new(),
            clients: ClientRegistry::new(),
            notifications: NotificationQueue::new(),
            write_lock: Mutex::new(()),
            type_ids: Mutex::new(HashMap::new()),
            field_rows: Mutex::new(HashMap::new()),
        })
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn features(&self) -> &FeatureManager {
        &self.features
    }

    /// Register a change-notification client; returns its id
    pub fn add_client(&self, client: Arc<dyn DatabaseClient>) -> usize {
        self.clients.add_client(client)
    }

    /// Remove a change-notification client
    pub fn remove_client(&self, id: usize) {
        self.clients.remove_client(id)
    }

    pub(crate) fn conn(
        &self,
    ) -> DatabaseResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        // A poisoned write lock means a writer panicked mid-transaction;
        // the transaction itself rolled back, so the data is consistent
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- writes -----------------------------------------------------------

    /// Store an entity at `key`. Returns `Ok(false)` when the carried
    /// version loses the optimistic check against the stored version.
    pub fn insert_or_update_entity(
        &self,
        key: &StorageKey,
        entity: &DatabaseEntity,
        originating: Option<usize>,
    ) -> DatabaseResult<bool> {
        let schema = self
            .schemas
            .lookup(&entity.schema_hash)
            .ok_or_else(|| DatabaseError::NoSuchSchema(entity.schema_hash.clone()))?;
        self.validate_entity_shape(&schema, &entity.raw)?;

        let accepted = {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let accepted = self.write_entity_tx(&tx, key, entity, &schema, false)?;
            if accepted {
                tx.commit()?;
            }
            accepted
        };

        if !accepted {
            counter!("tidepool_db_writes_rejected_total").increment(1);
            debug!(key = %key, version = entity.database_version, "entity write lost version race");
            return Ok(false);
        }

        counter!("tidepool_db_writes_total").increment(1);
        self.notify_update(
            key,
            DatabaseData::Entity(entity.clone()),
            entity.database_version,
            originating,
        );
        Ok(true)
    }

    /// Store data of any kind at `key`
    pub fn insert_or_update(
        &self,
        key: &StorageKey,
        data: &DatabaseData,
        originating: Option<usize>,
    ) -> DatabaseResult<bool> {
        match data {
            DatabaseData::Entity(entity) => {
                self.insert_or_update_entity(key, entity, originating)
            }
            DatabaseData::Singleton(singleton) => {
                let values: Vec<ReferenceWithVersion> =
                    singleton.value.iter().cloned().collect();
                self.write_membership(
                    key,
                    DataKind::Singleton,
                    &values,
                    &singleton.schema_hash,
                    singleton.database_version,
                    &singleton.version_map,
                    data,
                    originating,
                )
            }
            DatabaseData::Collection(collection) => self.write_membership(
                key,
                DataKind::Collection,
                &collection.values,
                &collection.schema_hash,
                collection.database_version,
                &collection.version_map,
                data,
                originating,
            ),
        }
    }

    /// Apply an incremental membership mutation to a collection or
    /// singleton key. Gated behind the `database_ops` feature flag.
    pub fn apply_op(
        &self,
        key: &StorageKey,
        op: &DatabaseOp,
        originating: Option<usize>,
    ) -> DatabaseResult<bool> {
        if !self.features.is_database_ops_enabled() {
            return Err(DatabaseError::FeatureDisabled("database_ops".to_string()));
        }

        let (new_version, data) = {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let Some((key_id, kind_col, value_id, stored_version)) =
                self.storage_key_row(&tx, key)?
            else {
                return Ok(false);
            };
            let kind = DataKind::from_column(kind_col).ok_or_else(|| {
                DatabaseError::Internal(format!("unknown data kind {}", kind_col))
            })?;
            if kind == DataKind::Entity {
                return Err(DatabaseError::UnsupportedOperation(
                    "incremental ops apply to collection and singleton keys".to_string(),
                ));
            }
            let collection_id = value_id.ok_or_else(|| {
                DatabaseError::Internal("membership key without collection row".to_string())
            })?;

            let mut version_map = self.read_collection_clock(&tx, collection_id)?;
            version_map.increment(DATABASE_ACTOR_ID);
            let entry_clock = VersionMap::of(DATABASE_ACTOR_ID, version_map.get(DATABASE_ACTOR_ID));

            match op {
                DatabaseOp::AddToCollection(reference) => {
                    if kind == DataKind::Singleton {
                        tx.execute(
                            "DELETE FROM collection_entries WHERE collection_id = ?1",
                            params![collection_id],
                        )?;
                    }
                    let ref_id = self.get_entity_reference_id(&tx, reference)?;
                    tx.execute(
                        "INSERT INTO collection_entries (collection_id, value_id, version_map)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT (collection_id, value_id)
                         DO UPDATE SET version_map = excluded.version_map",
                        params![collection_id, ref_id, serde_json::to_string(&entry_clock)?],
                    )?;
                }
                DatabaseOp::RemoveFromCollection(entity_id) => {
                    tx.execute(
                        "DELETE FROM collection_entries
                         WHERE collection_id = ?1
                           AND value_id IN (SELECT id FROM entity_refs WHERE entity_id = ?2)",
                        params![collection_id, entity_id],
                    )?;
                }
                DatabaseOp::ClearCollection => {
                    tx.execute(
                        "DELETE FROM collection_entries WHERE collection_id = ?1",
                        params![collection_id],
                    )?;
                }
            }

            let new_version = stored_version + 1;
            tx.execute(
                "UPDATE collections SET version_map = ?1 WHERE id = ?2",
                params![serde_json::to_string(&version_map)?, collection_id],
            )?;
            tx.execute(
                "UPDATE storage_keys SET database_version = ?1 WHERE id = ?2",
                params![new_version, key_id],
            )?;
            tx.commit()?;
            // Read the payload under the write lock so the notification
            // matches the version it announces
            (new_version, self.read_data(&conn, key)?)
        };

        counter!("tidepool_db_writes_total").increment(1);
        if let Some(data) = data {
            self.notify_update(key, data, new_version, originating);
        }
        Ok(true)
    }

    /// Physically delete the data at `key`. Inline child keys can only be
    /// deleted through their parent.
    pub fn delete(&self, key: &StorageKey, originating: Option<usize>) -> DatabaseResult<()> {
        let deleted = {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let Some((key_id, kind_col, value_id, _)) = self.storage_key_row(&tx, key)? else {
                return Ok(());
            };
            let kind = DataKind::from_column(kind_col).ok_or_else(|| {
                DatabaseError::Internal(format!("unknown data kind {}", kind_col))
            })?;

            match kind {
                DataKind::Entity => {
                    let inline: i64 = tx.query_row(
                        "SELECT inline FROM entities WHERE storage_key_id = ?1",
                        params![key_id],
                        |row| row.get(0),
                    )?;
                    if inline != 0 {
                        return Err(DatabaseError::UnsupportedOperation(
                            "inline entity keys are deleted through their parent".to_string(),
                        ));
                    }
                    self.clear_entity_fields_tx(&tx, key_id)?;
                    self.delete_inline_children_tx(&tx, key)?;
                    tx.execute(
                        "DELETE FROM entities WHERE storage_key_id = ?1",
                        params![key_id],
                    )?;
                }
                DataKind::Singleton | DataKind::Collection => {
                    if let Some(collection_id) = value_id {
                        tx.execute(
                            "DELETE FROM collection_entries WHERE collection_id = ?1",
                            params![collection_id],
                        )?;
                        tx.execute(
                            "DELETE FROM collections WHERE id = ?1",
                            params![collection_id],
                        )?;
                    }
                }
            }
            tx.execute("DELETE FROM storage_keys WHERE id = ?1", params![key_id])?;
            tx.commit()?;
            true
        };

        if deleted {
            self.notify_delete(key, originating);
        }
        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    /// Read whatever lives at `key`. Tombstoned entities read as `None`.
    pub fn get(&self, key: &StorageKey) -> DatabaseResult<Option<DatabaseData>> {
        let conn = self.conn()?;
        self.read_data(&conn, key)
    }

    /// Typed entity read
    pub fn get_entity(&self, key: &StorageKey) -> DatabaseResult<Option<DatabaseEntity>> {
        match self.get(key)? {
            None => Ok(None),
            Some(DatabaseData::Entity(entity)) => Ok(Some(entity)),
            Some(other) => Err(self.kind_mismatch(key, DataKind::Entity, other.kind())),
        }
    }

    /// Typed collection read
    pub fn get_collection(&self, key: &StorageKey) -> DatabaseResult<Option<DatabaseCollection>> {
        match self.get(key)? {
            None => Ok(None),
            Some(DatabaseData::Collection(collection)) => Ok(Some(collection)),
            Some(other) => Err(self.kind_mismatch(key, DataKind::Collection, other.kind())),
        }
    }

    /// Typed singleton read
    pub fn get_singleton(&self, key: &StorageKey) -> DatabaseResult<Option<DatabaseSingleton>> {
        match self.get(key)? {
            None => Ok(None),
            Some(DatabaseData::Singleton(singleton)) => Ok(Some(singleton)),
            Some(other) => Err(self.kind_mismatch(key, DataKind::Singleton, other.kind())),
        }
    }

    /// Number of live top-level entities
    pub fn get_entities_count(&self) -> DatabaseResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE tombstoned = 0 AND inline = 0",
            [],
            |row| row.get(0),
        )?)
    }

    /// Database size in bytes (page count times page size)
    pub fn get_size(&self) -> DatabaseResult<i64> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }

    /// Drop all data and recreate the schema; the database is immediately
    /// usable afterwards
    pub fn reset(&self) -> DatabaseResult<()> {
        let _guard = self.lock_writes();
        let conn = self.conn()?;
        conn.execute_batch(
            "DROP TABLE IF EXISTS engine_schema_version;
             DROP TABLE IF EXISTS storage_keys;
             DROP TABLE IF EXISTS types;
             DROP TABLE IF EXISTS fields;
             DROP TABLE IF EXISTS entities;
             DROP TABLE IF EXISTS field_values;
             DROP TABLE IF EXISTS collections;
             DROP TABLE IF EXISTS collection_entries;
             DROP TABLE IF EXISTS entity_refs;
             DROP TABLE IF EXISTS text_primitive_values;
             DROP TABLE IF EXISTS number_primitive_values;",
        )?;
        drop(conn);
        migrations::migrate(&self.pool)?;
        self.type_ids.lock().unwrap().clear();
        self.field_rows.lock().unwrap().clear();
        Ok(())
    }

    // ---- notification plumbing --------------------------------------------

    pub(crate) fn notify_update(
        &self,
        key: &StorageKey,
        data: DatabaseData,
        version: i64,
        originating: Option<usize>,
    ) {
        for (id, client) in self.clients.clients_for_key(key) {
            if Some(id) == originating {
                continue;
            }
            let data = data.clone();
            self.notifications.enqueue_and_drain(Box::new(move || {
                client.on_database_update(data, version, originating)
            }));
        }
    }

    pub(crate) fn notify_delete(&self, key: &StorageKey, originating: Option<usize>) {
        for (id, client) in self.clients.clients_for_key(key) {
            if Some(id) == originating {
                continue;
            }
            self.notifications
                .enqueue_and_drain(Box::new(move || client.on_database_delete(originating)));
        }
    }

    // ---- interning --------------------------------------------------------

    /// Intern a schema as a type row, allocating ids upward from
    /// `FIRST_SCHEMA_TYPE_ID`, and intern its field descriptors
    pub(crate) fn get_schema_type_id(
        &self,
        conn: &Connection,
        schema: &Schema,
    ) -> DatabaseResult<i64> {
        if let Some(id) = self.type_ids.lock().unwrap().get(&schema.hash) {
            return Ok(*id);
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM types WHERE name = ?1",
                params![schema.hash],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.type_ids
                    .lock()
                    .unwrap()
                    .insert(schema.hash.clone(), id);
                Ok(id)
            }
            None => {
                let max_id: i64 =
                    conn.query_row("SELECT COALESCE(MAX(id), 0) FROM types", [], |row| {
                        row.get(0)
                    })?;
                let type_id = max_id.max(FIRST_SCHEMA_TYPE_ID - 1) + 1;
                conn.execute(
                    "INSERT INTO types (id, name, is_primitive) VALUES (?1, ?2, 0)",
                    params![type_id, schema.hash],
                )?;
                for (name, field_type) in &schema.singletons {
                    self.insert_field_row(conn, type_id, name, field_type, false)?;
                }
                for (name, field_type) in &schema.collections {
                    self.insert_field_row(conn, type_id, name, field_type, true)?;
                }
                // The row lives inside the caller's transaction and may
                // still roll back; it is cached once a later lookup sees
                // it committed
                Ok(type_id)
            }
        }
    }

    fn insert_field_row(
        &self,
        conn: &Connection,
        type_id: i64,
        name: &str,
        field_type: &FieldType,
        is_collection: bool,
    ) -> DatabaseResult<()> {
        let (kind, value_type_id) = match field_type {
            FieldType::Primitive(p) => (FieldKind::Primitive, p.type_id()),
            FieldType::Reference { schema_hash } => {
                (FieldKind::Reference, self.type_id_for_hash(conn, schema_hash)?)
            }
            FieldType::Inline { schema_hash } => {
                (FieldKind::Inline, self.type_id_for_hash(conn, schema_hash)?)
            }
        };
        conn.execute(
            "INSERT OR IGNORE INTO fields (type_id, name, field_kind, value_type_id, is_collection)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                type_id,
                name,
                kind.to_column(),
                value_type_id,
                is_collection as i64
            ],
        )?;
        Ok(())
    }

    fn type_id_for_hash(&self, conn: &Connection, schema_hash: &str) -> DatabaseResult<i64> {
        let schema = self
            .schemas
            .lookup(schema_hash)
            .ok_or_else(|| DatabaseError::NoSuchSchema(schema_hash.to_string()))?;
        self.get_schema_type_id(conn, &schema)
    }

    /// Field descriptors of a schema type, keyed by field name
    pub(crate) fn fields_for_type(
        &self,
        conn: &Connection,
        type_id: i64,
    ) -> DatabaseResult<BTreeMap<String, FieldRow>> {
        if let Some(rows) = self.field_rows.lock().unwrap().get(&type_id) {
            return Ok(rows.clone());
        }

        let mut stmt = conn.prepare(
            "SELECT id, name, field_kind, value_type_id, is_collection
             FROM fields WHERE type_id = ?1",
        )?;
        let mut rows = BTreeMap::new();
        let mut result = stmt.query(params![type_id])?;
        while let Some(row) = result.next()? {
            let kind_col: i64 = row.get(2)?;
            let kind = FieldKind::from_column(kind_col).ok_or_else(|| {
                DatabaseError::Internal(format!("unknown field kind {}", kind_col))
            })?;
            rows.insert(
                row.get::<_, String>(1)?,
                FieldRow {
                    id: row.get(0)?,
                    kind,
                    value_type_id: row.get(3)?,
                    is_collection: row.get::<_, i64>(4)? != 0,
                },
            );
        }

        self.field_rows
            .lock()
            .unwrap()
            .insert(type_id, rows.clone());
        Ok(rows)
    }

    /// Intern a reference, deduplicated over its full tuple
    pub(crate) fn get_entity_reference_id(
        &self,
        conn: &Connection,
        reference: &RawReference,
    ) -> DatabaseResult<i64> {
        let version_map = match &reference.version_map {
            Some(vm) => serde_json::to_string(vm)?,
            None => String::new(),
        };
        let creation = reference.creation_timestamp_ms.unwrap_or(UNSET_TIMESTAMP);
        let expiration = reference.expiration_timestamp_ms.unwrap_or(UNSET_TIMESTAMP);
        let backing = reference.backing_key.to_string();

        conn.execute(
            "INSERT OR IGNORE INTO entity_refs
                 (entity_id, backing_storage_key, version_map,
                  creation_timestamp, expiration_timestamp, is_hard_reference)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reference.id,
                backing,
                version_map,
                creation,
                expiration,
                reference.is_hard_reference as i64
            ],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM entity_refs
             WHERE entity_id = ?1 AND backing_storage_key = ?2 AND version_map = ?3
               AND creation_timestamp = ?4 AND expiration_timestamp = ?5
               AND is_hard_reference = ?6",
            params![
                reference.id,
                backing,
                version_map,
                creation,
                expiration,
                reference.is_hard_reference as i64
            ],
            |row| row.get(0),
        )?)
    }

    fn get_primitive_value_id(
        &self,
        conn: &Connection,
        value: &PrimitiveValue,
    ) -> DatabaseResult<i64> {
        match value {
            PrimitiveValue::Boolean(b) => Ok(*b as i64),
            PrimitiveValue::Text(t) => {
                conn.execute(
                    "INSERT OR IGNORE INTO text_primitive_values (value) VALUES (?1)",
                    params![t],
                )?;
                Ok(conn.query_row(
                    "SELECT id FROM text_primitive_values WHERE value = ?1",
                    params![t],
                    |row| row.get(0),
                )?)
            }
            PrimitiveValue::Number(n) => {
                conn.execute(
                    "INSERT OR IGNORE INTO number_primitive_values (value) VALUES (?1)",
                    params![n],
                )?;
                Ok(conn.query_row(
                    "SELECT id FROM number_primitive_values WHERE value = ?1",
                    params![n],
                    |row| row.get(0),
                )?)
            }
        }
    }

    // ---- write internals --------------------------------------------------

    fn validate_entity_shape(&self, schema: &Schema, raw: &RawEntity) -> DatabaseResult<()> {
        for (name, value) in &raw.singletons {
            let declared = schema
                .singletons
                .get(name)
                .ok_or_else(|| DatabaseError::UnknownField(name.clone()))?;
            if let Some(value) = value {
                Self::check_field_value(name, declared, value)?;
            }
        }
        for (name, values) in &raw.collections {
            let declared = schema
                .collections
                .get(name)
                .ok_or_else(|| DatabaseError::UnknownField(name.clone()))?;
            for value in values {
                Self::check_field_value(name, declared, value)?;
            }
        }
        Ok(())
    }

    fn check_field_value(
        name: &str,
        declared: &FieldType,
        value: &FieldValue,
    ) -> DatabaseResult<()> {
        let matches = match (declared, value) {
            (FieldType::Primitive(p), FieldValue::Primitive(v)) => p.name() == v.type_name(),
            (FieldType::Reference { .. }, FieldValue::Reference(_)) => true,
            (FieldType::Inline { .. }, FieldValue::Entity(_)) => true,
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(DatabaseError::FieldMismatch {
                field: name.to_string(),
                expected: declared.describe(),
                actual: value.kind_name(),
            })
        }
    }

    fn storage_key_row(
        &self,
        conn: &Connection,
        key: &StorageKey,
    ) -> DatabaseResult<Option<(i64, i64, Option<i64>, i64)>> {
        Ok(conn
            .query_row(
                "SELECT id, data_kind, value_id, database_version
                 FROM storage_keys WHERE storage_key = ?1",
                params![key.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?)
    }

    fn write_entity_tx(
        &self,
        tx: &Connection,
        key: &StorageKey,
        entity: &DatabaseEntity,
        schema: &Schema,
        inline: bool,
    ) -> DatabaseResult<bool> {
        // Version check before interning: a rejected write must leave no
        // trace, and interned rows would roll back with the transaction
        let key_id = match self.storage_key_row(tx, key)? {
            Some((id, _, _, stored_version)) => {
                // Inline children are rewritten wholesale with the parent
                if !inline && entity.database_version != stored_version + 1 {
                    return Ok(false);
                }
                tx.execute(
                    "UPDATE storage_keys SET database_version = ?1 WHERE id = ?2",
                    params![entity.database_version, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO storage_keys (storage_key, data_kind, database_version)
                     VALUES (?1, ?2, ?3)",
                    params![
                        key.to_string(),
                        DataKind::Entity.to_column(),
                        entity.database_version
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        let type_id = self.get_schema_type_id(tx, schema)?;

        tx.execute(
            "INSERT INTO entities
                 (storage_key_id, entity_id, type_id, creation_timestamp,
                  expiration_timestamp, version_map, orphan, tombstoned, inline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)
             ON CONFLICT (storage_key_id) DO UPDATE SET
                 entity_id = excluded.entity_id,
                 type_id = excluded.type_id,
                 creation_timestamp = excluded.creation_timestamp,
                 expiration_timestamp = excluded.expiration_timestamp,
                 version_map = excluded.version_map,
                 orphan = 0,
                 tombstoned = 0",
            params![
                key_id,
                entity.raw.id,
                type_id,
                entity.raw.creation_timestamp_ms,
                entity.raw.expiration_timestamp_ms,
                serde_json::to_string(&entity.version_map)?,
                inline as i64
            ],
        )?;

        // Field state is rewritten wholesale, inline children included
        self.clear_entity_fields_tx(tx, key_id)?;
        self.delete_inline_children_tx(tx, key)?;

        let field_rows = self.fields_for_type(tx, type_id)?;

        for (name, value) in &entity.raw.singletons {
            let row = field_rows
                .get(name)
                .ok_or_else(|| DatabaseError::UnknownField(name.clone()))?;
            let value_id = match value {
                None => None,
                Some(value) => {
                    Some(self.write_single_value_tx(tx, key, name, row, value, entity)?)
                }
            };
            tx.execute(
                "INSERT INTO field_values (entity_storage_key_id, field_id, value_id)
                 VALUES (?1, ?2, ?3)",
                params![key_id, row.id, value_id],
            )?;
        }

        for (name, values) in &entity.raw.collections {
            let row = field_rows
                .get(name)
                .ok_or_else(|| DatabaseError::UnknownField(name.clone()))?;
            let entry_kind = match row.kind {
                FieldKind::Primitive => 0_i64,
                _ => 1_i64,
            };
            tx.execute(
                "INSERT INTO collections (entry_type_id, entry_kind, version_map)
                 VALUES (?1, ?2, ?3)",
                params![
                    row.value_type_id,
                    entry_kind,
                    serde_json::to_string(&entity.version_map)?
                ],
            )?;
            let collection_id = tx.last_insert_rowid();
            for value in values {
                let value_id = self.write_collection_value_tx(tx, key, name, row, value, entity)?;
                tx.execute(
                    "INSERT OR IGNORE INTO collection_entries (collection_id, value_id, version_map)
                     VALUES (?1, ?2, ?3)",
                    params![
                        collection_id,
                        value_id,
                        serde_json::to_string(&entity.version_map)?
                    ],
                )?;
            }
            tx.execute(
                "INSERT INTO field_values (entity_storage_key_id, field_id, value_id)
                 VALUES (?1, ?2, ?3)",
                params![key_id, row.id, collection_id],
            )?;
        }

        Ok(true)
    }

    /// Persist a singleton field value; inline children land at
    /// `<parent>/<field>`
    fn write_single_value_tx(
        &self,
        tx: &Connection,
        key: &StorageKey,
        field_name: &str,
        row: &FieldRow,
        value: &FieldValue,
        parent: &DatabaseEntity,
    ) -> DatabaseResult<i64> {
        match (row.kind, value) {
            (FieldKind::Primitive, FieldValue::Primitive(p)) => {
                self.get_primitive_value_id(tx, p)
            }
            (FieldKind::Reference, FieldValue::Reference(r)) => {
                self.get_entity_reference_id(tx, r)
            }
            (FieldKind::Inline, FieldValue::Entity(child)) => {
                self.write_inline_child_tx(tx, &key.child(field_name), row, child, parent)
            }
            _ => Err(DatabaseError::Internal(format!(
                "field '{}' value shape escaped validation",
                field_name
            ))),
        }
    }

    /// Persist one collection entry; inline children land at
    /// `<parent>/<field>/<id>`
    fn write_collection_value_tx(
        &self,
        tx: &Connection,
        key: &StorageKey,
        field_name: &str,
        row: &FieldRow,
        value: &FieldValue,
        parent: &DatabaseEntity,
    ) -> DatabaseResult<i64> {
        match (row.kind, value) {
            (FieldKind::Inline, FieldValue::Entity(child)) => {
                let child_key = key.child(field_name).child(&child.id);
                self.write_inline_child_tx(tx, &child_key, row, child, parent)
            }
            _ => self.write_single_value_tx(tx, key, field_name, row, value, parent),
        }
    }

    /// Returns the child's storage key id, which doubles as the value id
    /// for inline fields
    fn write_inline_child_tx(
        &self,
        tx: &Connection,
        child_key: &StorageKey,
        row: &FieldRow,
        child: &RawEntity,
        parent: &DatabaseEntity,
    ) -> DatabaseResult<i64> {
        // The field descriptor's value type is the child's interned schema
        let schema_hash: String = tx.query_row(
            "SELECT name FROM types WHERE id = ?1",
            params![row.value_type_id],
            |r| r.get(0),
        )?;
        let schema = self
            .schemas
            .lookup(&schema_hash)
            .ok_or_else(|| DatabaseError::NoSuchSchema(schema_hash.clone()))?;
        self.validate_entity_shape(&schema, child)?;
        let child_entity = DatabaseEntity {
            raw: child.clone(),
            schema_hash,
            database_version: 1,
            version_map: parent.version_map.clone(),
        };
        self.write_entity_tx(tx, child_key, &child_entity, &schema, true)?;
        match self.storage_key_row(tx, child_key)? {
            Some((id, _, _, _)) => Ok(id),
            None => Err(DatabaseError::Internal(
                "inline child row vanished mid-write".to_string(),
            )),
        }
    }

    /// Drop a stored entity's field values and any collections they own
    pub(crate) fn clear_entity_fields_tx(
        &self,
        tx: &Connection,
        key_id: i64,
    ) -> DatabaseResult<()> {
        tx.execute(
            "DELETE FROM collection_entries WHERE collection_id IN (
                 SELECT fv.value_id FROM field_values fv
                 JOIN fields f ON fv.field_id = f.id
                 WHERE fv.entity_storage_key_id = ?1
                   AND f.is_collection = 1 AND fv.value_id IS NOT NULL)",
            params![key_id],
        )?;
        tx.execute(
            "DELETE FROM collections WHERE id IN (
                 SELECT fv.value_id FROM field_values fv
                 JOIN fields f ON fv.field_id = f.id
                 WHERE fv.entity_storage_key_id = ?1
                   AND f.is_collection = 1 AND fv.value_id IS NOT NULL)",
            params![key_id],
        )?;
        tx.execute(
            "DELETE FROM field_values WHERE entity_storage_key_id = ?1",
            params![key_id],
        )?;
        Ok(())
    }

    /// Remove every inline child stored under `key` (all descendants)
    pub(crate) fn delete_inline_children_tx(
        &self,
        tx: &Connection,
        key: &StorageKey,
    ) -> DatabaseResult<()> {
        let pattern = format!("{}/%", key);
        let child_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT s.id FROM storage_keys s
                 JOIN entities e ON e.storage_key_id = s.id
                 WHERE s.storage_key LIKE ?1 AND e.inline = 1",
            )?;
            let rows = stmt.query_map(params![pattern], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };
        for child_id in child_ids {
            self.clear_entity_fields_tx(tx, child_id)?;
            tx.execute(
                "DELETE FROM entities WHERE storage_key_id = ?1",
                params![child_id],
            )?;
            tx.execute("DELETE FROM storage_keys WHERE id = ?1", params![child_id])?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_membership(
        &self,
        key: &StorageKey,
        kind: DataKind,
        values: &[ReferenceWithVersion],
        schema_hash: &str,
        database_version: i64,
        version_map: &VersionMap,
        notify_data: &DatabaseData,
        originating: Option<usize>,
    ) -> DatabaseResult<bool> {
        let schema = self
            .schemas
            .lookup(schema_hash)
            .ok_or_else(|| DatabaseError::NoSuchSchema(schema_hash.to_string()))?;

        {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let collection_id = match self.storage_key_row(&tx, key)? {
                Some((key_id, _, value_id, stored_version)) => {
                    if database_version != stored_version + 1 {
                        counter!("tidepool_db_writes_rejected_total").increment(1);
                        debug!(key = %key, version = database_version, "membership write lost version race");
                        return Ok(false);
                    }
                    let collection_id = value_id.ok_or_else(|| {
                        DatabaseError::Internal(
                            "membership key without collection row".to_string(),
                        )
                    })?;
                    tx.execute(
                        "UPDATE storage_keys SET database_version = ?1 WHERE id = ?2",
                        params![database_version, key_id],
                    )?;
                    tx.execute(
                        "UPDATE collections SET version_map = ?1 WHERE id = ?2",
                        params![serde_json::to_string(version_map)?, collection_id],
                    )?;
                    collection_id
                }
                None => {
                    let entry_type_id = self.get_schema_type_id(&tx, &schema)?;
                    tx.execute(
                        "INSERT INTO collections (entry_type_id, entry_kind, version_map)
                         VALUES (?1, 1, ?2)",
                        params![entry_type_id, serde_json::to_string(version_map)?],
                    )?;
                    let collection_id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO storage_keys
                             (storage_key, data_kind, value_id, database_version)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            key.to_string(),
                            kind.to_column(),
                            collection_id,
                            database_version
                        ],
                    )?;
                    collection_id
                }
            };

            // Membership diff: stale entries go away, live ones get their
            // entry clock refreshed. Unreferenced entity_refs rows stay
            // behind for the garbage collector.
            let mut new_ids = Vec::with_capacity(values.len());
            for value in values {
                new_ids.push((
                    self.get_entity_reference_id(&tx, &value.reference)?,
                    serde_json::to_string(&value.version_map)?,
                ));
            }

            let existing_ids: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT value_id FROM collection_entries WHERE collection_id = ?1",
                )?;
                let rows = stmt.query_map(params![collection_id], |row| row.get(0))?;
                rows.collect::<Result<Vec<i64>, _>>()?
            };
            for stale in existing_ids
                .iter()
                .filter(|id| !new_ids.iter().any(|(new_id, _)| new_id == *id))
            {
                tx.execute(
                    "DELETE FROM collection_entries WHERE collection_id = ?1 AND value_id = ?2",
                    params![collection_id, stale],
                )?;
            }
            for (value_id, entry_clock) in &new_ids {
                tx.execute(
                    "INSERT INTO collection_entries (collection_id, value_id, version_map)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (collection_id, value_id)
                     DO UPDATE SET version_map = excluded.version_map",
                    params![collection_id, value_id, entry_clock],
                )?;
            }

            tx.commit()?;
        }

        counter!("tidepool_db_writes_total").increment(1);
        self.notify_update(key, notify_data.clone(), database_version, originating);
        Ok(true)
    }

    // ---- read internals ---------------------------------------------------

    fn kind_mismatch(&self, key: &StorageKey, expected: DataKind, actual: DataKind) -> DatabaseError {
        DatabaseError::UnexpectedKind {
            key: key.to_string(),
            expected: expected.as_str().to_string(),
            actual: actual.as_str().to_string(),
        }
    }

    fn read_collection_clock(
        &self,
        conn: &Connection,
        collection_id: i64,
    ) -> DatabaseResult<VersionMap> {
        let raw: String = conn.query_row(
            "SELECT version_map FROM collections WHERE id = ?1",
            params![collection_id],
            |row| row.get(0),
        )?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn read_data(
        &self,
        conn: &Connection,
        key: &StorageKey,
    ) -> DatabaseResult<Option<DatabaseData>> {
        let Some((key_id, kind_col, value_id, database_version)) =
            self.storage_key_row(conn, key)?
        else {
            return Ok(None);
        };
        let kind = DataKind::from_column(kind_col)
            .ok_or_else(|| DatabaseError::Internal(format!("unknown data kind {}", kind_col)))?;

        match kind {
            DataKind::Entity => Ok(self
                .read_entity_data(conn, key, key_id, database_version)?
                .map(DatabaseData::Entity)),
            DataKind::Singleton | DataKind::Collection => {
                let collection_id = value_id.ok_or_else(|| {
                    DatabaseError::Internal("membership key without collection row".to_string())
                })?;
                let version_map = self.read_collection_clock(conn, collection_id)?;
                let schema_hash = self.schema_hash_for_collection(conn, collection_id)?;
                let values = self.read_membership(conn, collection_id)?;
                if kind == DataKind::Collection {
                    Ok(Some(DatabaseData::Collection(DatabaseCollection {
                        values,
                        schema_hash,
                        database_version,
                        version_map,
                    })))
                } else {
                    // Entries are ordered by reference id; the first one is
                    // the deterministic winner when concurrency left extras
                    Ok(Some(DatabaseData::Singleton(DatabaseSingleton {
                        value: values.into_iter().next(),
                        schema_hash,
                        database_version,
                        version_map,
                    })))
                }
            }
        }
    }

    fn schema_hash_for_collection(
        &self,
        conn: &Connection,
        collection_id: i64,
    ) -> DatabaseResult<String> {
        Ok(conn.query_row(
            "SELECT t.name FROM collections c JOIN types t ON t.id = c.entry_type_id
             WHERE c.id = ?1",
            params![collection_id],
            |row| row.get(0),
        )?)
    }

    fn read_membership(
        &self,
        conn: &Connection,
        collection_id: i64,
    ) -> DatabaseResult<Vec<ReferenceWithVersion>> {
        let entries: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT value_id, version_map FROM collection_entries
                 WHERE collection_id = ?1",
            )?;
            let rows =
                stmt.query_map(params![collection_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut values = Vec::with_capacity(entries.len());
        for (ref_id, entry_clock) in entries {
            values.push(ReferenceWithVersion {
                reference: self.read_reference(conn, ref_id)?,
                version_map: serde_json::from_str(&entry_clock)?,
            });
        }
        values.sort_by(|a, b| a.reference.id.cmp(&b.reference.id));
        Ok(values)
    }

    fn read_reference(&self, conn: &Connection, ref_id: i64) -> DatabaseResult<RawReference> {
        let (entity_id, backing, version_map, creation, expiration, hard): (
            String,
            String,
            String,
            i64,
            i64,
            i64,
        ) = conn.query_row(
            "SELECT entity_id, backing_storage_key, version_map,
                    creation_timestamp, expiration_timestamp, is_hard_reference
             FROM entity_refs WHERE id = ?1",
            params![ref_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        Ok(RawReference {
            id: entity_id,
            backing_key: StorageKey::parse(&backing)?,
            version_map: if version_map.is_empty() {
                None
            } else {
                Some(serde_json::from_str(&version_map)?)
            },
            creation_timestamp_ms: (creation != UNSET_TIMESTAMP).then_some(creation),
            expiration_timestamp_ms: (expiration != UNSET_TIMESTAMP).then_some(expiration),
            is_hard_reference: hard != 0,
        })
    }

    fn read_entity_data(
        &self,
        conn: &Connection,
        key: &StorageKey,
        key_id: i64,
        database_version: i64,
    ) -> DatabaseResult<Option<DatabaseEntity>> {
        let row: Option<(String, i64, i64, i64, String, i64)> = conn
            .query_row(
                "SELECT entity_id, type_id, creation_timestamp, expiration_timestamp,
                        version_map, tombstoned
                 FROM entities WHERE storage_key_id = ?1",
                params![key_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((entity_id, type_id, creation, expiration, version_map, tombstoned)) = row
        else {
            return Ok(None);
        };
        if tombstoned != 0 {
            return Ok(None);
        }

        let schema_hash: String = conn.query_row(
            "SELECT name FROM types WHERE id = ?1",
            params![type_id],
            |row| row.get(0),
        )?;

        let mut raw = RawEntity::new(&entity_id);
        raw.creation_timestamp_ms = creation;
        raw.expiration_timestamp_ms = expiration;

        // Stored fields first: legacy fields removed from the current
        // schema still surface their stored values
        let stored: Vec<(String, i64, i64, bool, Option<i64>)> = {
            let mut stmt = conn.prepare(
                "SELECT f.name, f.field_kind, f.value_type_id, f.is_collection, fv.value_id
                 FROM field_values fv JOIN fields f ON fv.field_id = f.id
                 WHERE fv.entity_storage_key_id = ?1",
            )?;
            let rows = stmt.query_map(params![key_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get::<_, i64>(3)? != 0,
                    row.get(4)?,
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for (name, kind_col, value_type_id, is_collection, value_id) in stored {
            let kind = FieldKind::from_column(kind_col).ok_or_else(|| {
                DatabaseError::Internal(format!("unknown field kind {}", kind_col))
            })?;
            if is_collection {
                let collection_id = value_id.ok_or_else(|| {
                    DatabaseError::Internal("collection field without a collection".to_string())
                })?;
                let values =
                    self.read_field_collection(conn, key, collection_id, kind, value_type_id)?;
                raw.collections.insert(name, values);
            } else {
                let value = match value_id {
                    None => None,
                    Some(id) => Some(self.decode_value(conn, kind, value_type_id, id)?),
                };
                raw.singletons.insert(name, value);
            }
        }

        // Fields added to the schema after this entity was written read as
        // null / empty
        if let Some(schema) = self.schemas.lookup(&schema_hash) {
            for name in schema.singletons.keys() {
                raw.singletons.entry(name.clone()).or_insert(None);
            }
            for name in schema.collections.keys() {
                raw.collections.entry(name.clone()).or_default();
            }
        }

        Ok(Some(DatabaseEntity {
            raw,
            schema_hash,
            database_version,
            version_map: serde_json::from_str(&version_map)?,
        }))
    }

    fn read_field_collection(
        &self,
        conn: &Connection,
        _key: &StorageKey,
        collection_id: i64,
        kind: FieldKind,
        value_type_id: i64,
    ) -> DatabaseResult<std::collections::BTreeSet<FieldValue>> {
        let entry_ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT value_id FROM collection_entries WHERE collection_id = ?1",
            )?;
            let rows = stmt.query_map(params![collection_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut values = std::collections::BTreeSet::new();
        for value_id in entry_ids {
            values.insert(self.decode_value(conn, kind, value_type_id, value_id)?);
        }
        Ok(values)
    }

    fn decode_value(
        &self,
        conn: &Connection,
        kind: FieldKind,
        value_type_id: i64,
        value_id: i64,
    ) -> DatabaseResult<FieldValue> {
        match kind {
            FieldKind::Primitive => match value_type_id {
                1 => Ok(FieldValue::boolean(value_id != 0)),
                2 => {
                    let n: f64 = conn.query_row(
                        "SELECT value FROM number_primitive_values WHERE id = ?1",
                        params![value_id],
                        |row| row.get(0),
                    )?;
                    Ok(FieldValue::number(n))
                }
                3 => {
                    let t: String = conn.query_row(
                        "SELECT value FROM text_primitive_values WHERE id = ?1",
                        params![value_id],
                        |row| row.get(0),
                    )?;
                    Ok(FieldValue::text(&t))
                }
                other => Err(DatabaseError::Internal(format!(
                    "unknown primitive type id {}",
                    other
                ))),
            },
            FieldKind::Reference => {
                Ok(FieldValue::Reference(self.read_reference(conn, value_id)?))
            }
            FieldKind::Inline => {
                // The value id of an inline field is the child's storage
                // key row id
                let (child_key, child_version): (String, i64) = conn.query_row(
                    "SELECT storage_key, database_version FROM storage_keys WHERE id = ?1",
                    params![value_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let child_key = StorageKey::parse(&child_key)?;
                let child = self
                    .read_entity_data(conn, &child_key, value_id, child_version)?
                    .ok_or_else(|| {
                        DatabaseError::Internal("inline child missing at read".to_string())
                    })?;
                Ok(FieldValue::Entity(Box::new(child.raw)))
            }
        }
    }
}
