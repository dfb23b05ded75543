/*
    driver.rs - Storage driver over the database engine

    A driver owns one container key: full snapshots go down through
    `send`, incremental mutations through `apply_ops`, and committed
    changes come back up through the registered receiver. The driver is
    itself a database client of its container key; self-originated
    writes never echo back, and the token changes whenever another
    writer touches the container.
*/

use super::bridging::{apply_bridging_op, BridgingOperation};
use super::convert::{crdt_to_database, database_to_crdt, CrdtData};
use crate::core_database::client::DatabaseClient;
use crate::core_database::data::{DataKind, DatabaseData};
use crate::core_database::database::Database;
use crate::core_database::errors::DatabaseResult;
use crate::core_data::storage_key::StorageKey;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Upstream change callback: committed data (or `None` on delete) plus
/// the database version it committed at
pub type DriverReceiver = Box<dyn Fn(Option<CrdtData>, i64) + Send + Sync>;

/// Storage driver owned by a store in reference mode
pub trait Driver: Send + Sync {
    /// Install the upstream callback; the current committed state is
    /// delivered immediately when present
    fn register_receiver(&self, receiver: DriverReceiver) -> DatabaseResult<()>;

    /// Write a full snapshot; `false` when the version check loses
    fn send(&self, data: &CrdtData, version: i64) -> DatabaseResult<bool>;

    /// Apply incremental mutations in order; `false` when any loses
    fn apply_ops(&self, ops: &[BridgingOperation]) -> DatabaseResult<bool>;

    /// Opaque token, re-issued on every externally observed change
    fn token(&self) -> String;

    /// Detach from the database
    fn close(&self);
}

fn new_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

struct DriverInner {
    database: Arc<Database>,
    container_key: StorageKey,
    backing_key: StorageKey,
    schema_hash: String,
    kind: DataKind,
    receiver: Mutex<Option<DriverReceiver>>,
    token: Mutex<String>,
    client_id: Mutex<Option<usize>>,
}

/// `Driver` implementation backed by a [`Database`]
pub struct DatabaseDriver {
    inner: Arc<DriverInner>,
}

/// The driver's ear on the database; holds the inner state weakly so a
/// dropped driver stops receiving
struct DriverClient {
    inner: Weak<DriverInner>,
}

impl DatabaseClient for DriverClient {
    fn storage_key(&self) -> StorageKey {
        match self.inner.upgrade() {
            Some(inner) => inner.container_key.clone(),
            None => StorageKey::new("closed", "closed"),
        }
    }

    fn on_database_update(
        &self,
        data: DatabaseData,
        version: i64,
        originating_client: Option<usize>,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        // The database already suppresses the echo; the id check guards
        // against a client re-registered under the same receiver
        if originating_client.is_some() && originating_client == *inner.client_id.lock().unwrap() {
            return;
        }
        *inner.token.lock().unwrap() = new_token();
        let receiver = inner.receiver.lock().unwrap();
        if let Some(receiver) = receiver.as_ref() {
            receiver(Some(database_to_crdt(&data)), version);
        }
    }

    fn on_database_delete(&self, originating_client: Option<usize>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if originating_client.is_some() && originating_client == *inner.client_id.lock().unwrap() {
            return;
        }
        *inner.token.lock().unwrap() = new_token();
        let receiver = inner.receiver.lock().unwrap();
        if let Some(receiver) = receiver.as_ref() {
            receiver(None, 0);
        }
    }
}

impl DatabaseDriver {
    /// Attach a driver to `container_key`, with entity bodies living in
    /// `backing_key`
    pub fn new(
        database: Arc<Database>,
        container_key: StorageKey,
        backing_key: StorageKey,
        schema_hash: &str,
        kind: DataKind,
    ) -> Self {
        let inner = Arc::new(DriverInner {
            database: Arc::clone(&database),
            container_key,
            backing_key,
            schema_hash: schema_hash.to_string(),
            kind,
            receiver: Mutex::new(None),
            token: Mutex::new(new_token()),
            client_id: Mutex::new(None),
        });
        let client_id = database.add_client(Arc::new(DriverClient {
            inner: Arc::downgrade(&inner),
        }));
        *inner.client_id.lock().unwrap() = Some(client_id);
        debug!(key = %inner.container_key, client_id, "database driver attached");
        DatabaseDriver { inner }
    }

    fn client_id(&self) -> Option<usize> {
        *self.inner.client_id.lock().unwrap()
    }
}

impl Driver for DatabaseDriver {
    fn register_receiver(&self, receiver: DriverReceiver) -> DatabaseResult<()> {
        let existing = self.inner.database.get(&self.inner.container_key)?;
        if let Some(data) = &existing {
            receiver(Some(database_to_crdt(data)), data.database_version());
        }
        *self.inner.receiver.lock().unwrap() = Some(receiver);
        Ok(())
    }

    fn send(&self, data: &CrdtData, version: i64) -> DatabaseResult<bool> {
        let stored = crdt_to_database(data, &self.inner.schema_hash, version);
        self.inner
            .database
            .insert_or_update(&self.inner.container_key, &stored, self.client_id())
    }

    fn apply_ops(&self, ops: &[BridgingOperation]) -> DatabaseResult<bool> {
        let originating = self.client_id();
        for op in ops {
            let applied = apply_bridging_op(
                &self.inner.database,
                &self.inner.container_key,
                &self.inner.backing_key,
                &self.inner.schema_hash,
                self.inner.kind,
                op,
                originating,
            )?;
            if !applied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn token(&self) -> String {
        self.inner.token.lock().unwrap().clone()
    }

    fn close(&self) {
        if let Some(id) = self.inner.client_id.lock().unwrap().take() {
            self.inner.database.remove_client(id);
        }
    }
}

impl Drop for DatabaseDriver {
    fn drop(&mut self) {
        self.close();
    }
}
