/*
    client.rs - Database client registry and notification dispatch

    Clients subscribe to a storage key and receive update/delete callbacks
    after the originating write has committed. Registration ids start at 1
    and are never reused; iteration copies the registry snapshot so a
    callback may re-enter and add or remove clients. Notifications drain
    through an ordered queue off the write path.
*/

use super::data::DatabaseData;
use crate::core_data::storage_key::StorageKey;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Receiver of post-commit change notifications for one storage key
pub trait DatabaseClient: Send + Sync {
    /// The key this client watches
    fn storage_key(&self) -> StorageKey;

    /// New data committed at the key
    fn on_database_update(
        &self,
        data: DatabaseData,
        version: i64,
        originating_client: Option<usize>,
    );

    /// The key's data was deleted or tombstoned
    fn on_database_delete(&self, originating_client: Option<usize>);

    /// The database lost its last client
    fn on_database_close(&self) {}
}

struct RegistryInner {
    next_id: usize,
    clients: BTreeMap<usize, Arc<dyn DatabaseClient>>,
    close_fired: bool,
}

/// Id-keyed client registry
pub struct ClientRegistry {
    inner: Mutex<RegistryInner>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            inner: Mutex::new(RegistryInner {
                next_id: 1,
                clients: BTreeMap::new(),
                close_fired: false,
            }),
        }
    }

    /// Register a client and hand back its id. Ids start at 1 and are
    /// never reused.
    pub fn add_client(&self, client: Arc<dyn DatabaseClient>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.clients.insert(id, client);
        id
    }

    /// Remove a client. Removing the last registered client fires
    /// `on_database_close` on it, once per database.
    pub fn remove_client(&self, id: usize) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.clients.remove(&id);
            if removed.is_some() && inner.clients.is_empty() && !inner.close_fired {
                inner.close_fired = true;
                removed
            } else {
                None
            }
        };
        // Fired outside the lock so the callback may re-enter
        if let Some(client) = removed {
            client.on_database_close();
        }
    }

    /// Snapshot of the clients watching `key`
    pub fn clients_for_key(&self, key: &StorageKey) -> Vec<(usize, Arc<dyn DatabaseClient>)> {
        self.inner
            .lock()
            .unwrap()
            .clients
            .iter()
            .filter(|(_, client)| &client.storage_key() == key)
            .map(|(id, client)| (*id, Arc::clone(client)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().clients.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Ordered post-commit notification queue. Jobs enqueued while a drain is
/// in progress are picked up by the active drainer, preserving order.
pub struct NotificationQueue {
    queue: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
}

impl NotificationQueue {
    pub fn new() -> Self {
        NotificationQueue {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Enqueue a job and drain the queue unless another thread already is
    pub fn enqueue_and_drain(&self, job: Job) {
        self.queue.lock().unwrap().push_back(job);
        if self.draining.swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            loop {
                let next = self.queue.lock().unwrap().pop_front();
                match next {
                    Some(job) => job(),
                    None => break,
                }
            }
            self.draining.store(false, Ordering::Release);
            // A job enqueued between the empty check and the flag reset
            // would otherwise wait for the next drain
            if self.queue.lock().unwrap().is_empty() || self.draining.swap(true, Ordering::Acquire)
            {
                break;
            }
        }
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new()
    }
}
