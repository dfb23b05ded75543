/*
    gc.rs - Garbage collection and TTL expiry

    Reachability is computed from live membership entries and live
    reference-typed field values: every entity_refs row still pointed at
    by one of those keeps the entity at `backing/<id>` alive. Collection
    happens in two passes per entity: an unreachable entity is first
    marked orphan, and tombstoned only if it is still unreachable on a
    later pass; re-referencing in between clears the mark. Each pass also
    reclaims unreferenced interned references and primitives, so a chain
    of garbage crosses one pass per link.
*/

use super::database::Database;
use super::errors::DatabaseResult;
use crate::core_data::storage_key::StorageKey;
use metrics::counter;
use rusqlite::{params, Connection};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Outcome of one garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Entities newly marked orphan this pass
    pub newly_orphaned: usize,
    /// Entities tombstoned this pass
    pub collected: usize,
    /// Interned reference rows dropped this pass
    pub refs_removed: usize,
    /// Interned primitive values dropped this pass
    pub primitives_removed: usize,
}

/// Reference rows reachable from stored data: membership entries of
/// reference-kind collections plus reference-typed singleton field slots
const LIVE_REF_IDS: &str = "
    SELECT ce.value_id FROM collection_entries ce
    JOIN collections c ON ce.collection_id = c.id
    WHERE c.entry_kind = 1
    UNION
    SELECT fv.value_id FROM field_values fv
    JOIN fields f ON fv.field_id = f.id
    WHERE f.field_kind = 1 AND f.is_collection = 0 AND fv.value_id IS NOT NULL";

fn live_keys_sql() -> String {
    format!(
        "SELECT backing_storage_key || '/' || entity_id FROM entity_refs
         WHERE id IN ({})",
        LIVE_REF_IDS
    )
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Database {
    /// Run one garbage collection pass. An entity is tombstoned only
    /// after surviving a full pass as an orphan.
    pub fn run_garbage_collection(&self) -> DatabaseResult<GcStats> {
        if !self.features().is_garbage_collection_enabled() {
            debug!("garbage collection is disabled, skipping pass");
            return Ok(GcStats::default());
        }

        let mut stats = GcStats::default();
        let mut tombstoned_keys = Vec::new();
        {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let live_keys = live_keys_sql();

            // Re-referenced orphans get their mark cleared
            tx.execute(
                &format!(
                    "UPDATE entities SET orphan = 0
                     WHERE orphan = 1 AND storage_key_id IN (
                         SELECT id FROM storage_keys WHERE storage_key IN ({}))",
                    live_keys
                ),
                [],
            )?;

            // Entities orphaned on an earlier pass and still unreachable
            let doomed: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT s.id, s.storage_key FROM storage_keys s
                     JOIN entities e ON e.storage_key_id = s.id
                     WHERE e.inline = 0 AND e.tombstoned = 0 AND e.orphan = 1
                       AND s.storage_key NOT IN ({})",
                    live_keys
                ))?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for (key_id, raw_key) in doomed {
                let key = StorageKey::parse(&raw_key)?;
                self.tombstone_entity_tx(&tx, key_id, &key)?;
                tombstoned_keys.push(key);
                stats.collected += 1;
            }

            // Freshly unreachable entities only get the mark
            stats.newly_orphaned = tx.execute(
                &format!(
                    "UPDATE entities SET orphan = 1
                     WHERE inline = 0 AND tombstoned = 0 AND orphan = 0
                       AND storage_key_id IN (
                         SELECT id FROM storage_keys
                         WHERE data_kind = 0 AND storage_key NOT IN ({}))",
                    live_keys
                ),
                [],
            )?;

            stats.refs_removed = tx.execute(
                &format!("DELETE FROM entity_refs WHERE id NOT IN ({})", LIVE_REF_IDS),
                [],
            )?;
            stats.primitives_removed = self.reclaim_primitives_tx(&tx)?;

            tx.commit()?;
        }

        for key in &tombstoned_keys {
            self.notify_delete(key, None);
        }
        counter!("tidepool_gc_collected_total").increment(stats.collected as u64);
        info!(
            orphaned = stats.newly_orphaned,
            collected = stats.collected,
            refs_removed = stats.refs_removed,
            primitives_removed = stats.primitives_removed,
            "garbage collection pass complete"
        );
        Ok(stats)
    }

    /// Immediately tombstone entities and drop membership entries whose
    /// expiration timestamp has passed. Idempotent.
    pub fn remove_expired_entities(&self) -> DatabaseResult<usize> {
        if !self.features().is_ttl_expiry_enabled() {
            debug!("TTL expiry is disabled, skipping sweep");
            return Ok(0);
        }

        let now = now_ms();
        let mut removed = 0;
        let mut tombstoned_keys = Vec::new();
        let mut touched_containers = Vec::new();
        {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let expired: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT s.id, s.storage_key FROM storage_keys s
                     JOIN entities e ON e.storage_key_id = s.id
                     WHERE e.inline = 0 AND e.tombstoned = 0
                       AND e.expiration_timestamp != -1 AND e.expiration_timestamp <= ?1",
                )?;
                let rows = stmt.query_map(params![now], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for (key_id, raw_key) in expired {
                let key = StorageKey::parse(&raw_key)?;
                self.tombstone_entity_tx(&tx, key_id, &key)?;
                tombstoned_keys.push(key);
                removed += 1;
            }

            // Containers holding expired references lose those entries
            let containers: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT s.storage_key FROM storage_keys s
                     JOIN collection_entries ce ON ce.collection_id = s.value_id
                     JOIN entity_refs r ON r.id = ce.value_id
                     WHERE s.data_kind IN (1, 2)
                       AND r.expiration_timestamp != -1 AND r.expiration_timestamp <= ?1",
                )?;
                let rows = stmt.query_map(params![now], |row| row.get(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            removed += tx.execute(
                "DELETE FROM collection_entries
                 WHERE value_id IN (
                     SELECT id FROM entity_refs
                     WHERE expiration_timestamp != -1 AND expiration_timestamp <= ?1)",
                params![now],
            )?;
            for raw_key in containers {
                touched_containers.push(StorageKey::parse(&raw_key)?);
            }

            tx.commit()?;
        }

        for key in &tombstoned_keys {
            self.notify_delete(key, None);
        }
        for key in &touched_containers {
            if let Some(data) = self.get(key)? {
                let version = data.database_version();
                self.notify_update(key, data, version, None);
            }
        }
        counter!("tidepool_expired_removed_total").increment(removed as u64);
        if removed > 0 {
            info!(removed, "expired data swept");
        }
        Ok(removed)
    }

    /// Tombstone every entity holding a hard reference into the given
    /// backing store
    pub fn remove_entities_hard_referencing(
        &self,
        backing_key: &StorageKey,
    ) -> DatabaseResult<usize> {
        let mut tombstoned_keys = Vec::new();
        {
            let _guard = self.lock_writes();
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            // Holders via reference-typed singleton fields or via
            // collection-valued reference fields
            let holders: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT s.id, s.storage_key FROM storage_keys s
                     JOIN entities e ON e.storage_key_id = s.id
                     WHERE e.tombstoned = 0 AND s.id IN (
                         SELECT fv.entity_storage_key_id FROM field_values fv
                         JOIN fields f ON fv.field_id = f.id
                         WHERE f.field_kind = 1 AND f.is_collection = 0
                           AND fv.value_id IN (
                             SELECT id FROM entity_refs
                             WHERE backing_storage_key = ?1 AND is_hard_reference = 1)
                         UNION
                         SELECT fv.entity_storage_key_id FROM field_values fv
                         JOIN fields f ON fv.field_id = f.id
                         JOIN collection_entries ce ON ce.collection_id = fv.value_id
                         WHERE f.field_kind = 1 AND f.is_collection = 1
                           AND ce.value_id IN (
                             SELECT id FROM entity_refs
                             WHERE backing_storage_key = ?1 AND is_hard_reference = 1))",
                )?;
                let rows = stmt.query_map(params![backing_key.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            for (key_id, raw_key) in holders {
                let key = StorageKey::parse(&raw_key)?;
                self.tombstone_entity_tx(&tx, key_id, &key)?;
                tombstoned_keys.push(key);
            }
            tx.commit()?;
        }

        for key in &tombstoned_keys {
            self.notify_delete(key, None);
        }
        Ok(tombstoned_keys.len())
    }

    /// Null the entity's fields and drop its inline children, keeping id
    /// and timestamps behind the tombstone
    fn tombstone_entity_tx(
        &self,
        tx: &Connection,
        key_id: i64,
        key: &StorageKey,
    ) -> DatabaseResult<()> {
        self.clear_entity_fields_tx(tx, key_id)?;
        self.delete_inline_children_tx(tx, key)?;
        tx.execute(
            "UPDATE entities SET tombstoned = 1, orphan = 0 WHERE storage_key_id = ?1",
            params![key_id],
        )?;
        debug!(key = %key, "entity tombstoned");
        Ok(())
    }

    fn reclaim_primitives_tx(&self, tx: &Connection) -> DatabaseResult<usize> {
        let text = tx.execute(
            "DELETE FROM text_primitive_values WHERE id NOT IN (
                 SELECT fv.value_id FROM field_values fv
                 JOIN fields f ON fv.field_id = f.id
                 WHERE f.field_kind = 0 AND f.is_collection = 0
                   AND f.value_type_id = 3 AND fv.value_id IS NOT NULL
                 UNION
                 SELECT ce.value_id FROM collection_entries ce
                 JOIN collections c ON ce.collection_id = c.id
                 WHERE c.entry_kind = 0 AND c.entry_type_id = 3)",
            [],
        )?;
        let number = tx.execute(
            "DELETE FROM number_primitive_values WHERE id NOT IN (
                 SELECT fv.value_id FROM field_values fv
                 JOIN fields f ON fv.field_id = f.id
                 WHERE f.field_kind = 0 AND f.is_collection = 0
                   AND f.value_type_id = 2 AND fv.value_id IS NOT NULL
                 UNION
                 SELECT ce.value_id FROM collection_entries ce
                 JOIN collections c ON ce.collection_id = c.id
                 WHERE c.entry_kind = 0 AND c.entry_type_id = 2)",
            [],
        )?;
        Ok(text + number)
    }
}
