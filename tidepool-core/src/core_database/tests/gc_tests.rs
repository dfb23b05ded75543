/*
    gc_tests.rs - Garbage collection, TTL expiry, hard-reference cascades
*/

use super::*;
use crate::core_crdt::version_map::VersionMap;
use crate::core_database::data::{DatabaseCollection, DatabaseData, ReferenceWithVersion};
use crate::core_database::database::Database;
use crate::core_database::gc::GcStats;
use crate::core_data::reference::RawReference;
use crate::core_data::storage_key::StorageKey;
use crate::core_data::value::FieldValue;

const BACKING: &str = "db://people";

fn backing_key() -> StorageKey {
    key(BACKING)
}

fn person_key(id: &str) -> StorageKey {
    backing_key().child(id)
}

fn write_person(db: &Database, id: &str) {
    db.insert_or_update_entity(
        &person_key(id),
        &stored(person_entity(id, "Ada"), 1, "alice"),
        None,
    )
    .unwrap();
}

fn write_container(db: &Database, container: &str, version: i64, ids: &[&str]) {
    let vm = VersionMap::of("alice", version as u64);
    let values = ids
        .iter()
        .map(|id| ReferenceWithVersion {
            reference: RawReference::new(id, backing_key()),
            version_map: vm.clone(),
        })
        .collect();
    assert!(db
        .insert_or_update(
            &key(container),
            &DatabaseData::Collection(DatabaseCollection {
                values,
                schema_hash: PERSON_HASH.to_string(),
                database_version: version,
                version_map: vm,
            }),
            None,
        )
        .unwrap());
}

#[test]
fn test_referenced_entity_survives() {
    let db = memory_db();
    write_person(&db, "p1");
    write_container(&db, "db://container", 1, &["p1"]);

    for _ in 0..3 {
        let stats = db.run_garbage_collection().unwrap();
        assert_eq!(stats.newly_orphaned, 0);
        assert_eq!(stats.collected, 0);
    }
    assert!(db.get_entity(&person_key("p1")).unwrap().is_some());
}

#[test]
fn test_unreferenced_entity_needs_two_passes() {
    let db = memory_db();
    write_person(&db, "p1");

    let first = db.run_garbage_collection().unwrap();
    assert_eq!(first.newly_orphaned, 1);
    assert_eq!(first.collected, 0);
    // Orphaned, not yet gone
    assert!(db.get_entity(&person_key("p1")).unwrap().is_some());

    let second = db.run_garbage_collection().unwrap();
    assert_eq!(second.newly_orphaned, 0);
    assert_eq!(second.collected, 1);
    assert!(db.get_entity(&person_key("p1")).unwrap().is_none());
}

#[test]
fn test_rereference_clears_orphan_mark() {
    let db = memory_db();
    write_person(&db, "p1");
    assert_eq!(db.run_garbage_collection().unwrap().newly_orphaned, 1);

    // A reference arrives between passes
    write_container(&db, "db://container", 1, &["p1"]);

    let stats = db.run_garbage_collection().unwrap();
    assert_eq!(stats.collected, 0);
    assert_eq!(stats.newly_orphaned, 0);
    assert!(db.get_entity(&person_key("p1")).unwrap().is_some());

    // And the entity stays as long as the reference does
    assert_eq!(db.run_garbage_collection().unwrap().collected, 0);
}

#[test]
fn test_unreferenced_interned_refs_are_reclaimed() {
    let db = memory_db();
    write_container(&db, "db://container", 1, &["p1"]);
    write_container(&db, "db://container", 2, &[]);

    let stats = db.run_garbage_collection().unwrap();
    assert_eq!(stats.refs_removed, 1);
}

#[test]
fn test_unreferenced_primitives_are_reclaimed() {
    let db = memory_db();
    let k = person_key("p1");
    db.insert_or_update_entity(&k, &stored(person_entity("p1", "Ada"), 1, "alice"), None)
        .unwrap();
    // Overwrite drops the only use of the interned text value
    let nameless = person_entity("p1", "Ada").with_singleton("name", None);
    db.insert_or_update_entity(&k, &stored(nameless, 2, "alice"), None)
        .unwrap();

    let stats = db.run_garbage_collection().unwrap();
    assert_eq!(stats.primitives_removed, 1);
}

#[test]
fn test_gc_feature_flag_disables_pass() {
    let db = memory_db();
    write_person(&db, "p1");
    db.features().disable("garbage_collection");

    for _ in 0..3 {
        assert_eq!(db.run_garbage_collection().unwrap(), GcStats::default());
    }
    assert!(db.get_entity(&person_key("p1")).unwrap().is_some());
}

#[test]
fn test_expired_entity_is_tombstoned_immediately() {
    let db = memory_db();
    let k = person_key("p1");
    let raw = person_entity("p1", "Ada").with_expiration_timestamp(100);
    db.insert_or_update_entity(&k, &stored(raw, 1, "alice"), None)
        .unwrap();
    write_person(&db, "p2"); // no expiration, untouched

    assert_eq!(db.remove_expired_entities().unwrap(), 1);
    assert!(db.get_entity(&k).unwrap().is_none());
    assert!(db.get_entity(&person_key("p2")).unwrap().is_some());

    // Idempotent
    assert_eq!(db.remove_expired_entities().unwrap(), 0);
}

#[test]
fn test_expired_membership_entries_are_removed() {
    let db = memory_db();
    let vm = VersionMap::of("alice", 1);
    let mut expired = RawReference::new("p1", backing_key());
    expired.expiration_timestamp_ms = Some(100);
    let live = RawReference::new("p2", backing_key());

    db.insert_or_update(
        &key("db://container"),
        &DatabaseData::Collection(DatabaseCollection {
            values: vec![
                ReferenceWithVersion {
                    reference: expired,
                    version_map: vm.clone(),
                },
                ReferenceWithVersion {
                    reference: live,
                    version_map: vm.clone(),
                },
            ],
            schema_hash: PERSON_HASH.to_string(),
            database_version: 1,
            version_map: vm,
        }),
        None,
    )
    .unwrap();

    assert_eq!(db.remove_expired_entities().unwrap(), 1);
    let back = db.get_collection(&key("db://container")).unwrap().unwrap();
    assert_eq!(back.values.len(), 1);
    assert_eq!(back.values[0].reference.id, "p2");
    assert_eq!(db.remove_expired_entities().unwrap(), 0);
}

#[test]
fn test_ttl_feature_flag_disables_sweep() {
    let db = memory_db();
    let k = person_key("p1");
    let raw = person_entity("p1", "Ada").with_expiration_timestamp(100);
    db.insert_or_update_entity(&k, &stored(raw, 1, "alice"), None)
        .unwrap();
    db.features().disable("ttl_expiry");

    assert_eq!(db.remove_expired_entities().unwrap(), 0);
    assert!(db.get_entity(&k).unwrap().is_some());
}

#[test]
fn test_hard_reference_cascade() {
    let db = memory_db();
    let victims = key("db://victims");

    let hard_holder = person_entity("holder", "Ada").with_singleton(
        "buddy",
        Some(FieldValue::Reference(
            RawReference::new("victim", victims.clone()).hard(),
        )),
    );
    db.insert_or_update_entity(
        &person_key("holder"),
        &stored(hard_holder, 1, "alice"),
        None,
    )
    .unwrap();

    let soft_holder = person_entity("bystander", "Bob").with_singleton(
        "buddy",
        Some(FieldValue::Reference(RawReference::new(
            "victim",
            victims.clone(),
        ))),
    );
    db.insert_or_update_entity(
        &person_key("bystander"),
        &stored(soft_holder, 1, "alice"),
        None,
    )
    .unwrap();

    assert_eq!(db.remove_entities_hard_referencing(&victims).unwrap(), 1);
    assert!(db.get_entity(&person_key("holder")).unwrap().is_none());
    assert!(db.get_entity(&person_key("bystander")).unwrap().is_some());
}

#[test]
fn test_hard_reference_cascade_via_collection_field() {
    let db = memory_db();
    let victims = key("db://victims");

    let holder = person_entity("holder", "Ada").with_collection_entry(
        "friends",
        FieldValue::Reference(RawReference::new("victim", victims.clone()).hard()),
    );
    db.insert_or_update_entity(
        &person_key("holder"),
        &stored(holder, 1, "alice"),
        None,
    )
    .unwrap();

    assert_eq!(db.remove_entities_hard_referencing(&victims).unwrap(), 1);
    assert!(db.get_entity(&person_key("holder")).unwrap().is_none());
}
