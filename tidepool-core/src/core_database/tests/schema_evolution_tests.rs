/*
    schema_evolution_tests.rs - Reads across schema registry changes
*/

use super::*;
use crate::core_data::schema::{FieldType, PrimitiveType, Schema};
use crate::core_data::value::FieldValue;

#[test]
fn test_added_field_reads_as_null() {
    let db = memory_db();
    let k = key("db://people/p1");
    db.insert_or_update_entity(&k, &stored(person_entity("p1", "Ada"), 1, "alice"), None)
        .unwrap();

    // A newer build of the application knows one more field
    db.schemas().register(
        person_schema().with_singleton("email", FieldType::Primitive(PrimitiveType::Text)),
    );

    let back = db.get_entity(&k).unwrap().unwrap();
    assert_eq!(back.raw.singletons.get("email"), Some(&None));
    assert_eq!(
        back.raw.singletons.get("name"),
        Some(&Some(FieldValue::text("Ada")))
    );
}

#[test]
fn test_added_collection_reads_as_empty() {
    let db = memory_db();
    let k = key("db://people/p1");
    db.insert_or_update_entity(&k, &stored(person_entity("p1", "Ada"), 1, "alice"), None)
        .unwrap();

    db.schemas().register(
        person_schema().with_collection("aliases", FieldType::Primitive(PrimitiveType::Text)),
    );

    let back = db.get_entity(&k).unwrap().unwrap();
    assert!(back.raw.collections.get("aliases").unwrap().is_empty());
}

#[test]
fn test_removed_field_surfaces_stored_value() {
    let db = memory_db();
    let k = key("db://people/p1");
    db.insert_or_update_entity(&k, &stored(person_entity("p1", "Ada"), 1, "alice"), None)
        .unwrap();

    // A newer build dropped the name field; the stored value is still
    // readable until the row is rewritten without it
    let slim = Schema::new("Person", PERSON_HASH)
        .with_singleton("age", FieldType::Primitive(PrimitiveType::Number))
        .with_singleton(
            "buddy",
            FieldType::Reference {
                schema_hash: PERSON_HASH.to_string(),
            },
        )
        .with_singleton(
            "pet",
            FieldType::Inline {
                schema_hash: PET_HASH.to_string(),
            },
        )
        .with_collection("tags", FieldType::Primitive(PrimitiveType::Text))
        .with_collection(
            "friends",
            FieldType::Reference {
                schema_hash: PERSON_HASH.to_string(),
            },
        );
    db.schemas().register(slim);

    let back = db.get_entity(&k).unwrap().unwrap();
    assert_eq!(
        back.raw.singletons.get("name"),
        Some(&Some(FieldValue::text("Ada")))
    );
}
