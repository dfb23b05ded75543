/*
    core_data module - Shared data model

    Plain (non-CRDT) value types exchanged between the CRDT layer, the
    database engine, and consumers: storage keys, primitive and field
    values, raw entities, references, and the schema registry.
*/

pub mod entity;
pub mod reference;
pub mod schema;
pub mod storage_key;
pub mod value;

pub use entity::{RawEntity, UNSET_TIMESTAMP};
pub use reference::RawReference;
pub use schema::{FieldType, PrimitiveType, Schema, SchemaRegistry};
pub use storage_key::{StorageKey, StorageKeyError};
pub use value::{FieldValue, PrimitiveValue};
