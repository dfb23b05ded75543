/*
    schema.rs - Schema model and registry

    Schemas describe an entity's field layout and are looked up by hash.
    The registry is an explicitly constructed object passed by reference
    from the composition root; constructing a fresh registry gives clean
    test isolation.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Primitive field types; their storage type ids occupy a reserved low range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveType {
    Boolean,
    Number,
    Text,
}

impl PrimitiveType {
    /// Fixed storage type id
    pub fn type_id(&self) -> i64 {
        match self {
            PrimitiveType::Boolean => 1,
            PrimitiveType::Number => 2,
            PrimitiveType::Text => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveType::Boolean => "Boolean",
            PrimitiveType::Number => "Number",
            PrimitiveType::Text => "Text",
        }
    }

    pub fn from_type_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(PrimitiveType::Boolean),
            2 => Some(PrimitiveType::Number),
            3 => Some(PrimitiveType::Text),
            _ => None,
        }
    }
}

/// Declared type of a schema field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Primitive(PrimitiveType),

    /// A reference into the backing store of entities with the given schema
    Reference { schema_hash: String },

    /// An entity persisted inline at a synthesized child key
    Inline { schema_hash: String },
}

impl FieldType {
    /// Human-readable description, used in mismatch diagnostics
    pub fn describe(&self) -> String {
        match self {
            FieldType::Primitive(p) => format!("primitive {}", p.name()),
            FieldType::Reference { schema_hash } => format!("reference to schema {}", schema_hash),
            FieldType::Inline { schema_hash } => format!("inline entity of schema {}", schema_hash),
        }
    }
}

/// Entity field layout, identified by hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub hash: String,
    pub singletons: BTreeMap<String, FieldType>,
    pub collections: BTreeMap<String, FieldType>,
}

impl Schema {
    pub fn new(name: &str, hash: &str) -> Self {
        Schema {
            name: name.to_string(),
            hash: hash.to_string(),
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    pub fn with_singleton(mut self, field: &str, field_type: FieldType) -> Self {
        self.singletons.insert(field.to_string(), field_type);
        self
    }

    pub fn with_collection(mut self, field: &str, field_type: FieldType) -> Self {
        self.collections.insert(field.to_string(), field_type);
        self
    }

    /// Look up a declared field in either map
    pub fn field(&self, name: &str) -> Option<(&FieldType, bool)> {
        if let Some(ft) = self.singletons.get(name) {
            return Some((ft, false));
        }
        self.collections.get(name).map(|ft| (ft, true))
    }
}

/// Hash-keyed schema lookup shared across the storage layer
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Schema>>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        SchemaRegistry {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a schema under its hash
    pub fn register(&self, schema: Schema) {
        self.schemas
            .write()
            .expect("schema registry lock poisoned")
            .insert(schema.hash.clone(), schema);
    }

    /// Resolve a schema by hash
    pub fn lookup(&self, hash: &str) -> Option<Schema> {
        self.schemas
            .read()
            .expect("schema registry lock poisoned")
            .get(hash)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_type_ids_are_low_range() {
        assert_eq!(PrimitiveType::Boolean.type_id(), 1);
        assert_eq!(PrimitiveType::Number.type_id(), 2);
        assert_eq!(PrimitiveType::Text.type_id(), 3);
        assert_eq!(
            PrimitiveType::from_type_id(2),
            Some(PrimitiveType::Number)
        );
        assert_eq!(PrimitiveType::from_type_id(64), None);
    }

    #[test]
    fn test_schema_field_lookup() {
        let schema = Schema::new("Person", "hash-person")
            .with_singleton("name", FieldType::Primitive(PrimitiveType::Text))
            .with_collection("scores", FieldType::Primitive(PrimitiveType::Number));

        let (ft, is_collection) = schema.field("name").unwrap();
        assert_eq!(*ft, FieldType::Primitive(PrimitiveType::Text));
        assert!(!is_collection);

        let (_, is_collection) = schema.field("scores").unwrap();
        assert!(is_collection);

        assert!(schema.field("missing").is_none());
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let registry = SchemaRegistry::new();
        assert!(registry.lookup("h1").is_none());

        registry.register(Schema::new("A", "h1"));
        assert_eq!(registry.lookup("h1").unwrap().name, "A");

        // Re-registering under the same hash replaces
        registry.register(Schema::new("B", "h1"));
        assert_eq!(registry.lookup("h1").unwrap().name, "B");
    }
}
