/*
    value.rs - Field value model

    Primitive values carry a total order and hash (numbers compare by IEEE
    total ordering) so they can live in ordered sets; field values are
    either primitives, references into a backing store, or nested inline
    entities.
*/

use super::entity::RawEntity;
use super::reference::RawReference;
use crate::core_crdt::traits::Referencable;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A primitive field value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrimitiveValue {
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl PrimitiveValue {
    fn rank(&self) -> u8 {
        match self {
            PrimitiveValue::Boolean(_) => 0,
            PrimitiveValue::Number(_) => 1,
            PrimitiveValue::Text(_) => 2,
        }
    }

    /// Human-readable type name, used in mismatch diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            PrimitiveValue::Boolean(_) => "Boolean",
            PrimitiveValue::Number(_) => "Number",
            PrimitiveValue::Text(_) => "Text",
        }
    }

    /// Canonical token used to derive reference ids for primitives
    pub fn canonical(&self) -> String {
        match self {
            PrimitiveValue::Boolean(b) => format!("Boolean:{}", b),
            PrimitiveValue::Number(n) => format!("Number:{}", n),
            PrimitiveValue::Text(t) => format!("Text:{}", t),
        }
    }
}

impl PartialEq for PrimitiveValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PrimitiveValue::Boolean(a), PrimitiveValue::Boolean(b)) => a == b,
            (PrimitiveValue::Number(a), PrimitiveValue::Number(b)) => {
                a.total_cmp(b) == Ordering::Equal
            }
            (PrimitiveValue::Text(a), PrimitiveValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PrimitiveValue {}

impl Hash for PrimitiveValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            PrimitiveValue::Boolean(b) => b.hash(state),
            PrimitiveValue::Number(n) => n.to_bits().hash(state),
            PrimitiveValue::Text(t) => t.hash(state),
        }
    }
}

impl PartialOrd for PrimitiveValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrimitiveValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PrimitiveValue::Boolean(a), PrimitiveValue::Boolean(b)) => a.cmp(b),
            (PrimitiveValue::Number(a), PrimitiveValue::Number(b)) => a.total_cmp(b),
            (PrimitiveValue::Text(a), PrimitiveValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for PrimitiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveValue::Boolean(b) => write!(f, "{}", b),
            PrimitiveValue::Number(n) => write!(f, "{}", n),
            PrimitiveValue::Text(t) => write!(f, "{}", t),
        }
    }
}

/// A value stored in an entity field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    Primitive(PrimitiveValue),
    Reference(RawReference),
    /// A nested entity persisted at a synthesized child key
    Entity(Box<RawEntity>),
}

impl FieldValue {
    /// Human-readable kind name, used in mismatch diagnostics
    pub fn kind_name(&self) -> String {
        match self {
            FieldValue::Primitive(p) => format!("primitive {}", p.type_name()),
            FieldValue::Reference(_) => "reference".to_string(),
            FieldValue::Entity(_) => "inline entity".to_string(),
        }
    }

    pub fn text(value: &str) -> Self {
        FieldValue::Primitive(PrimitiveValue::Text(value.to_string()))
    }

    pub fn number(value: f64) -> Self {
        FieldValue::Primitive(PrimitiveValue::Number(value))
    }

    pub fn boolean(value: bool) -> Self {
        FieldValue::Primitive(PrimitiveValue::Boolean(value))
    }
}

impl Referencable for FieldValue {
    fn reference_id(&self) -> String {
        match self {
            FieldValue::Primitive(p) => format!("Primitive({})", p.canonical()),
            FieldValue::Reference(r) => r.id.clone(),
            FieldValue::Entity(e) => e.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_number_equality_and_ordering() {
        let a = PrimitiveValue::Number(1.5);
        let b = PrimitiveValue::Number(1.5);
        let c = PrimitiveValue::Number(2.0);
        assert_eq!(a, b);
        assert!(a < c);
    }

    #[test]
    fn test_large_number_preserved() {
        let big = 9_007_199_254_740_991.0_f64; // 2^53 - 1
        let v = PrimitiveValue::Number(big);
        assert_eq!(v, PrimitiveValue::Number(big));
        assert_eq!(v.canonical(), format!("Number:{}", big));
    }

    #[test]
    fn test_cross_type_not_equal() {
        assert_ne!(
            PrimitiveValue::Text("true".to_string()),
            PrimitiveValue::Boolean(true)
        );
    }

    #[test]
    fn test_field_value_reference_ids() {
        let text = FieldValue::text("hello");
        assert_eq!(text.reference_id(), "Primitive(Text:hello)");

        let boolean = FieldValue::boolean(true);
        assert_eq!(boolean.reference_id(), "Primitive(Boolean:true)");

        // Same textual rendering, different types, different ids
        let text_true = FieldValue::text("true");
        assert_ne!(boolean.reference_id(), text_true.reference_id());
    }

    #[test]
    fn test_field_values_in_ordered_set() {
        let mut set = BTreeSet::new();
        set.insert(FieldValue::number(2.0));
        set.insert(FieldValue::number(1.0));
        set.insert(FieldValue::number(2.0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = FieldValue::number(-0.5);
        let json = serde_json::to_string(&v).unwrap();
        let back: FieldValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
