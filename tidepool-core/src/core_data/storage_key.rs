/*
    storage_key.rs - Opaque storage location identifier

    A storage key is a `protocol://path` pair naming a location in the
    storage engine. Nested inline entities live at child keys synthesized
    with `child()`.
*/

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Errors raised while parsing storage keys
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageKeyError {
    #[error("malformed storage key: {0}")]
    Malformed(String),
}

/// Structured storage key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    protocol: String,
    path: String,
}

impl StorageKey {
    /// Build a key from its components
    pub fn new(protocol: &str, path: &str) -> Self {
        StorageKey {
            protocol: protocol.to_string(),
            path: path.to_string(),
        }
    }

    /// Parse a `protocol://path` string
    pub fn parse(raw: &str) -> Result<Self, StorageKeyError> {
        let (protocol, path) = raw
            .split_once("://")
            .ok_or_else(|| StorageKeyError::Malformed(raw.to_string()))?;
        if protocol.is_empty() || path.is_empty() {
            return Err(StorageKeyError::Malformed(raw.to_string()));
        }
        Ok(StorageKey {
            protocol: protocol.to_string(),
            path: path.to_string(),
        })
    }

    /// The key's protocol component
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The key's path component
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Synthesize the child key used for a nested component
    pub fn child(&self, component: &str) -> StorageKey {
        StorageKey {
            protocol: self.protocol.clone(),
            path: format!("{}/{}", self.path, component),
        }
    }

    /// True when `self` names a location nested under `parent`
    pub fn is_child_of(&self, parent: &StorageKey) -> bool {
        self.protocol == parent.protocol
            && self.path.starts_with(&parent.path)
            && self.path[parent.path.len()..].starts_with('/')
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.path)
    }
}

impl Serialize for StorageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StorageKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        StorageKey::parse(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let key = StorageKey::parse("db://container/list").unwrap();
        assert_eq!(key.protocol(), "db");
        assert_eq!(key.path(), "container/list");
        assert_eq!(key.to_string(), "db://container/list");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(StorageKey::parse("no-separator").is_err());
        assert!(StorageKey::parse("://path").is_err());
        assert!(StorageKey::parse("db://").is_err());
    }

    #[test]
    fn test_child_key() {
        let key = StorageKey::parse("db://backing").unwrap();
        let child = key.child("entity-1");
        assert_eq!(child.to_string(), "db://backing/entity-1");
        assert!(child.is_child_of(&key));
        assert!(!key.is_child_of(&child));
    }

    #[test]
    fn test_is_child_of_requires_separator() {
        let a = StorageKey::parse("db://back").unwrap();
        let b = StorageKey::parse("db://backing").unwrap();
        assert!(!b.is_child_of(&a));
    }

    #[test]
    fn test_serde_as_string() {
        let key = StorageKey::parse("db://x/y").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"db://x/y\"");
        let back: StorageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
