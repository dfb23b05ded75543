//! Feature flag management for runtime configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Feature flags for enabling/disabling functionality at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Allow incremental database mutations through `apply_op`
    pub database_ops: bool,

    /// Allow the garbage collector to tombstone unreachable entities
    pub garbage_collection: bool,

    /// Allow the expiration sweep to remove past-TTL data
    pub ttl_expiry: bool,

    /// Custom feature flags (key-value pairs)
    pub custom: HashMap<String, bool>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            database_ops: true,
            garbage_collection: true,
            ttl_expiry: true,
            custom: HashMap::new(),
        }
    }
}

/// Thread-safe feature flag manager
#[derive(Debug, Clone, Default)]
pub struct FeatureManager {
    flags: Arc<RwLock<FeatureFlags>>,
}

impl FeatureManager {
    /// Create a new feature manager with default flags
    pub fn new() -> Self {
        Self {
            flags: Arc::new(RwLock::new(FeatureFlags::default())),
        }
    }

    /// Create a new feature manager with custom flags
    pub fn with_flags(flags: FeatureFlags) -> Self {
        Self {
            flags: Arc::new(RwLock::new(flags)),
        }
    }

    /// Check if incremental database mutations are enabled
    pub fn is_database_ops_enabled(&self) -> bool {
        self.flags.read().unwrap().database_ops
    }

    /// Check if garbage collection is enabled
    pub fn is_garbage_collection_enabled(&self) -> bool {
        self.flags.read().unwrap().garbage_collection
    }

    /// Check if TTL expiry is enabled
    pub fn is_ttl_expiry_enabled(&self) -> bool {
        self.flags.read().unwrap().ttl_expiry
    }

    /// Check a custom feature flag
    pub fn is_enabled(&self, feature: &str) -> bool {
        self.flags
            .read()
            .unwrap()
            .custom
            .get(feature)
            .copied()
            .unwrap_or(false)
    }

    /// Enable a feature flag
    pub fn enable(&self, feature: &str) {
        let mut flags = self.flags.write().unwrap();
        match feature {
            "database_ops" => flags.database_ops = true,
            "garbage_collection" => flags.garbage_collection = true,
            "ttl_expiry" => flags.ttl_expiry = true,
            _ => {
                flags.custom.insert(feature.to_string(), true);
            }
        }
    }

    /// Disable a feature flag
    pub fn disable(&self, feature: &str) {
        let mut flags = self.flags.write().unwrap();
        match feature {
            "database_ops" => flags.database_ops = false,
            "garbage_collection" => flags.garbage_collection = false,
            "ttl_expiry" => flags.ttl_expiry = false,
            _ => {
                flags.custom.insert(feature.to_string(), false);
            }
        }
    }

    /// Snapshot the current flag values
    pub fn current(&self) -> FeatureFlags {
        self.flags.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let manager = FeatureManager::new();
        assert!(manager.is_database_ops_enabled());
        assert!(manager.is_garbage_collection_enabled());
        assert!(manager.is_ttl_expiry_enabled());
    }

    #[test]
    fn test_enable_disable() {
        let manager = FeatureManager::new();
        manager.disable("database_ops");
        assert!(!manager.is_database_ops_enabled());
        manager.enable("database_ops");
        assert!(manager.is_database_ops_enabled());
    }

    #[test]
    fn test_custom_flags() {
        let manager = FeatureManager::new();
        assert!(!manager.is_enabled("shiny"));
        manager.enable("shiny");
        assert!(manager.is_enabled("shiny"));
        manager.disable("shiny");
        assert!(!manager.is_enabled("shiny"));
    }

    #[test]
    fn test_shared_across_clones() {
        let manager = FeatureManager::new();
        let clone = manager.clone();
        clone.disable("ttl_expiry");
        assert!(!manager.is_ttl_expiry_enabled());
    }
}
