/*
    config module - Runtime configuration

    Feature flags gating optional behavior; shared by clone across the
    database and its collaborators.
*/

pub mod feature_flags;

pub use feature_flags::{FeatureFlags, FeatureManager};
