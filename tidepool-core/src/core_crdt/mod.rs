/*
    core_crdt module - Conflict-free replicated data types

    The replicated model layer: version maps, a grow-only counter, an
    observed-remove set, a single-value register built on it, and an
    entity composed of per-field states.
*/

pub mod count;
pub mod entity;
pub mod errors;
pub mod set;
pub mod singleton;
pub mod traits;
pub mod version_map;

pub use count::{CountData, CountOperation, CrdtCount};
pub use entity::{CrdtEntity, EntityData, EntityOperation};
pub use errors::{CrdtError, CrdtResult};
pub use set::{CrdtSet, SetData, SetOperation, VersionedValue};
pub use singleton::{CrdtSingleton, SingletonData, SingletonOperation};
pub use traits::{CrdtChange, CrdtModel, MergeChanges, Referencable};
pub use version_map::{VersionMap, VersionOrdering};
