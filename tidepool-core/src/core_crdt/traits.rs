/*
    traits.rs - Core CRDT trait definitions

    The unified interface every CRDT model implements:
    - Apply a single operation (boolean-rejected when stale)
    - Merge with a remote replica's data, producing changes for both sides
    - Snapshot data and expose a consumer-facing view
*/

use super::errors::CrdtResult;
use super::version_map::VersionMap;

/// A value that can be keyed by a stable reference id
///
/// Set and singleton CRDTs index their entries by this id; two values with
/// the same reference id are considered the same logical element.
pub trait Referencable {
    fn reference_id(&self) -> String;
}

/// One side's share of a merge outcome
///
/// A merge can be communicated either as a list of operations to apply or,
/// when the delta is not expressible as operations, as a full data snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum CrdtChange<Data, Op> {
    Operations(Vec<Op>),
    Data(Data),
}

impl<Data, Op> CrdtChange<Data, Op> {
    /// True when this change carries nothing to apply
    pub fn is_empty(&self) -> bool {
        match self {
            CrdtChange::Operations(ops) => ops.is_empty(),
            CrdtChange::Data(_) => false,
        }
    }
}

/// The two-sided outcome of a merge: what the local model already absorbed
/// (`model_change`) and what must be shipped to the remote side
/// (`other_change`) for both replicas to converge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeChanges<Data, Op> {
    pub model_change: CrdtChange<Data, Op>,
    pub other_change: CrdtChange<Data, Op>,
}

/// Core trait implemented by every CRDT model
pub trait CrdtModel {
    /// Replicated state snapshot type
    type Data: Clone;

    /// Operation type accepted by `apply_operation`
    type Operation: Clone;

    /// Consumer-facing view of the current state
    type View;

    /// Merge a remote replica's data into this model.
    ///
    /// Mutates self to the merged state and returns the changes each side
    /// needs. Errors only on invariant violations (divergent state), never
    /// on ordinary concurrency.
    fn merge(&mut self, other: Self::Data) -> CrdtResult<MergeChanges<Self::Data, Self::Operation>>;

    /// Apply one operation. Returns false (leaving state untouched) when the
    /// operation's version is not applicable.
    fn apply_operation(&mut self, op: Self::Operation) -> bool;

    /// Snapshot the replicated data
    fn data(&self) -> Self::Data;

    /// The consumer-facing view of the current state
    fn consumer_view(&self) -> Self::View;

    /// The model's current version map
    fn version_map(&self) -> &VersionMap;
}

impl Referencable for String {
    fn reference_id(&self) -> String {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_is_empty() {
        let empty: CrdtChange<(), u32> = CrdtChange::Operations(vec![]);
        assert!(empty.is_empty());

        let ops: CrdtChange<(), u32> = CrdtChange::Operations(vec![1]);
        assert!(!ops.is_empty());

        let data: CrdtChange<(), u32> = CrdtChange::Data(());
        assert!(!data.is_empty());
    }

    #[test]
    fn test_string_referencable() {
        let s = "entity-7".to_string();
        assert_eq!(s.reference_id(), "entity-7");
    }
}
