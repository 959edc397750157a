//! Operation vocabulary
//!
//! Local mutations are applied optimistically, queued as `LocalOp`s for
//! the sequencer, and come back to every replica (origin included) as
//! `SequencedOp`s in one total order. The origin recognizes its own
//! echo by replica id and local sequence number and uses it as the
//! acknowledgment.

use serde::{Deserialize, Serialize};

use crate::{OperationKind, ReplicaId, TreePath, Value};

/// A directory mutation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryOp {
    /// Create or overwrite the value at `key`
    Set {
        path: TreePath,
        key: String,
        value: Value,
    },
    /// Remove `key` entirely - a write of absence
    Delete { path: TreePath, key: String },
    /// Delete the listed keys. The list is captured from the issuer's
    /// view at submission time, so keys added concurrently by other
    /// replicas are untouched.
    Clear { path: TreePath, keys: Vec<String> },
    /// Create a child directory unless the name is already taken
    CreateSubDirectory { path: TreePath, name: String },
    /// Remove a child directory and its entire subtree
    DeleteSubDirectory { path: TreePath, name: String },
}

impl DirectoryOp {
    /// The directory this operation targets
    pub fn path(&self) -> &TreePath {
        match self {
            DirectoryOp::Set { path, .. }
            | DirectoryOp::Delete { path, .. }
            | DirectoryOp::Clear { path, .. }
            | DirectoryOp::CreateSubDirectory { path, .. }
            | DirectoryOp::DeleteSubDirectory { path, .. } => path,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            DirectoryOp::Set { .. } => OperationKind::Set,
            DirectoryOp::Delete { .. } => OperationKind::Delete,
            DirectoryOp::Clear { .. } => OperationKind::Clear,
            DirectoryOp::CreateSubDirectory { .. } => OperationKind::CreateSubDirectory,
            DirectoryOp::DeleteSubDirectory { .. } => OperationKind::DeleteSubDirectory,
        }
    }
}

/// A locally submitted operation awaiting sequencing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalOp {
    /// Sequence number assigned by the submitting replica
    pub local_seq: u64,
    pub op: DirectoryOp,
}

/// An operation delivered in global order by the sequencer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedOp {
    /// Position in the sequencer's total order
    pub global_seq: u64,
    /// Replica that authored the operation
    pub origin: ReplicaId,
    /// The origin's local sequence number, echoed back for
    /// acknowledgment
    pub local_seq: Option<u64>,
    pub op: DirectoryOp,
}

/// Result of applying one sequenced operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpOutcome {
    /// The operation took effect (or confirmed optimistic state)
    Applied,
    /// Nothing to do: idempotent create, delete of a missing key
    Noop,
    /// Already-seen global sequence number
    Duplicate,
    /// The operation could not take effect and was discarded
    Dropped(DropReason),
}

/// Why a sequenced operation was discarded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Target path no longer resolves - an ancestor was deleted
    MissingPath,
    /// A later local pending write supersedes it
    Shadowed,
    /// Structurally invalid: bad name, missing acknowledgment seq
    Malformed,
    /// Delivered to a tree that is not attached
    Detached,
}

/// Counters for one batch of sequenced operations
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: u32,
    pub noops: u32,
    pub duplicates: u32,
    pub dropped: u32,
}

impl ApplySummary {
    pub fn record(&mut self, outcome: &OpOutcome) {
        match outcome {
            OpOutcome::Applied => self.applied += 1,
            OpOutcome::Noop => self.noops += 1,
            OpOutcome::Duplicate => self.duplicates += 1,
            OpOutcome::Dropped(_) => self.dropped += 1,
        }
    }
}
