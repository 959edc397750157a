//! Change notifications
//!
//! Every applied operation produces one `DirectoryEvent`, dispatched
//! synchronously to subscribers at or above the affected directory.
//! Events are ephemeral; they are never stored or replayed.

use serde::{Deserialize, Serialize};

use crate::TreePath;

/// Classification of an applied operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Set,
    Delete,
    Clear,
    CreateSubDirectory,
    DeleteSubDirectory,
}

/// A change notification
///
/// `key` is None for directory-level operations (clear, create, delete
/// of a subdirectory). `path` is the holding directory for key
/// operations and the subdirectory itself for create/delete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEvent {
    pub path: TreePath,
    pub key: Option<String>,
    pub kind: OperationKind,
    /// Whether this replica authored the operation
    pub local: bool,
}
