//! Error types for the Arbor directory
//!
//! Only locally raised conditions appear here. Failures while applying
//! remote operations are logged and dropped instead, so one bad
//! operation cannot break convergence for the rest of the session.

use thiserror::Error;

use crate::TreePath;

/// Core directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    // Handle errors
    #[error("stale directory handle: {path} was deleted")]
    StaleHandle { path: TreePath },

    // Addressing errors
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("invalid directory name: {0:?}")]
    InvalidName(String),
}

/// Result type for directory operations
pub type DirectoryResult<T> = Result<T, DirectoryError>;
