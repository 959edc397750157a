//! Identity types for the Arbor directory protocol
//!
//! Replica identifiers are 64-bit for cheap copying and compact
//! operation logs while remaining unique for practical fleet sizes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica identity - one independent copy of the directory tree
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub const ZERO: ReplicaId = ReplicaId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        ReplicaId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        ReplicaId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replica({:016x})", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
