//! Pending operation tracking
//!
//! Records every locally submitted operation until the sequencer echoes
//! it back. Incoming remote operations are resolved against the latest
//! pending entry for their target: while one exists, the remote write
//! must not surface, because the local write holds a later position in
//! global order.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use arbor_core::{DirectoryOp, TreePath};

/// Target of a pending local operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingTarget {
    /// A set or delete on one key
    Key { path: TreePath, key: String },
    /// A clear, with the keys captured at submission
    Clear { path: TreePath, keys: Vec<String> },
    /// A subdirectory creation
    Create { path: TreePath, name: String },
    /// A subdirectory deletion
    Remove { path: TreePath, name: String },
}

/// One un-acked local operation
#[derive(Clone, Debug)]
pub struct PendingRecord {
    pub local_seq: u64,
    pub target: PendingTarget,
}

/// How an incoming remote operation resolves against pending state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// No pending local write stands in the way
    Apply,
    /// A later local pending write supersedes the remote one
    Shadowed,
}

/// Queue of locally submitted, not yet acknowledged operations
#[derive(Debug, Default)]
pub struct PendingOpTracker {
    next_local_seq: u64,
    queue: VecDeque<PendingRecord>,
    key_writes: HashMap<TreePath, HashMap<String, u32>>,
    removes: HashMap<TreePath, HashMap<String, u32>>,
}

impl PendingOpTracker {
    pub fn new() -> Self {
        PendingOpTracker::default()
    }

    /// Record a local submission. Returns the local sequence number the
    /// operation travels with.
    pub fn record_local(&mut self, target: PendingTarget) -> u64 {
        self.next_local_seq += 1;
        let local_seq = self.next_local_seq;
        match &target {
            PendingTarget::Key { path, key } => {
                bump(&mut self.key_writes, path, key);
            }
            PendingTarget::Clear { path, keys } => {
                for key in keys {
                    bump(&mut self.key_writes, path, key);
                }
            }
            PendingTarget::Create { .. } => {}
            PendingTarget::Remove { path, name } => {
                bump(&mut self.removes, path, name);
            }
        }
        self.queue.push_back(PendingRecord { local_seq, target });
        local_seq
    }

    /// Resolve a whole incoming remote operation. Clears resolve
    /// key-by-key through `key_shadowed` instead; subtree deletes are
    /// resolved structurally (unconfirmed nodes are invisible to remote
    /// operations).
    pub fn resolve_incoming(&self, op: &DirectoryOp) -> Resolution {
        let shadowed = match op {
            DirectoryOp::Set { path, key, .. } | DirectoryOp::Delete { path, key } => {
                self.key_shadowed(path, key)
            }
            DirectoryOp::CreateSubDirectory { path, name } => self.remove_pending(path, name),
            DirectoryOp::Clear { .. } | DirectoryOp::DeleteSubDirectory { .. } => false,
        };
        if shadowed {
            Resolution::Shadowed
        } else {
            Resolution::Apply
        }
    }

    /// Whether an un-acked local write exists for this key
    pub fn key_shadowed(&self, path: &TreePath, key: &str) -> bool {
        self.key_writes
            .get(path)
            .is_some_and(|keys| keys.contains_key(key))
    }

    /// Whether an un-acked local delete exists for this child name
    pub fn remove_pending(&self, path: &TreePath, name: &str) -> bool {
        self.removes
            .get(path)
            .is_some_and(|names| names.contains_key(name))
    }

    /// Acknowledge the echo of a local operation, removing its record.
    /// Out-of-order acknowledgments indicate a sequencer fault; the
    /// record is still located and removed.
    pub fn acknowledge(&mut self, local_seq: u64) -> Option<PendingRecord> {
        let idx = self
            .queue
            .iter()
            .position(|record| record.local_seq == local_seq)?;
        if idx != 0 {
            debug!(local_seq, "acknowledgment arrived out of submission order");
        }
        let record = self.queue.remove(idx)?;
        match &record.target {
            PendingTarget::Key { path, key } => {
                decrement(&mut self.key_writes, path, key);
            }
            PendingTarget::Clear { path, keys } => {
                for key in keys {
                    decrement(&mut self.key_writes, path, key);
                }
            }
            PendingTarget::Create { .. } => {}
            PendingTarget::Remove { path, name } => {
                decrement(&mut self.removes, path, name);
            }
        }
        Some(record)
    }

    /// Number of un-acked local operations
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn bump(map: &mut HashMap<TreePath, HashMap<String, u32>>, path: &TreePath, name: &str) {
    *map.entry(path.clone())
        .or_default()
        .entry(name.to_string())
        .or_insert(0) += 1;
}

fn decrement(map: &mut HashMap<TreePath, HashMap<String, u32>>, path: &TreePath, name: &str) {
    let Some(names) = map.get_mut(path) else {
        return;
    };
    if let Some(count) = names.get_mut(name) {
        *count -= 1;
        if *count == 0 {
            names.remove(name);
        }
    }
    if names.is_empty() {
        map.remove(path);
    }
}
