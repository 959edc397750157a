//! The replicated directory tree
//!
//! `DirectoryTree` is the single entry point for local mutation and for
//! sequenced operations coming back from the broadcast log. Local
//! mutations apply optimistically and queue outbound ops; sequenced
//! operations are resolved against pending local state so that a
//! replica's own un-acked writes keep winning locally until the log
//! confirms them, after which global order is authoritative.
//!
//! Operations whose target path no longer resolves are silently
//! dropped, never errors: deletions are irrevocable and remote
//! causality cannot be repaired.

use std::collections::HashMap;

use tracing::{debug, warn};

use arbor_core::{
    ApplySummary, DirectoryError, DirectoryEvent, DirectoryOp, DirectoryResult, DropReason,
    LocalOp, OpOutcome, OperationKind, ReplicaId, SequencedOp, TreePath, Value,
};

use crate::{
    DirectoryNode, NodeId, PendingOpTracker, PendingTarget, Resolution, Slot, ValueCell,
};

/// Attachment state of the tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachState {
    /// Private to this replica: mutations are confirmed immediately and
    /// nothing is broadcast
    Detached,
    /// Participating in the broadcast log
    Attached,
}

/// Token addressing one directory in the tree
///
/// Handles survive as long as the node does. Deleting a directory
/// invalidates every handle to it and its descendants permanently;
/// recreating the same path yields a fresh node with fresh handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryHandle {
    pub(crate) id: NodeId,
    pub(crate) path: TreePath,
}

impl DirectoryHandle {
    pub fn path(&self) -> &TreePath {
        &self.path
    }
}

/// Subscription identity returned by `subscribe`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    prefix: TreePath,
    callback: Box<dyn FnMut(&DirectoryEvent)>,
}

/// Cumulative counters for one tree
#[derive(Clone, Debug, Default)]
pub struct TreeStats {
    /// Local operations handed to the outbound queue
    pub submitted: u64,
    pub applied: u64,
    pub noops: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// The root aggregate owning every directory node
pub struct DirectoryTree {
    pub(crate) replica: ReplicaId,
    pub(crate) state: AttachState,
    pub(crate) nodes: HashMap<NodeId, DirectoryNode>,
    pub(crate) paths: HashMap<TreePath, NodeId>,
    pub(crate) next_node: u64,
    pub(crate) pending: PendingOpTracker,
    pub(crate) outbound: Vec<LocalOp>,
    pub(crate) last_global_seq: u64,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
    stats: TreeStats,
}

impl DirectoryTree {
    /// New detached tree private to `replica`
    pub fn new(replica: ReplicaId) -> Self {
        let root_path = TreePath::root();
        let root = DirectoryNode::new(NodeId::ROOT, root_path.clone(), None, true);
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, root);
        let mut paths = HashMap::new();
        paths.insert(root_path, NodeId::ROOT);
        DirectoryTree {
            replica,
            state: AttachState::Detached,
            nodes,
            paths,
            next_node: 0,
            pending: PendingOpTracker::new(),
            outbound: Vec::new(),
            last_global_seq: 0,
            subscriptions: Vec::new(),
            next_subscription: 0,
            stats: TreeStats::default(),
        }
    }

    /// New empty tree already participating in the log
    pub fn attached(replica: ReplicaId) -> Self {
        let mut tree = Self::new(replica);
        tree.state = AttachState::Attached;
        tree
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn attach_state(&self) -> AttachState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.state == AttachState::Attached
    }

    /// Handle to the root directory
    pub fn root(&self) -> DirectoryHandle {
        DirectoryHandle {
            id: NodeId::ROOT,
            path: TreePath::root(),
        }
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Highest global sequence number applied so far
    pub fn last_global_seq(&self) -> u64 {
        self.last_global_seq
    }

    /// Number of un-acked local operations
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Whether the handle still points at a live directory
    pub fn contains(&self, dir: &DirectoryHandle) -> bool {
        self.nodes.contains_key(&dir.id)
    }

    // ------------------------------------------------------------------
    // Local API
    // ------------------------------------------------------------------

    /// Create or overwrite `key` in `dir`
    pub fn set(
        &mut self,
        dir: &DirectoryHandle,
        key: impl Into<String>,
        value: Value,
    ) -> DirectoryResult<()> {
        let key = key.into();
        let path = self.node(dir)?.path.clone();
        if self.is_attached() {
            let local_seq = self.pending.record_local(PendingTarget::Key {
                path: path.clone(),
                key: key.clone(),
            });
            let node = self.node_mut(dir)?;
            node.keys
                .entry(key.clone())
                .or_insert_with(|| ValueCell::confirmed(Slot::Absent, None, 0))
                .push_speculative(local_seq, Slot::Present(value.clone()));
            self.outbound.push(LocalOp {
                local_seq,
                op: DirectoryOp::Set {
                    path: path.clone(),
                    key: key.clone(),
                    value,
                },
            });
            self.stats.submitted += 1;
        } else {
            let replica = self.replica;
            let node = self.node_mut(dir)?;
            node.keys
                .entry(key.clone())
                .or_insert_with(|| ValueCell::confirmed(Slot::Absent, None, 0))
                .confirm(Slot::Present(value), replica, 0);
        }
        self.emit(DirectoryEvent {
            path,
            key: Some(key),
            kind: OperationKind::Set,
            local: true,
        });
        Ok(())
    }

    /// Visible value at `key`. `None` means the key is absent, which is
    /// distinct from a stored `Value::Undefined`.
    pub fn get(&self, dir: &DirectoryHandle, key: &str) -> DirectoryResult<Option<&Value>> {
        let node = self.node(dir)?;
        Ok(node.keys.get(key).and_then(|cell| cell.visible().value()))
    }

    pub fn has(&self, dir: &DirectoryHandle, key: &str) -> DirectoryResult<bool> {
        let node = self.node(dir)?;
        Ok(node
            .keys
            .get(key)
            .is_some_and(|cell| cell.visible().is_present()))
    }

    /// Remove `key`. Returns whether it was visibly present.
    ///
    /// The delete is submitted regardless: it is a write of absence and
    /// a concurrent set sequenced earlier must still lose to it.
    pub fn delete(&mut self, dir: &DirectoryHandle, key: &str) -> DirectoryResult<bool> {
        let (path, was_present) = {
            let node = self.node(dir)?;
            let present = node
                .keys
                .get(key)
                .is_some_and(|cell| cell.visible().is_present());
            (node.path.clone(), present)
        };
        if self.is_attached() {
            let local_seq = self.pending.record_local(PendingTarget::Key {
                path: path.clone(),
                key: key.to_string(),
            });
            let node = self.node_mut(dir)?;
            node.keys
                .entry(key.to_string())
                .or_insert_with(|| ValueCell::confirmed(Slot::Absent, None, 0))
                .push_speculative(local_seq, Slot::Absent);
            self.outbound.push(LocalOp {
                local_seq,
                op: DirectoryOp::Delete {
                    path: path.clone(),
                    key: key.to_string(),
                },
            });
            self.stats.submitted += 1;
        } else {
            let node = self.node_mut(dir)?;
            node.keys.shift_remove(key);
        }
        if was_present {
            self.emit(DirectoryEvent {
                path,
                key: Some(key.to_string()),
                kind: OperationKind::Delete,
                local: true,
            });
        }
        Ok(was_present)
    }

    /// Delete every visibly present key in `dir`.
    ///
    /// The key list is captured here and ships with the operation, so
    /// keys added concurrently by other replicas stay untouched.
    pub fn clear(&mut self, dir: &DirectoryHandle) -> DirectoryResult<()> {
        let (path, captured) = {
            let node = self.node(dir)?;
            let keys: Vec<String> = node.visible_keys().map(str::to_string).collect();
            (node.path.clone(), keys)
        };
        if self.is_attached() {
            let local_seq = self.pending.record_local(PendingTarget::Clear {
                path: path.clone(),
                keys: captured.clone(),
            });
            let node = self.node_mut(dir)?;
            for key in &captured {
                if let Some(cell) = node.keys.get_mut(key) {
                    cell.push_speculative(local_seq, Slot::Absent);
                }
            }
            self.outbound.push(LocalOp {
                local_seq,
                op: DirectoryOp::Clear {
                    path: path.clone(),
                    keys: captured,
                },
            });
            self.stats.submitted += 1;
        } else {
            let node = self.node_mut(dir)?;
            node.keys.clear();
        }
        self.emit(DirectoryEvent {
            path,
            key: None,
            kind: OperationKind::Clear,
            local: true,
        });
        Ok(())
    }

    /// Visibly present keys in insertion order
    pub fn keys<'a>(
        &'a self,
        dir: &DirectoryHandle,
    ) -> DirectoryResult<impl Iterator<Item = &'a str>> {
        Ok(self.node(dir)?.visible_keys())
    }

    /// Number of visibly present keys
    pub fn key_count(&self, dir: &DirectoryHandle) -> DirectoryResult<usize> {
        Ok(self.node(dir)?.visible_len())
    }

    /// Get or create the named child directory.
    ///
    /// Idempotent: an existing child is returned untouched and no
    /// operation is submitted. Content is never merged.
    pub fn create_sub_directory(
        &mut self,
        dir: &DirectoryHandle,
        name: &str,
    ) -> DirectoryResult<DirectoryHandle> {
        TreePath::validate_name(name)?;
        let (parent_path, existing) = {
            let node = self.node(dir)?;
            (node.path.clone(), node.children.get(name).copied())
        };
        let child_path = parent_path.join(name)?;
        if let Some(child_id) = existing {
            return Ok(DirectoryHandle {
                id: child_id,
                path: child_path,
            });
        }
        let attached = self.is_attached();
        let child_id = self.alloc_node(child_path.clone(), Some(dir.id), !attached);
        if let Some(parent) = self.nodes.get_mut(&dir.id) {
            parent.children.insert(name.to_string(), child_id);
        }
        if attached {
            let local_seq = self.pending.record_local(PendingTarget::Create {
                path: parent_path.clone(),
                name: name.to_string(),
            });
            self.outbound.push(LocalOp {
                local_seq,
                op: DirectoryOp::CreateSubDirectory {
                    path: parent_path,
                    name: name.to_string(),
                },
            });
            self.stats.submitted += 1;
        }
        self.emit(DirectoryEvent {
            path: child_path.clone(),
            key: None,
            kind: OperationKind::CreateSubDirectory,
            local: true,
        });
        Ok(DirectoryHandle {
            id: child_id,
            path: child_path,
        })
    }

    /// Remove the named child and its entire subtree. Returns whether
    /// it existed. Every handle into the subtree becomes stale
    /// permanently.
    pub fn delete_sub_directory(
        &mut self,
        dir: &DirectoryHandle,
        name: &str,
    ) -> DirectoryResult<bool> {
        let (parent_path, child_id) = {
            let node = self.node(dir)?;
            match node.children.get(name).copied() {
                Some(id) => (node.path.clone(), id),
                None => return Ok(false),
            }
        };
        let child_path = match self.nodes.get(&child_id) {
            Some(child) => child.path.clone(),
            None => parent_path.join(name)?,
        };
        self.remove_subtree(dir.id, name, child_id);
        if self.is_attached() {
            let local_seq = self.pending.record_local(PendingTarget::Remove {
                path: parent_path.clone(),
                name: name.to_string(),
            });
            self.outbound.push(LocalOp {
                local_seq,
                op: DirectoryOp::DeleteSubDirectory {
                    path: parent_path,
                    name: name.to_string(),
                },
            });
            self.stats.submitted += 1;
        }
        self.emit(DirectoryEvent {
            path: child_path,
            key: None,
            kind: OperationKind::DeleteSubDirectory,
            local: true,
        });
        Ok(true)
    }

    /// Named child, if visible
    pub fn get_sub_directory(
        &self,
        dir: &DirectoryHandle,
        name: &str,
    ) -> DirectoryResult<Option<DirectoryHandle>> {
        let node = self.node(dir)?;
        Ok(node
            .children
            .get(name)
            .and_then(|id| self.nodes.get(id))
            .map(|child| DirectoryHandle {
                id: child.id,
                path: child.path.clone(),
            }))
    }

    /// Child directory names in insertion order
    pub fn sub_directories<'a>(
        &'a self,
        dir: &DirectoryHandle,
    ) -> DirectoryResult<impl Iterator<Item = &'a str>> {
        Ok(self.node(dir)?.child_names())
    }

    /// Resolve an absolute path against the visible tree
    pub fn get_working_directory(&self, path: &TreePath) -> Option<DirectoryHandle> {
        let id = *self.paths.get(path)?;
        let node = self.nodes.get(&id)?;
        Some(DirectoryHandle {
            id,
            path: node.path.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Attach lifecycle
    // ------------------------------------------------------------------

    /// Move the tree into the broadcast log.
    ///
    /// The accumulated private state is returned as one snapshot
    /// document for the host to seed the log with - never as a replayed
    /// operation sequence, so no pending bookkeeping can exist for
    /// pre-attach history. Idempotent once attached.
    pub fn attach(&mut self) -> crate::DirectorySnapshot {
        self.state = AttachState::Attached;
        self.serialize()
    }

    // ------------------------------------------------------------------
    // Change notifications
    // ------------------------------------------------------------------

    /// Register a callback for every event at or below `prefix`
    pub fn subscribe(
        &mut self,
        prefix: TreePath,
        callback: impl FnMut(&DirectoryEvent) + 'static,
    ) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscriptions.push(Subscription {
            id,
            prefix,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.id != id);
        self.subscriptions.len() != before
    }

    fn emit(&mut self, event: DirectoryEvent) {
        for sub in &mut self.subscriptions {
            if event.path.is_under(&sub.prefix) {
                (sub.callback)(&event);
            }
        }
    }

    // ------------------------------------------------------------------
    // Sequenced operation pipeline
    // ------------------------------------------------------------------

    /// Operations waiting for the sequencer
    pub fn drain_outbound(&mut self) -> Vec<LocalOp> {
        std::mem::take(&mut self.outbound)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Apply one operation delivered in global order. Duplicate
    /// delivery (same or older global sequence number) is a no-op.
    pub fn process(&mut self, sequenced: &SequencedOp) -> OpOutcome {
        if !self.is_attached() {
            warn!(
                global_seq = sequenced.global_seq,
                "sequenced op delivered to a detached tree"
            );
            self.stats.dropped += 1;
            return OpOutcome::Dropped(DropReason::Detached);
        }
        if sequenced.global_seq <= self.last_global_seq {
            self.stats.duplicates += 1;
            return OpOutcome::Duplicate;
        }
        self.last_global_seq = sequenced.global_seq;
        let outcome = if sequenced.origin == self.replica {
            self.apply_own(sequenced)
        } else {
            self.apply_remote(sequenced)
        };
        match &outcome {
            OpOutcome::Applied => self.stats.applied += 1,
            OpOutcome::Noop => self.stats.noops += 1,
            OpOutcome::Duplicate => self.stats.duplicates += 1,
            OpOutcome::Dropped(_) => self.stats.dropped += 1,
        }
        outcome
    }

    /// Apply a batch. Application is synchronous within this call, so
    /// observers never see a partially applied batch.
    pub fn process_batch(&mut self, batch: &[SequencedOp]) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for sequenced in batch {
            summary.record(&self.process(sequenced));
        }
        summary
    }

    fn apply_remote(&mut self, sequenced: &SequencedOp) -> OpOutcome {
        let shadowed = self.pending.resolve_incoming(&sequenced.op) == Resolution::Shadowed;
        let origin = sequenced.origin;
        let global_seq = sequenced.global_seq;
        match &sequenced.op {
            DirectoryOp::Set { path, key, value } => self.remote_key_write(
                path,
                key,
                Slot::Present(value.clone()),
                shadowed,
                origin,
                global_seq,
                OperationKind::Set,
            ),
            DirectoryOp::Delete { path, key } => self.remote_key_write(
                path,
                key,
                Slot::Absent,
                shadowed,
                origin,
                global_seq,
                OperationKind::Delete,
            ),
            DirectoryOp::Clear { path, keys } => {
                self.remote_clear(path, keys, origin, global_seq)
            }
            DirectoryOp::CreateSubDirectory { path, name } => {
                self.remote_create(path, name, shadowed)
            }
            DirectoryOp::DeleteSubDirectory { path, name } => self.remote_remove(path, name),
        }
    }

    fn remote_key_write(
        &mut self,
        path: &TreePath,
        key: &str,
        slot: Slot,
        shadowed: bool,
        origin: ReplicaId,
        global_seq: u64,
        kind: OperationKind,
    ) -> OpOutcome {
        let Some(node_id) = self.confirmed_node_id(path) else {
            debug!(%path, key, "remote key op dropped: path does not resolve");
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };

        if !node.keys.contains_key(key) {
            if matches!(slot, Slot::Absent) {
                return OpOutcome::Noop;
            }
            node.keys.insert(
                key.to_string(),
                ValueCell::confirmed(slot, Some(origin), global_seq),
            );
            self.emit(DirectoryEvent {
                path: path.clone(),
                key: Some(key.to_string()),
                kind,
                local: false,
            });
            return OpOutcome::Applied;
        }

        let mut vacant = false;
        if let Some(cell) = node.keys.get_mut(key) {
            cell.confirm(slot, origin, global_seq);
            vacant = cell.is_vacant();
        }
        if shadowed {
            // The pending local write holds a later position in global
            // order; the remote value stays confined to the confirmed
            // slot until then.
            debug!(%path, key, "remote write shadowed by pending local write");
            return OpOutcome::Dropped(DropReason::Shadowed);
        }
        if vacant {
            node.keys.shift_remove(key);
        }
        self.emit(DirectoryEvent {
            path: path.clone(),
            key: Some(key.to_string()),
            kind,
            local: false,
        });
        OpOutcome::Applied
    }

    fn remote_clear(
        &mut self,
        path: &TreePath,
        keys: &[String],
        origin: ReplicaId,
        global_seq: u64,
    ) -> OpOutcome {
        let Some(node_id) = self.confirmed_node_id(path) else {
            debug!(%path, "remote clear dropped: path does not resolve");
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let shadowed: Vec<bool> = keys
            .iter()
            .map(|key| self.pending.key_shadowed(path, key))
            .collect();
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        for (key, key_shadowed) in keys.iter().zip(shadowed) {
            let mut vacant = false;
            if let Some(cell) = node.keys.get_mut(key) {
                cell.confirm(Slot::Absent, origin, global_seq);
                vacant = !key_shadowed && cell.is_vacant();
            }
            if vacant {
                node.keys.shift_remove(key);
            }
        }
        self.emit(DirectoryEvent {
            path: path.clone(),
            key: None,
            kind: OperationKind::Clear,
            local: false,
        });
        OpOutcome::Applied
    }

    fn remote_create(&mut self, path: &TreePath, name: &str, shadowed: bool) -> OpOutcome {
        if TreePath::validate_name(name).is_err() {
            warn!(%path, name, "remote create dropped: malformed name");
            return OpOutcome::Dropped(DropReason::Malformed);
        }
        let Some(parent_id) = self.confirmed_node_id(path) else {
            debug!(%path, name, "remote create dropped: path does not resolve");
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        if shadowed {
            // A pending local delete of this name holds a later position
            // in global order; creating the node now would resurrect it
            // for a moment only.
            debug!(%path, name, "remote create shadowed by pending local delete");
            return OpOutcome::Dropped(DropReason::Shadowed);
        }
        let existing = self
            .nodes
            .get(&parent_id)
            .and_then(|parent| parent.children.get(name).copied());
        if let Some(child_id) = existing {
            // Idempotent: the first create in global order is canonical.
            // An optimistic local twin is confirmed in place; its content
            // is left intact.
            if let Some(child) = self.nodes.get_mut(&child_id) {
                child.confirmed = true;
            }
            return OpOutcome::Noop;
        }
        let child_path = match path.join(name) {
            Ok(p) => p,
            Err(_) => return OpOutcome::Dropped(DropReason::Malformed),
        };
        let child_id = self.alloc_node(child_path.clone(), Some(parent_id), true);
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.insert(name.to_string(), child_id);
        }
        self.emit(DirectoryEvent {
            path: child_path,
            key: None,
            kind: OperationKind::CreateSubDirectory,
            local: false,
        });
        OpOutcome::Applied
    }

    fn remote_remove(&mut self, path: &TreePath, name: &str) -> OpOutcome {
        let Some(parent_id) = self.confirmed_node_id(path) else {
            debug!(%path, name, "remote delete dropped: path does not resolve");
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let Some(child_id) = self
            .nodes
            .get(&parent_id)
            .and_then(|parent| parent.children.get(name).copied())
        else {
            return OpOutcome::Noop;
        };
        let Some(child) = self.nodes.get(&child_id) else {
            return OpOutcome::Noop;
        };
        if !child.confirmed {
            // The sequenced delete targets state this replica never
            // confirmed; the local speculative node is not it.
            return OpOutcome::Noop;
        }
        let child_path = child.path.clone();
        self.remove_subtree(parent_id, name, child_id);
        self.emit(DirectoryEvent {
            path: child_path,
            key: None,
            kind: OperationKind::DeleteSubDirectory,
            local: false,
        });
        OpOutcome::Applied
    }

    fn apply_own(&mut self, sequenced: &SequencedOp) -> OpOutcome {
        let Some(local_seq) = sequenced.local_seq else {
            warn!(
                global_seq = sequenced.global_seq,
                "own op echoed without a local sequence number"
            );
            return OpOutcome::Dropped(DropReason::Malformed);
        };
        if self.pending.acknowledge(local_seq).is_none() {
            warn!(local_seq, "acknowledgment for an unknown local op");
            return OpOutcome::Dropped(DropReason::Malformed);
        }
        let global_seq = sequenced.global_seq;
        match &sequenced.op {
            DirectoryOp::Set { path, key, value } => self.ack_key_write(
                path,
                key,
                Slot::Present(value.clone()),
                local_seq,
                global_seq,
                OperationKind::Set,
            ),
            DirectoryOp::Delete { path, key } => self.ack_key_write(
                path,
                key,
                Slot::Absent,
                local_seq,
                global_seq,
                OperationKind::Delete,
            ),
            DirectoryOp::Clear { path, keys } => self.ack_clear(path, keys, local_seq, global_seq),
            DirectoryOp::CreateSubDirectory { path, name } => self.ack_create(path, name),
            DirectoryOp::DeleteSubDirectory { path, name } => self.ack_remove(path, name),
        }
    }

    fn ack_key_write(
        &mut self,
        path: &TreePath,
        key: &str,
        slot: Slot,
        local_seq: u64,
        global_seq: u64,
        kind: OperationKind,
    ) -> OpOutcome {
        let origin = self.replica;
        let Some(node_id) = self.confirmed_node_id(path) else {
            debug!(%path, key, "acknowledged op targets a deleted path");
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };

        if !node.keys.contains_key(key) {
            // The speculative write was destroyed with its subtree; the
            // op still lands at its global position, as it does on every
            // other replica.
            if matches!(slot, Slot::Absent) {
                return OpOutcome::Noop;
            }
            node.keys.insert(
                key.to_string(),
                ValueCell::confirmed(slot, Some(origin), global_seq),
            );
            self.emit(DirectoryEvent {
                path: path.clone(),
                key: Some(key.to_string()),
                kind,
                local: true,
            });
            return OpOutcome::Applied;
        }

        let mut promoted = false;
        let mut vacant = false;
        let mut still_shadowed = false;
        if let Some(cell) = node.keys.get_mut(key) {
            promoted = cell.acknowledge(local_seq, origin, global_seq);
            if !promoted {
                cell.confirm(slot, origin, global_seq);
            }
            vacant = cell.is_vacant();
            still_shadowed = cell.is_shadowed();
        }
        if vacant {
            node.keys.shift_remove(key);
        }
        if !promoted && !still_shadowed {
            self.emit(DirectoryEvent {
                path: path.clone(),
                key: Some(key.to_string()),
                kind,
                local: true,
            });
        }
        OpOutcome::Applied
    }

    fn ack_clear(
        &mut self,
        path: &TreePath,
        keys: &[String],
        local_seq: u64,
        global_seq: u64,
    ) -> OpOutcome {
        let origin = self.replica;
        let Some(node_id) = self.confirmed_node_id(path) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        for key in keys {
            let mut vacant = false;
            if let Some(cell) = node.keys.get_mut(key) {
                if !cell.acknowledge(local_seq, origin, global_seq) {
                    cell.confirm(Slot::Absent, origin, global_seq);
                }
                vacant = cell.is_vacant();
            }
            if vacant {
                node.keys.shift_remove(key);
            }
        }
        OpOutcome::Applied
    }

    fn ack_create(&mut self, path: &TreePath, name: &str) -> OpOutcome {
        let Some(parent_id) = self.confirmed_node_id(path) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let existing = self
            .nodes
            .get(&parent_id)
            .and_then(|parent| parent.children.get(name).copied());
        if let Some(child_id) = existing {
            if let Some(child) = self.nodes.get_mut(&child_id) {
                child.confirmed = true;
            }
            return OpOutcome::Applied;
        }
        // The optimistic node was deleted by an earlier sequenced op;
        // the create still takes effect here as it does everywhere.
        let child_path = match path.join(name) {
            Ok(p) => p,
            Err(_) => return OpOutcome::Dropped(DropReason::Malformed),
        };
        let child_id = self.alloc_node(child_path.clone(), Some(parent_id), true);
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.insert(name.to_string(), child_id);
        }
        self.emit(DirectoryEvent {
            path: child_path,
            key: None,
            kind: OperationKind::CreateSubDirectory,
            local: true,
        });
        OpOutcome::Applied
    }

    fn ack_remove(&mut self, path: &TreePath, name: &str) -> OpOutcome {
        let Some(parent_id) = self.confirmed_node_id(path) else {
            return OpOutcome::Dropped(DropReason::MissingPath);
        };
        let Some(child_id) = self
            .nodes
            .get(&parent_id)
            .and_then(|parent| parent.children.get(name).copied())
        else {
            // Normal case: the subtree went away at optimistic apply.
            return OpOutcome::Applied;
        };
        if !self.nodes.get(&child_id).is_some_and(|c| c.confirmed) {
            // A locally recreated twin; the sequenced delete is not
            // aimed at it.
            return OpOutcome::Applied;
        }
        let child_path = self.nodes.get(&child_id).map(|c| c.path.clone());
        self.remove_subtree(parent_id, name, child_id);
        if let Some(child_path) = child_path {
            self.emit(DirectoryEvent {
                path: child_path,
                key: None,
                kind: OperationKind::DeleteSubDirectory,
                local: true,
            });
        }
        OpOutcome::Applied
    }

    // ------------------------------------------------------------------
    // Arena plumbing
    // ------------------------------------------------------------------

    fn node(&self, dir: &DirectoryHandle) -> DirectoryResult<&DirectoryNode> {
        self.nodes.get(&dir.id).ok_or_else(|| DirectoryError::StaleHandle {
            path: dir.path.clone(),
        })
    }

    fn node_mut(&mut self, dir: &DirectoryHandle) -> DirectoryResult<&mut DirectoryNode> {
        self.nodes
            .get_mut(&dir.id)
            .ok_or_else(|| DirectoryError::StaleHandle {
                path: dir.path.clone(),
            })
    }

    /// Resolve a path for a sequenced operation: confirmed structure
    /// only. Ancestors of a confirmed node are confirmed by
    /// construction.
    fn confirmed_node_id(&self, path: &TreePath) -> Option<NodeId> {
        let id = *self.paths.get(path)?;
        let node = self.nodes.get(&id)?;
        node.confirmed.then_some(id)
    }

    pub(crate) fn alloc_node(
        &mut self,
        path: TreePath,
        parent: Option<NodeId>,
        confirmed: bool,
    ) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        self.paths.insert(path.clone(), id);
        self.nodes
            .insert(id, DirectoryNode::new(id, path, parent, confirmed));
        id
    }

    fn remove_subtree(&mut self, parent_id: NodeId, name: &str, child_id: NodeId) {
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            parent.children.shift_remove(name);
        }
        let mut stack = vec![child_id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                self.paths.remove(&node.path);
                stack.extend(node.children.values().copied());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ReplicaId = ReplicaId(1);
    const B: ReplicaId = ReplicaId(2);

    fn remote_op(global_seq: u64, origin: ReplicaId, op: DirectoryOp) -> SequencedOp {
        SequencedOp {
            global_seq,
            origin,
            local_seq: None,
            op,
        }
    }

    /// Echo a replica's own outbound ops back at it, starting at
    /// `first_global_seq`.
    fn echo(tree: &mut DirectoryTree, first_global_seq: u64) -> u64 {
        let mut seq = first_global_seq;
        for local in tree.drain_outbound() {
            tree.process(&SequencedOp {
                global_seq: seq,
                origin: tree.replica_id(),
                local_seq: Some(local.local_seq),
                op: local.op,
            });
            seq += 1;
        }
        seq
    }

    #[test]
    fn test_set_get_delete() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "k", Value::from("v")).unwrap();
        assert_eq!(tree.get(&root, "k").unwrap(), Some(&Value::from("v")));
        assert!(tree.has(&root, "k").unwrap());
        assert_eq!(tree.key_count(&root).unwrap(), 1);

        assert!(tree.delete(&root, "k").unwrap());
        assert_eq!(tree.get(&root, "k").unwrap(), None);
        assert!(!tree.delete(&root, "missing").unwrap());
    }

    #[test]
    fn test_undefined_is_distinct_from_absent() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "u", Value::Undefined).unwrap();
        assert_eq!(tree.get(&root, "u").unwrap(), Some(&Value::Undefined));
        assert!(tree.has(&root, "u").unwrap());
        assert_eq!(tree.get(&root, "absent").unwrap(), None);
        assert!(!tree.has(&root, "absent").unwrap());
    }

    #[test]
    fn test_remote_set_and_delete_apply_in_order() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        let set = remote_op(
            1,
            B,
            DirectoryOp::Set {
                path: TreePath::root(),
                key: "k".to_string(),
                value: Value::from(7),
            },
        );
        assert_eq!(tree.process(&set), OpOutcome::Applied);
        assert_eq!(tree.get(&root, "k").unwrap(), Some(&Value::from(7)));

        let del = remote_op(
            2,
            B,
            DirectoryOp::Delete {
                path: TreePath::root(),
                key: "k".to_string(),
            },
        );
        assert_eq!(tree.process(&del), OpOutcome::Applied);
        assert_eq!(tree.get(&root, "k").unwrap(), None);
    }

    #[test]
    fn test_duplicate_global_seq_is_noop() {
        let mut tree = DirectoryTree::attached(A);
        let op = remote_op(
            1,
            B,
            DirectoryOp::Set {
                path: TreePath::root(),
                key: "k".to_string(),
                value: Value::from(1),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Applied);
        assert_eq!(tree.process(&op), OpOutcome::Duplicate);
        assert_eq!(tree.stats().duplicates, 1);
    }

    #[test]
    fn test_pending_local_write_shadows_remote() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "k", Value::from("mine")).unwrap();

        // Remote write sequenced before our pending one.
        let op = remote_op(
            1,
            B,
            DirectoryOp::Set {
                path: TreePath::root(),
                key: "k".to_string(),
                value: Value::from("theirs"),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Dropped(DropReason::Shadowed));
        assert_eq!(tree.get(&root, "k").unwrap(), Some(&Value::from("mine")));

        // Our own op comes back; global order now agrees with us.
        echo(&mut tree, 2);
        assert_eq!(tree.get(&root, "k").unwrap(), Some(&Value::from("mine")));
        assert_eq!(tree.pending_ops(), 0);
    }

    #[test]
    fn test_keys_enumerate_in_insertion_order() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "b", Value::from(1)).unwrap();
        tree.set(&root, "a", Value::from(2)).unwrap();
        tree.set(&root, "c", Value::from(3)).unwrap();
        tree.delete(&root, "a").unwrap();

        let keys: Vec<&str> = tree.keys(&root).unwrap().collect();
        assert_eq!(keys, vec!["b", "c"]);

        let sub = tree.create_sub_directory(&root, "sub").unwrap();
        assert_eq!(tree.get_sub_directory(&root, "sub").unwrap(), Some(sub));
        assert_eq!(tree.get_sub_directory(&root, "missing").unwrap(), None);
    }

    #[test]
    fn test_create_sub_directory_is_idempotent() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        let child = tree.create_sub_directory(&root, "sub").unwrap();
        tree.set(&child, "k", Value::from(1)).unwrap();

        let again = tree.create_sub_directory(&root, "sub").unwrap();
        assert_eq!(child, again);
        assert_eq!(tree.get(&again, "k").unwrap(), Some(&Value::from(1)));
        // Only the first create was submitted.
        let kinds: Vec<_> = tree
            .drain_outbound()
            .into_iter()
            .map(|local| local.op.kind())
            .collect();
        assert_eq!(kinds, vec![OperationKind::CreateSubDirectory, OperationKind::Set]);
    }

    #[test]
    fn test_deleted_subtree_invalidates_handles() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        let child = tree.create_sub_directory(&root, "sub").unwrap();
        let grandchild = tree.create_sub_directory(&child, "inner").unwrap();
        assert!(tree.delete_sub_directory(&root, "sub").unwrap());

        assert!(matches!(
            tree.set(&child, "k", Value::from(1)),
            Err(DirectoryError::StaleHandle { .. })
        ));
        assert!(matches!(
            tree.get(&grandchild, "k"),
            Err(DirectoryError::StaleHandle { .. })
        ));
        assert!(tree
            .get_working_directory(&TreePath::parse("/sub/inner").unwrap())
            .is_none());

        // Recreating the path yields a fresh node; old handles stay stale.
        let fresh = tree.create_sub_directory(&root, "sub").unwrap();
        assert_ne!(fresh, child);
        assert!(tree.set(&child, "k", Value::from(1)).is_err());
    }

    #[test]
    fn test_remote_op_into_deleted_subtree_is_dropped() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        let child = tree.create_sub_directory(&root, "doomed").unwrap();
        echo(&mut tree, 1);
        assert!(tree.contains(&child));

        tree.delete_sub_directory(&root, "doomed").unwrap();
        echo(&mut tree, 2);

        let op = remote_op(
            3,
            B,
            DirectoryOp::Set {
                path: TreePath::parse("/doomed").unwrap(),
                key: "k".to_string(),
                value: Value::from(1),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Dropped(DropReason::MissingPath));
        assert!(tree
            .get_working_directory(&TreePath::parse("/doomed").unwrap())
            .is_none());
    }

    #[test]
    fn test_remote_create_shadowed_by_pending_delete() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.create_sub_directory(&root, "d").unwrap();
        echo(&mut tree, 1);

        // Delete locally but do not acknowledge yet.
        tree.delete_sub_directory(&root, "d").unwrap();

        let op = remote_op(
            2,
            B,
            DirectoryOp::CreateSubDirectory {
                path: TreePath::root(),
                name: "d".to_string(),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Dropped(DropReason::Shadowed));
        assert!(tree
            .get_working_directory(&TreePath::parse("/d").unwrap())
            .is_none());
    }

    #[test]
    fn test_unconfirmed_node_invisible_to_remote_ops() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        // Created locally, not yet sequenced.
        tree.create_sub_directory(&root, "mine").unwrap();

        let op = remote_op(
            1,
            B,
            DirectoryOp::Set {
                path: TreePath::parse("/mine").unwrap(),
                key: "k".to_string(),
                value: Value::from(1),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Dropped(DropReason::MissingPath));
    }

    #[test]
    fn test_remote_create_confirms_local_twin() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        let child = tree.create_sub_directory(&root, "shared").unwrap();
        tree.set(&child, "k", Value::from("local")).unwrap();

        let op = remote_op(
            1,
            B,
            DirectoryOp::CreateSubDirectory {
                path: TreePath::root(),
                name: "shared".to_string(),
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Noop);
        // Content untouched, node now visible to remote ops.
        assert_eq!(tree.get(&child, "k").unwrap(), Some(&Value::from("local")));

        let write = remote_op(
            2,
            B,
            DirectoryOp::Set {
                path: TreePath::parse("/shared").unwrap(),
                key: "other".to_string(),
                value: Value::from(2),
            },
        );
        assert_eq!(tree.process(&write), OpOutcome::Applied);
    }

    #[test]
    fn test_clear_only_touches_captured_keys() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "a", Value::from(1)).unwrap();
        echo(&mut tree, 1);

        // Remote clear that captured only "a" on another replica.
        tree.set(&root, "b", Value::from(2)).unwrap();
        echo(&mut tree, 2);

        let op = remote_op(
            3,
            B,
            DirectoryOp::Clear {
                path: TreePath::root(),
                keys: vec!["a".to_string()],
            },
        );
        assert_eq!(tree.process(&op), OpOutcome::Applied);
        assert_eq!(tree.get(&root, "a").unwrap(), None);
        assert_eq!(tree.get(&root, "b").unwrap(), Some(&Value::from(2)));
    }

    #[test]
    fn test_detached_tree_keeps_history_private() {
        let mut tree = DirectoryTree::new(A);
        let root = tree.root();
        assert!(!tree.is_attached());

        tree.set(&root, "k", Value::from(1)).unwrap();
        tree.create_sub_directory(&root, "sub").unwrap();
        assert!(!tree.has_outbound());
        assert_eq!(tree.pending_ops(), 0);

        let snapshot = tree.attach();
        assert!(tree.is_attached());
        assert_eq!(snapshot.root.keys.len(), 1);
        assert!(snapshot.root.children.contains_key("sub"));

        // Attached from here on: mutations are broadcast.
        tree.set(&root, "k2", Value::from(2)).unwrap();
        assert!(tree.has_outbound());
    }

    #[test]
    fn test_subscription_prefix_and_unsubscribe() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();
        let sub = tree.create_sub_directory(&root, "sub").unwrap();

        let seen: Rc<RefCell<Vec<DirectoryEvent>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let id = tree.subscribe(TreePath::parse("/sub").unwrap(), move |event| {
            sink.borrow_mut().push(event.clone());
        });

        tree.set(&root, "top", Value::from(1)).unwrap();
        tree.set(&sub, "inner", Value::from(2)).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].key.as_deref(), Some("inner"));

        assert!(tree.unsubscribe(id));
        assert!(!tree.unsubscribe(id));
        tree.set(&sub, "inner2", Value::from(3)).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_stats_track_outcomes() {
        let mut tree = DirectoryTree::attached(A);
        let root = tree.root();

        tree.set(&root, "k", Value::from(1)).unwrap();
        assert_eq!(tree.stats().submitted, 1);

        let batch = vec![
            remote_op(
                1,
                B,
                DirectoryOp::Delete {
                    path: TreePath::root(),
                    key: "missing".to_string(),
                },
            ),
            remote_op(
                2,
                B,
                DirectoryOp::Set {
                    path: TreePath::parse("/nowhere").unwrap(),
                    key: "k".to_string(),
                    value: Value::from(1),
                },
            ),
        ];
        let summary = tree.process_batch(&batch);
        assert_eq!(summary.noops, 1);
        assert_eq!(summary.dropped, 1);
    }
}
