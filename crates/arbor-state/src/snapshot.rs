//! Snapshots
//!
//! A snapshot is a tree-shaped document of confirmed state: what the
//! sequenced log has established, nothing speculative. Joining replicas
//! bootstrap from one instead of replaying history, and the recorded
//! global sequence number makes them idempotent against re-delivered
//! operations. Loading a snapshot fires no change events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use arbor_core::{DirectoryResult, ReplicaId, Value};

use crate::{DirectoryTree, NodeId, Slot, ValueCell};

/// One directory's confirmed content. Maps are sorted so the document
/// form is canonical.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, SnapshotNode>,
}

/// Document form of a whole tree
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    /// The last sequenced operation folded into this snapshot
    #[serde(default)]
    pub global_seq: u64,
    pub root: SnapshotNode,
}

impl DirectorySnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

impl DirectoryTree {
    /// Capture confirmed state as a document
    pub fn serialize(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            global_seq: self.last_global_seq,
            root: self.snapshot_node(NodeId::ROOT),
        }
    }

    fn snapshot_node(&self, id: NodeId) -> SnapshotNode {
        let Some(node) = self.nodes.get(&id) else {
            return SnapshotNode::default();
        };
        let keys = node
            .keys
            .iter()
            .filter_map(|(key, cell)| match cell.confirmed_slot() {
                Slot::Present(value) => Some((key.clone(), value.clone())),
                Slot::Absent => None,
            })
            .collect();
        let children = node
            .children
            .iter()
            .filter_map(|(name, child_id)| {
                let child = self.nodes.get(child_id)?;
                child
                    .confirmed
                    .then(|| (name.clone(), self.snapshot_node(*child_id)))
            })
            .collect();
        SnapshotNode { keys, children }
    }

    /// Bootstrap a freshly attached replica from a snapshot, without
    /// replaying history and without firing events
    pub fn from_snapshot(
        replica: ReplicaId,
        snapshot: &DirectorySnapshot,
    ) -> DirectoryResult<Self> {
        let mut tree = DirectoryTree::attached(replica);
        tree.last_global_seq = snapshot.global_seq;
        tree.load_node(NodeId::ROOT, &snapshot.root)?;
        Ok(tree)
    }

    fn load_node(&mut self, id: NodeId, snap: &SnapshotNode) -> DirectoryResult<()> {
        let parent_path = match self.nodes.get(&id) {
            Some(node) => node.path.clone(),
            None => return Ok(()),
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            for (key, value) in &snap.keys {
                node.keys.insert(
                    key.clone(),
                    ValueCell::confirmed(Slot::Present(value.clone()), None, 0),
                );
            }
        }
        for (name, child_snap) in &snap.children {
            let child_path = parent_path.join(name)?;
            let child_id = self.alloc_node(child_path, Some(id), true);
            if let Some(parent) = self.nodes.get_mut(&id) {
                parent.children.insert(name.clone(), child_id);
            }
            self.load_node(child_id, child_snap)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arbor_core::TreePath;

    use super::*;

    #[test]
    fn test_snapshot_roundtrip() {
        let mut tree = DirectoryTree::new(ReplicaId::new(1));
        let root = tree.root();
        tree.set(&root, "name", Value::from("arbor")).unwrap();
        let sub = tree.create_sub_directory(&root, "sub").unwrap();
        tree.set(&sub, "inner", Value::Undefined).unwrap();

        let snapshot = tree.serialize();
        let json = snapshot.to_json().unwrap();
        let decoded = DirectorySnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, decoded);

        let loaded = DirectoryTree::from_snapshot(ReplicaId::new(2), &decoded).unwrap();
        let loaded_root = loaded.root();
        assert_eq!(
            loaded.get(&loaded_root, "name").unwrap(),
            Some(&Value::from("arbor"))
        );
        let loaded_sub = loaded
            .get_working_directory(&TreePath::parse("/sub").unwrap())
            .unwrap();
        assert_eq!(
            loaded.get(&loaded_sub, "inner").unwrap(),
            Some(&Value::Undefined)
        );
    }

    #[test]
    fn test_snapshot_excludes_speculative_state() {
        let mut tree = DirectoryTree::attached(ReplicaId::new(1));
        let root = tree.root();
        tree.set(&root, "pending", Value::from(1)).unwrap();
        tree.create_sub_directory(&root, "pending_dir").unwrap();

        let snapshot = tree.serialize();
        assert!(snapshot.root.keys.is_empty());
        assert!(snapshot.root.children.is_empty());
    }

    #[test]
    fn test_snapshot_rejects_malformed_names() {
        let mut snapshot = DirectorySnapshot::default();
        snapshot
            .root
            .children
            .insert("bad/name".to_string(), SnapshotNode::default());
        assert!(DirectoryTree::from_snapshot(ReplicaId::new(1), &snapshot).is_err());
    }

    #[test]
    fn test_snapshot_seq_seeds_duplicate_protection() {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.global_seq = 10;
        let tree = DirectoryTree::from_snapshot(ReplicaId::new(1), &snapshot).unwrap();
        assert_eq!(tree.last_global_seq(), 10);
    }
}
