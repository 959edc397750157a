//! Directory nodes
//!
//! Nodes live in an arena owned by the tree, keyed by `NodeId`. Ids are
//! never reused, so a handle to a deleted node stays invalid even if
//! the same path is created again later.

use std::fmt;

use indexmap::IndexMap;

use arbor_core::TreePath;

use crate::ValueCell;

/// Stable arena identity for a directory node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// One directory: ordered keys and ordered child directories
#[derive(Debug)]
pub struct DirectoryNode {
    pub(crate) id: NodeId,
    pub(crate) path: TreePath,
    pub(crate) parent: Option<NodeId>,
    pub(crate) keys: IndexMap<String, ValueCell>,
    pub(crate) children: IndexMap<String, NodeId>,
    /// False while this node's creation has been submitted but not yet
    /// sequenced. Remote operations resolve against confirmed structure
    /// only: replicas that never saw the create drop those ops, so this
    /// replica must too.
    pub(crate) confirmed: bool,
}

impl DirectoryNode {
    pub(crate) fn new(id: NodeId, path: TreePath, parent: Option<NodeId>, confirmed: bool) -> Self {
        DirectoryNode {
            id,
            path,
            parent,
            keys: IndexMap::new(),
            children: IndexMap::new(),
            confirmed,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn path(&self) -> &TreePath {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Keys with a visible value, in insertion order
    pub fn visible_keys(&self) -> impl Iterator<Item = &str> {
        self.keys
            .iter()
            .filter(|(_, cell)| cell.visible().is_present())
            .map(|(key, _)| key.as_str())
    }

    /// Number of visibly present keys
    pub fn visible_len(&self) -> usize {
        self.visible_keys().count()
    }

    /// Child directory names in insertion order
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }
}
