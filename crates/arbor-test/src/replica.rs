//! Instrumented replica fixture

use std::sync::Arc;

use parking_lot::Mutex;

use arbor_core::{DirectoryEvent, ReplicaId, TreePath, Value};
use arbor_state::{DirectorySnapshot, DirectoryTree};

/// A replica under test, with every change event recorded through a
/// root-level subscription
pub struct TestReplica {
    pub tree: DirectoryTree,
    events: Arc<Mutex<Vec<DirectoryEvent>>>,
}

impl TestReplica {
    /// Attached replica
    pub fn new(id: u64) -> Self {
        Self::with_tree(DirectoryTree::attached(ReplicaId::new(id)))
    }

    /// Detached replica, private until `tree.attach()`
    pub fn detached(id: u64) -> Self {
        Self::with_tree(DirectoryTree::new(ReplicaId::new(id)))
    }

    /// Replica bootstrapped from a snapshot
    pub fn from_snapshot(id: u64, snapshot: &DirectorySnapshot) -> Self {
        let tree = DirectoryTree::from_snapshot(ReplicaId::new(id), snapshot)
            .expect("snapshot must be well-formed");
        Self::with_tree(tree)
    }

    fn with_tree(mut tree: DirectoryTree) -> Self {
        let events: Arc<Mutex<Vec<DirectoryEvent>>> = Arc::default();
        let sink = Arc::clone(&events);
        tree.subscribe(TreePath::root(), move |event| {
            sink.lock().push(event.clone());
        });
        TestReplica { tree, events }
    }

    /// Everything observed since the last call
    pub fn take_events(&self) -> Vec<DirectoryEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    /// Convenience: set a key at the root
    pub fn set_root(&mut self, key: &str, value: Value) {
        let root = self.tree.root();
        self.tree.set(&root, key, value).expect("root never goes stale");
    }

    /// Convenience: visible root value, cloned
    pub fn get_root(&self, key: &str) -> Option<Value> {
        let root = self.tree.root();
        self.tree.get(&root, key).expect("root never goes stale").cloned()
    }
}
