//! Arena ownership of tree nodes.
//!
//! Nodes live in reference-counted slots; ids are stable slot indexes, so
//! child pointers and leaf links are plain `NodeId`s with no lifetime ties.
//! A slot released by a merge goes on the free list, but is recycled only
//! once the arena holds the sole strong reference: a scanner or latch guard
//! still pointing at a retired node keeps its slot out of circulation.

use crate::node::Node;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// Shared handle to a node slot.
pub type NodeArc = Arc<RwLock<Node>>;

/// Stable index of a node slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Slot table for tree nodes.
pub struct NodeArena {
    slots: RwLock<Vec<NodeArc>>,
    free: Mutex<Vec<NodeId>>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds an arena from deserialized nodes; slot i holds nodes[i], so
    /// references serialized as slot indexes stay valid.
    pub fn from_nodes(nodes: Vec<Node>) -> Self {
        let slots = nodes
            .into_iter()
            .map(|n| Arc::new(RwLock::new(n)))
            .collect();
        Self {
            slots: RwLock::new(slots),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Places a node in a slot and returns its id, reusing a released slot
    /// when no outside reference to it remains.
    pub fn alloc(&self, node: Node) -> NodeId {
        {
            let mut free = self.free.lock();
            let slots = self.slots.read();
            if let Some(pos) = free
                .iter()
                .position(|id| Arc::strong_count(&slots[id.as_usize()]) == 1)
            {
                let id = free.swap_remove(pos);
                *slots[id.as_usize()].write() = node;
                return id;
            }
        }

        let mut slots = self.slots.write();
        slots.push(Arc::new(RwLock::new(node)));
        NodeId((slots.len() - 1) as u64)
    }

    /// Returns the slot handle for an id.
    pub fn get(&self, id: NodeId) -> Option<NodeArc> {
        self.slots.read().get(id.as_usize()).cloned()
    }

    /// Marks a slot reusable. The caller has already overwritten the node
    /// with `Node::Retired` under its write latch.
    pub fn release(&self, id: NodeId) {
        self.free.lock().push(id);
    }

    /// Total slots ever allocated (live + released).
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Released slots awaiting reuse.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}
