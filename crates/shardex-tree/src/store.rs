//! Page-store collaborator boundary.
//!
//! The tree persists through this interface only; it never assumes anything
//! about the medium behind it. `InMemoryPageStore` is the stand-in used by
//! tests and by deployments that checkpoint elsewhere.

use crate::arena::NodeId;
use bytes::Bytes;
use shardex_common::{Result, ShardexError};

/// Node persistence collaborator.
///
/// Ids handed out by `allocate_id` are store-local; the tree remaps its own
/// node ids onto them at checkpoint time.
pub trait PageStore: Send + Sync {
    /// Reads the serialized image of a node.
    fn read_node(&self, id: NodeId) -> Result<Bytes>;

    /// Writes the serialized image of a node.
    fn write_node(&mut self, id: NodeId, data: Bytes) -> Result<()>;

    /// Allocates a fresh node id.
    fn allocate_id(&mut self) -> Result<NodeId>;

    /// Returns a node id to the store.
    fn free_id(&mut self, id: NodeId) -> Result<()>;
}

/// What a restore needs besides the node images themselves.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointMeta {
    /// Store id of the root node.
    pub root: NodeId,
    /// Tree height at checkpoint time.
    pub height: u32,
    /// Entry count at checkpoint time.
    pub len: u64,
}

/// Growable in-memory page store.
pub struct InMemoryPageStore {
    pages: Vec<Option<Bytes>>,
    free: Vec<NodeId>,
}

impl InMemoryPageStore {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of live (allocated, not freed) pages.
    pub fn len(&self) -> usize {
        self.pages.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for InMemoryPageStore {
    fn read_node(&self, id: NodeId) -> Result<Bytes> {
        match self.pages.get(id.as_usize()) {
            Some(Some(data)) => Ok(data.clone()),
            _ => Err(ShardexError::corrupt(format!("{} not in page store", id))),
        }
    }

    fn write_node(&mut self, id: NodeId, data: Bytes) -> Result<()> {
        match self.pages.get_mut(id.as_usize()) {
            Some(slot) => {
                *slot = Some(data);
                Ok(())
            }
            None => Err(ShardexError::corrupt(format!("{} not allocated", id))),
        }
    }

    fn allocate_id(&mut self) -> Result<NodeId> {
        if let Some(id) = self.free.pop() {
            return Ok(id);
        }
        self.pages.push(None);
        Ok(NodeId::from_u64((self.pages.len() - 1) as u64))
    }

    fn free_id(&mut self, id: NodeId) -> Result<()> {
        match self.pages.get_mut(id.as_usize()) {
            Some(slot) => {
                *slot = None;
                self.free.push(id);
                Ok(())
            }
            None => Err(ShardexError::corrupt(format!("{} not allocated", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_write_read() {
        let mut store = InMemoryPageStore::new();
        let id = store.allocate_id().unwrap();
        store.write_node(id, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(store.read_node(id).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_read_unallocated_fails() {
        let store = InMemoryPageStore::new();
        assert!(store.read_node(NodeId::from_u64(0)).is_err());
    }

    #[test]
    fn test_read_freed_fails() {
        let mut store = InMemoryPageStore::new();
        let id = store.allocate_id().unwrap();
        store.write_node(id, Bytes::from_static(b"abc")).unwrap();
        store.free_id(id).unwrap();
        assert!(store.read_node(id).is_err());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_freed_id_is_recycled() {
        let mut store = InMemoryPageStore::new();
        let a = store.allocate_id().unwrap();
        let _b = store.allocate_id().unwrap();
        store.free_id(a).unwrap();
        let c = store.allocate_id().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_write_unallocated_fails() {
        let mut store = InMemoryPageStore::new();
        assert!(store
            .write_node(NodeId::from_u64(3), Bytes::from_static(b"x"))
            .is_err());
    }
}
