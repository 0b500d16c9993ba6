//! Bounded-wait node latches.
//!
//! Every node latch in the tree is acquired here, so the configured wait
//! bound applies uniformly. Guards own an `Arc` to the slot, which lets the
//! crabbing descent keep a stack of retained ancestor latches without
//! borrowing from the arena.

use crate::arena::NodeArc;
use crate::node::Node;
use log::warn;
use shardex_common::{Result, ShardexError};
use std::time::Duration;

/// Shared (read) latch on a node slot.
pub type NodeReadGuard = parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, Node>;

/// Exclusive (write) latch on a node slot.
pub type NodeWriteGuard = parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, Node>;

/// Acquisition point for node latches with a uniform wait bound.
#[derive(Clone, Copy)]
pub struct LatchManager {
    timeout: Duration,
}

impl LatchManager {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured wait bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquires a shared latch, failing with `LockTimeout` once the wait
    /// bound is exhausted.
    pub fn read(&self, node: &NodeArc) -> Result<NodeReadGuard> {
        node.try_read_arc_for(self.timeout)
            .ok_or_else(|| self.timed_out("read"))
    }

    /// Acquires an exclusive latch, failing with `LockTimeout` once the wait
    /// bound is exhausted.
    pub fn write(&self, node: &NodeArc) -> Result<NodeWriteGuard> {
        node.try_write_arc_for(self.timeout)
            .ok_or_else(|| self.timed_out("write"))
    }

    fn timed_out(&self, mode: &str) -> ShardexError {
        let waited_ms = self.timeout.as_millis() as u64;
        warn!("{} latch wait exhausted after {} ms", mode, waited_ms);
        ShardexError::LockTimeout { waited_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LeafNode;
    use parking_lot::RwLock;
    use std::sync::Arc;

    fn leaf_arc() -> NodeArc {
        Arc::new(RwLock::new(Node::Leaf(LeafNode::new())))
    }

    #[test]
    fn test_read_and_write_acquire() {
        let latches = LatchManager::new(Duration::from_millis(50));
        let node = leaf_arc();

        let r1 = latches.read(&node).unwrap();
        let r2 = latches.read(&node).unwrap();
        assert!(r1.is_leaf());
        assert!(r2.is_leaf());
        drop((r1, r2));

        let w = latches.write(&node).unwrap();
        assert!(w.is_leaf());
    }

    #[test]
    fn test_write_blocked_times_out() {
        let latches = LatchManager::new(Duration::from_millis(20));
        let node = leaf_arc();

        let _held = latches.read(&node).unwrap();
        let err = latches.write(&node).unwrap_err();
        assert!(matches!(err, ShardexError::LockTimeout { waited_ms: 20 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_read_blocked_by_writer_times_out() {
        let latches = LatchManager::new(Duration::from_millis(20));
        let node = leaf_arc();

        let _held = latches.write(&node).unwrap();
        assert!(latches.read(&node).is_err());
    }

    #[test]
    fn test_guard_release_unblocks() {
        let latches = LatchManager::new(Duration::from_millis(20));
        let node = leaf_arc();

        let held = latches.write(&node).unwrap();
        drop(held);
        assert!(latches.write(&node).is_ok());
    }
}
