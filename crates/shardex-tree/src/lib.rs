//! Ordered per-partition index for Shardex.
//!
//! A B+ tree of configurable order with latch-crabbing concurrency, lazy
//! range scans over linked leaves, and a page-store boundary for
//! persistence collaborators.

pub mod arena;
pub mod iter;
pub mod latch;
pub mod node;
pub mod store;
pub mod tree;

pub use arena::{NodeArena, NodeId};
pub use iter::RangeScan;
pub use latch::LatchManager;
pub use store::{CheckpointMeta, InMemoryPageStore, PageStore};
pub use tree::BPlusTree;
