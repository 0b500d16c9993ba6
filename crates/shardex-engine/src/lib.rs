//! Shardex engine: a two-level distributed metadata index.
//!
//! File names route through a hash [`PartitionRouter`] to one of several
//! partitions, each backed by an ordered B+ tree mapping name to a metadata
//! record reference. Point operations touch a single partition; ordered
//! reads merge the per-partition scans.

pub mod index;
pub mod metadata;

pub use index::{IndexStats, MetadataIndex};
pub use metadata::{FileMetadata, RecordStore};
pub use shardex_common::{IndexConfig, Result, ShardexError};
pub use shardex_router::PartitionRouter;
pub use shardex_tree::BPlusTree;
