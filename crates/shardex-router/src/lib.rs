//! Partition routing for Shardex.
//!
//! Level one of the index: a chained hash table mapping keys to the
//! partition that owns them, doubling its bucket table when the load factor
//! crosses the configured threshold.

pub mod router;

pub use router::{PartitionRouter, RouterStats};
