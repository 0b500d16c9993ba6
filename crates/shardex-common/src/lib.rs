//! Shardex common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Shardex components.

pub mod config;
pub mod error;
pub mod types;

pub use config::IndexConfig;
pub use error::{Result, ShardexError};
pub use types::{compare_keys, EntryRef, KeyComparator, PartitionId, MAX_KEY_SIZE};
