//! Configuration structures for Shardex.

use crate::error::{Result, ShardexError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a metadata index instance.
///
/// The key comparator is not part of this structure; it is a plain function
/// pointer supplied at tree construction (see `shardex_common::types`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// B+ tree order: maximum number of children per internal node.
    /// A node holds at most `order - 1` keys. Must be at least 3.
    pub order: usize,
    /// Number of partitions, each backed by its own ordered index.
    pub partition_count: usize,
    /// Number of router buckets at construction.
    pub initial_bucket_count: usize,
    /// Router load factor (entries / buckets) above which the bucket
    /// table doubles. Must be in (0.0, 1.0].
    pub resize_load_factor: f64,
    /// Upper bound on any single lock wait, in milliseconds.
    pub lock_timeout_ms: u64,
    /// When true, inserting an existing key replaces its value in place.
    /// When false, it fails with `DuplicateKey`.
    pub overwrite_on_insert: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            order: 64,
            partition_count: 8,
            initial_bucket_count: 1024,
            resize_load_factor: 0.75,
            lock_timeout_ms: 1000,
            overwrite_on_insert: true,
        }
    }
}

impl IndexConfig {
    /// Validates the configuration, returning `ConfigError` on the first
    /// out-of-range field.
    pub fn validate(&self) -> Result<()> {
        if self.order < 3 {
            return Err(ShardexError::ConfigError(format!(
                "order must be at least 3, got {}",
                self.order
            )));
        }
        if self.partition_count == 0 {
            return Err(ShardexError::ConfigError(
                "partition_count must be at least 1".to_string(),
            ));
        }
        if self.initial_bucket_count == 0 {
            return Err(ShardexError::ConfigError(
                "initial_bucket_count must be at least 1".to_string(),
            ));
        }
        if !(self.resize_load_factor > 0.0 && self.resize_load_factor <= 1.0) {
            return Err(ShardexError::ConfigError(format!(
                "resize_load_factor must be in (0.0, 1.0], got {}",
                self.resize_load_factor
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ShardexError::ConfigError(
                "lock_timeout_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the lock wait bound as a `Duration`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.order, 64);
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.initial_bucket_count, 1024);
        assert_eq!(config.resize_load_factor, 0.75);
        assert_eq!(config.lock_timeout_ms, 1000);
        assert!(config.overwrite_on_insert);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        let config = IndexConfig {
            order: 4,
            partition_count: 2,
            initial_bucket_count: 10,
            resize_load_factor: 0.5,
            lock_timeout_ms: 250,
            overwrite_on_insert: false,
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_order_too_small() {
        let config = IndexConfig {
            order: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("order must be at least 3"));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = IndexConfig {
            partition_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let config = IndexConfig {
            initial_bucket_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_factor_bounds() {
        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            let config = IndexConfig {
                resize_load_factor: bad,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted {}", bad);
        }

        let config = IndexConfig {
            resize_load_factor: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = IndexConfig {
            lock_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = IndexConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: IndexConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.order, deserialized.order);
        assert_eq!(original.partition_count, deserialized.partition_count);
        assert_eq!(
            original.initial_bucket_count,
            deserialized.initial_bucket_count
        );
        assert_eq!(original.resize_load_factor, deserialized.resize_load_factor);
        assert_eq!(original.lock_timeout_ms, deserialized.lock_timeout_ms);
        assert_eq!(original.overwrite_on_insert, deserialized.overwrite_on_insert);
    }

    #[test]
    fn test_clone() {
        let config1 = IndexConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.order, config2.order);
        assert_eq!(config1.lock_timeout_ms, config2.lock_timeout_ms);
    }
}
