//! Hash-partition routing.
//!
//! The bucket table sits behind a reader-writer lock: routine operations
//! take the read side plus one bucket mutex, a resize takes the write side,
//! rehashes into a doubled table, and swaps it in with a bumped version.
//! Lock order is always table-then-bucket and bucket locks are never held
//! across the swap, so readers observe either the old table or the new one,
//! never a half-built mix.

use ahash::RandomState;
use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use shardex_common::types::PartitionId;
use shardex_common::{IndexConfig, Result, ShardexError};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fixed hasher seeds: a key must hash identically for the lifetime of the
/// router, including across resizes.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5149_4f4e_5f52_4f55,
    0x5445_525f_5345_4544,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
);

/// One routing entry in a bucket chain.
#[derive(Debug, Clone)]
struct RouterEntry {
    hash: u64,
    key: Bytes,
    partition: PartitionId,
}

/// A generation of the bucket table.
struct BucketTable {
    buckets: Vec<Mutex<Vec<RouterEntry>>>,
    version: u64,
}

impl BucketTable {
    fn new(bucket_count: usize, version: u64) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Mutex::new(Vec::new())).collect(),
            version,
        }
    }
}

/// Routing statistics, in the shape operators expect from a chained hash
/// index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterStats {
    pub bucket_count: usize,
    pub entry_count: usize,
    pub load_factor: f64,
    pub non_empty_buckets: usize,
    pub max_chain_len: usize,
    pub avg_chain_len: f64,
    pub table_version: u64,
}

/// Maps keys to the partition responsible for them.
pub struct PartitionRouter {
    table: RwLock<BucketTable>,
    hasher: RandomState,
    entries: AtomicUsize,
    partition_count: usize,
    resize_load_factor: f64,
    timeout: Duration,
}

impl PartitionRouter {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            table: RwLock::new(BucketTable::new(config.initial_bucket_count, 0)),
            hasher: RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3),
            entries: AtomicUsize::new(0),
            partition_count: config.partition_count,
            resize_load_factor: config.resize_load_factor,
            timeout: config.lock_timeout(),
        })
    }

    fn lock_timeout_err(&self) -> ShardexError {
        ShardexError::LockTimeout {
            waited_ms: self.timeout.as_millis() as u64,
        }
    }

    fn table_read(&self) -> Result<RwLockReadGuard<'_, BucketTable>> {
        self.table
            .try_read_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())
    }

    fn table_write(&self) -> Result<RwLockWriteGuard<'_, BucketTable>> {
        self.table
            .try_write_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(ShardexError::InvalidParameter {
                name: "key".to_string(),
                value: "<empty>".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the partition for `key`, assigning one on first sight.
    ///
    /// Routing is stable: a mapped key returns the same partition on every
    /// call, across resizes. A first-sight assignment that pushes the load
    /// factor over the threshold resizes before returning.
    pub fn route(&self, key: &[u8]) -> Result<PartitionId> {
        Self::validate_key(key)?;
        let hash = self.hasher.hash_one(key);

        let (partition, needs_resize) = {
            let table = self.table_read()?;
            let idx = (hash % table.buckets.len() as u64) as usize;
            let mut bucket = table.buckets[idx]
                .try_lock_for(self.timeout)
                .ok_or_else(|| self.lock_timeout_err())?;

            if let Some(entry) = bucket
                .iter()
                .find(|e| e.hash == hash && e.key.as_ref() == key)
            {
                return Ok(entry.partition);
            }

            let partition = PartitionId::new((hash % self.partition_count as u64) as u32);
            bucket.push(RouterEntry {
                hash,
                key: Bytes::copy_from_slice(key),
                partition,
            });
            let count = self.entries.fetch_add(1, Ordering::AcqRel) + 1;
            let load = count as f64 / table.buckets.len() as f64;
            (partition, load > self.resize_load_factor)
        };

        if needs_resize {
            self.resize()?;
        }
        Ok(partition)
    }

    /// Returns the partition `key` is mapped to, without assigning one.
    pub fn partition_of(&self, key: &[u8]) -> Result<Option<PartitionId>> {
        Self::validate_key(key)?;
        let hash = self.hasher.hash_one(key);

        let table = self.table_read()?;
        let idx = (hash % table.buckets.len() as u64) as usize;
        let bucket = table.buckets[idx]
            .try_lock_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())?;
        Ok(bucket
            .iter()
            .find(|e| e.hash == hash && e.key.as_ref() == key)
            .map(|e| e.partition))
    }

    /// Unmaps a key. A later `route` may assign it a different partition.
    pub fn remove(&self, key: &[u8]) -> Result<PartitionId> {
        Self::validate_key(key)?;
        let hash = self.hasher.hash_one(key);

        let table = self.table_read()?;
        let idx = (hash % table.buckets.len() as u64) as usize;
        let mut bucket = table.buckets[idx]
            .try_lock_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())?;

        match bucket
            .iter()
            .position(|e| e.hash == hash && e.key.as_ref() == key)
        {
            Some(pos) => {
                let entry = bucket.swap_remove(pos);
                self.entries.fetch_sub(1, Ordering::AcqRel);
                Ok(entry.partition)
            }
            None => Err(ShardexError::KeyNotFound),
        }
    }

    /// Doubles the table under the exclusive resize lock and swaps it in.
    fn resize(&self) -> Result<()> {
        let mut table = self.table_write()?;

        // Another thread may have resized while we waited.
        let count = self.entries.load(Ordering::Acquire);
        if count as f64 / table.buckets.len() as f64 <= self.resize_load_factor {
            return Ok(());
        }

        let new_count = table.buckets.len() * 2;
        let mut new_buckets: Vec<Mutex<Vec<RouterEntry>>> =
            (0..new_count).map(|_| Mutex::new(Vec::new())).collect();
        for bucket in &mut table.buckets {
            for entry in std::mem::take(bucket.get_mut()) {
                let idx = (entry.hash % new_count as u64) as usize;
                new_buckets[idx].get_mut().push(entry);
            }
        }
        let version = table.version + 1;
        *table = BucketTable {
            buckets: new_buckets,
            version,
        };
        debug!("router resized to {} buckets (version {})", new_count, version);
        Ok(())
    }

    /// Number of mapped keys.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.table.read().buckets.len()
    }

    /// Current load factor.
    pub fn load_factor(&self) -> f64 {
        let table = self.table.read();
        self.len() as f64 / table.buckets.len() as f64
    }

    /// Number of partitions this router assigns into.
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Chain-level statistics over the current table generation.
    pub fn stats(&self) -> Result<RouterStats> {
        let table = self.table_read()?;
        let mut entry_count = 0;
        let mut non_empty = 0;
        let mut max_chain = 0;
        for bucket in &table.buckets {
            let chain = bucket
                .try_lock_for(self.timeout)
                .ok_or_else(|| self.lock_timeout_err())?
                .len();
            entry_count += chain;
            if chain > 0 {
                non_empty += 1;
                max_chain = max_chain.max(chain);
            }
        }
        let bucket_count = table.buckets.len();
        Ok(RouterStats {
            bucket_count,
            entry_count,
            load_factor: entry_count as f64 / bucket_count as f64,
            non_empty_buckets: non_empty,
            max_chain_len: max_chain,
            avg_chain_len: if non_empty == 0 {
                0.0
            } else {
                entry_count as f64 / non_empty as f64
            },
            table_version: table.version,
        })
    }
}
