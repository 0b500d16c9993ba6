//! Two-level metadata index.
//!
//! Level one routes a file name to a partition through the hash router;
//! level two is one B+ tree per partition holding name -> record reference.
//! Cross-partition reads (range scans, full listings) merge the per-tree
//! scans with a heap, so results come back in global key order without
//! materializing any single partition first.

use crate::metadata::{FileMetadata, RecordStore};
use ahash::RandomState;
use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use shardex_common::types::{compare_keys, EntryRef, KeyComparator, MAX_KEY_SIZE};
use shardex_common::{IndexConfig, Result, ShardexError};
use shardex_router::{PartitionRouter, RouterStats};
use shardex_tree::{BPlusTree, RangeScan};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::hash::BuildHasher;
use std::time::Duration;

/// Number of key-mutation lock stripes.
const KEY_STRIPES: usize = 64;

/// Inclusive upper bound that no valid key exceeds.
fn max_key() -> Bytes {
    Bytes::from(vec![0xff; MAX_KEY_SIZE])
}

fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(ShardexError::InvalidParameter {
            name: "name".to_string(),
            value: "<empty>".to_string(),
        });
    }
    if name.len() > MAX_KEY_SIZE {
        return Err(ShardexError::KeyTooLarge {
            size: name.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

/// Heap element for the k-way merge. Orders by key through the index
/// comparator, with the source partition as tiebreak.
struct HeapEntry {
    key: Bytes,
    value: EntryRef,
    source: usize,
    compare: KeyComparator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(self.key.as_ref(), other.key.as_ref())
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Aggregate statistics across both index levels.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_files: u64,
    pub partition_count: usize,
    pub partition_lens: Vec<u64>,
    pub tree_heights: Vec<u32>,
    pub tag_count: usize,
    pub router: RouterStats,
}

/// Distributed metadata index: a partition router over ordered per-partition
/// trees, with a tag inverted index on the side.
pub struct MetadataIndex {
    router: PartitionRouter,
    partitions: Vec<BPlusTree>,
    records: RecordStore,
    tags: RwLock<HashMap<String, BTreeSet<Bytes>>>,
    /// Striped mutation locks: insert and delete of the same name serialize
    /// here, so the router mapping and the tree entry change together.
    key_locks: Vec<Mutex<()>>,
    stripe_hasher: RandomState,
    cmp: KeyComparator,
    timeout: Duration,
}

impl MetadataIndex {
    /// Builds an index with the default byte-lexicographic comparator.
    pub fn new(config: IndexConfig) -> Result<Self> {
        Self::with_comparator(config, compare_keys)
    }

    /// Builds an index ordering keys through a caller-supplied comparator.
    pub fn with_comparator(config: IndexConfig, cmp: KeyComparator) -> Result<Self> {
        config.validate()?;
        let timeout = config.lock_timeout();
        let router = PartitionRouter::new(&config)?;
        let partitions = (0..config.partition_count)
            .map(|_| {
                BPlusTree::with_comparator(config.order, timeout, config.overwrite_on_insert, cmp)
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "metadata index ready: {} partitions, order {}, {} buckets",
            config.partition_count, config.order, config.initial_bucket_count
        );
        Ok(Self {
            router,
            partitions,
            records: RecordStore::new(),
            tags: RwLock::new(HashMap::new()),
            key_locks: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
            stripe_hasher: RandomState::with_seeds(
                0x7368_6172_6465_785f,
                0x7374_7269_7065_5f68,
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
            ),
            cmp,
            timeout,
        })
    }

    /// Locks the mutation stripe for `key` with the configured wait bound.
    fn lock_key(&self, key: &[u8]) -> Result<MutexGuard<'_, ()>> {
        let stripe = (self.stripe_hasher.hash_one(key) % KEY_STRIPES as u64) as usize;
        self.key_locks[stripe]
            .try_lock_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())
    }

    fn lock_timeout_err(&self) -> ShardexError {
        ShardexError::LockTimeout {
            waited_ms: self.timeout.as_millis() as u64,
        }
    }

    fn tree_for(&self, partition: shardex_common::PartitionId) -> Result<&BPlusTree> {
        self.partitions
            .get(partition.as_usize())
            .ok_or_else(|| ShardexError::corrupt(format!("router produced unknown {}", partition)))
    }

    fn record_for(&self, entry: EntryRef) -> Result<FileMetadata> {
        self.records
            .get(entry)
            .ok_or_else(|| ShardexError::corrupt(format!("dangling {}", entry)))
    }

    fn add_tags(&self, tags: &[String], key: &Bytes) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut map = self
            .tags
            .try_write_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())?;
        for tag in tags {
            map.entry(tag.clone()).or_default().insert(key.clone());
        }
        Ok(())
    }

    fn drop_tags(&self, tags: &[String], key: &[u8]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut map = self
            .tags
            .try_write_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())?;
        for tag in tags {
            if let Some(keys) = map.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    map.remove(tag);
                }
            }
        }
        Ok(())
    }

    /// Inserts a record keyed by its file name. Returns the replaced record
    /// when the name already existed and overwrite is configured; fails with
    /// `DuplicateKey` when it is not.
    pub fn insert(&self, record: FileMetadata) -> Result<Option<FileMetadata>> {
        let key = Bytes::from(record.name.clone().into_bytes());
        validate_name(key.as_ref())?;
        let _stripe = self.lock_key(key.as_ref())?;

        let freshly_mapped = self.router.partition_of(key.as_ref())?.is_none();
        let partition = self.router.route(key.as_ref())?;
        let tree = self.tree_for(partition)?;

        let tags = record.tags.clone();
        let entry = self.records.insert(record);
        let previous = match tree.insert(key.as_ref(), entry) {
            Ok(previous) => previous,
            Err(e) => {
                // The slot never became reachable; reclaim it, and unmap a
                // routing entry this insert created.
                self.records.remove(entry);
                if freshly_mapped {
                    self.router.remove(key.as_ref())?;
                }
                return Err(e);
            }
        };

        let replaced = match previous {
            Some(old) => {
                let old_record = self.record_for(old)?;
                self.records.remove(old);
                self.drop_tags(&old_record.tags, key.as_ref())?;
                Some(old_record)
            }
            None => None,
        };
        self.add_tags(&tags, &key)?;
        Ok(replaced)
    }

    /// Point lookup by file name. Absent names are `Ok(None)`.
    pub fn lookup(&self, name: &str) -> Result<Option<FileMetadata>> {
        let key = name.as_bytes();
        let partition = match self.router.partition_of(key)? {
            Some(partition) => partition,
            None => return Ok(None),
        };
        match self.tree_for(partition)?.lookup(key)? {
            Some(entry) => Ok(Some(self.record_for(entry)?)),
            None => Ok(None),
        }
    }

    /// Whether `name` is indexed.
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.lookup(name)?.is_some())
    }

    /// Removes a record by file name, returning it.
    pub fn delete(&self, name: &str) -> Result<FileMetadata> {
        let key = name.as_bytes();
        validate_name(key)?;
        let _stripe = self.lock_key(key)?;

        let partition = match self.router.partition_of(key)? {
            Some(partition) => partition,
            None => return Err(ShardexError::KeyNotFound),
        };
        let entry = self.tree_for(partition)?.delete(key)?;
        self.router.remove(key)?;
        let record = self.record_for(entry)?;
        self.records.remove(entry);
        self.drop_tags(&record.tags, key)?;
        Ok(record)
    }

    /// Merges the per-partition scans of `[low, high]` into one ordered run.
    fn merged_entries(&self, low: &[u8], high: &[u8]) -> Result<Vec<(Bytes, EntryRef)>> {
        let mut scans: Vec<RangeScan<'_>> = self
            .partitions
            .iter()
            .map(|tree| tree.range_scan(low, high))
            .collect::<Result<Vec<_>>>()?;

        let mut heap = BinaryHeap::with_capacity(scans.len());
        for (source, scan) in scans.iter_mut().enumerate() {
            if let Some(item) = scan.next() {
                let (key, value) = item?;
                heap.push(Reverse(HeapEntry {
                    key,
                    value,
                    source,
                    compare: self.cmp,
                }));
            }
        }

        let mut out = Vec::new();
        while let Some(Reverse(entry)) = heap.pop() {
            let source = entry.source;
            out.push((entry.key, entry.value));
            if let Some(item) = scans[source].next() {
                let (key, value) = item?;
                heap.push(Reverse(HeapEntry {
                    key,
                    value,
                    source,
                    compare: self.cmp,
                }));
            }
        }
        Ok(out)
    }

    /// Records with `low <= name <= high`, in key order across all
    /// partitions.
    pub fn range_scan(&self, low: &str, high: &str) -> Result<Vec<FileMetadata>> {
        self.merged_entries(low.as_bytes(), high.as_bytes())?
            .into_iter()
            .map(|(_, entry)| self.record_for(entry))
            .collect()
    }

    /// Every record, in key order (or reversed).
    pub fn list_all(&self, ascending: bool) -> Result<Vec<FileMetadata>> {
        // Orient the sentinel bounds through the comparator; a reversed
        // ordering puts the all-0xff sentinel at the low end.
        let empty = Bytes::new();
        let sentinel = max_key();
        let (low, high) = if (self.cmp)(empty.as_ref(), sentinel.as_ref()) == Ordering::Greater {
            (sentinel, empty)
        } else {
            (empty, sentinel)
        };
        let mut records = self
            .merged_entries(low.as_ref(), high.as_ref())?
            .into_iter()
            .map(|(_, entry)| self.record_for(entry))
            .collect::<Result<Vec<_>>>()?;
        if !ascending {
            records.reverse();
        }
        Ok(records)
    }

    /// Records carrying `tag`, ordered by name bytes.
    pub fn search_by_tag(&self, tag: &str) -> Result<Vec<FileMetadata>> {
        let keys: Vec<Bytes> = {
            let map = self
                .tags
                .try_read_for(self.timeout)
                .ok_or_else(|| self.lock_timeout_err())?;
            map.get(tag)
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default()
        };

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let partition = match self.router.partition_of(key.as_ref())? {
                Some(partition) => partition,
                None => continue,
            };
            if let Some(entry) = self.tree_for(partition)?.lookup(key.as_ref())? {
                out.push(self.record_for(entry)?);
            }
        }
        Ok(out)
    }

    /// Number of indexed records.
    pub fn len(&self) -> u64 {
        self.partitions.iter().map(|tree| tree.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Statistics across the router, the trees, and the tag index.
    pub fn stats(&self) -> Result<IndexStats> {
        let tag_count = self
            .tags
            .try_read_for(self.timeout)
            .ok_or_else(|| self.lock_timeout_err())?
            .len();
        Ok(IndexStats {
            total_files: self.len(),
            partition_count: self.partitions.len(),
            partition_lens: self.partitions.iter().map(|tree| tree.len()).collect(),
            tree_heights: self.partitions.iter().map(|tree| tree.height()).collect(),
            tag_count,
            router: self.router.stats()?,
        })
    }

    /// Structural audit of every partition tree.
    pub fn check_invariants(&self) -> Result<()> {
        for tree in &self.partitions {
            tree.check_invariants()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> IndexConfig {
        IndexConfig {
            order: 4,
            partition_count: 4,
            initial_bucket_count: 16,
            lock_timeout_ms: 500,
            ..Default::default()
        }
    }

    fn file(name: &str) -> FileMetadata {
        FileMetadata::new(name, 100, "alice")
    }

    #[test]
    fn test_insert_lookup_delete() {
        let index = MetadataIndex::new(small_config()).unwrap();
        assert!(index.insert(file("a.txt")).unwrap().is_none());
        assert_eq!(index.lookup("a.txt").unwrap().unwrap().name, "a.txt");
        assert_eq!(index.len(), 1);

        let removed = index.delete("a.txt").unwrap();
        assert_eq!(removed.name, "a.txt");
        assert!(index.is_empty());
        assert_eq!(index.lookup("a.txt").unwrap(), None);
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let index = MetadataIndex::new(small_config()).unwrap();
        assert_eq!(index.lookup("nope").unwrap(), None);
        assert!(!index.contains("nope").unwrap());
    }

    #[test]
    fn test_overwrite_returns_previous() {
        let index = MetadataIndex::new(small_config()).unwrap();
        index.insert(file("a.txt")).unwrap();
        let mut newer = file("a.txt");
        newer.size = 999;
        let old = index.insert(newer).unwrap().unwrap();
        assert_eq!(old.size, 100);
        assert_eq!(index.lookup("a.txt").unwrap().unwrap().size, 999);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected_when_overwrite_disabled() {
        let config = IndexConfig {
            overwrite_on_insert: false,
            ..small_config()
        };
        let index = MetadataIndex::new(config).unwrap();
        index.insert(file("a.txt")).unwrap();
        assert!(matches!(
            index.insert(file("a.txt")),
            Err(ShardexError::DuplicateKey)
        ));
        // The losing record must not leak a slot or clobber the original,
        // and the existing name keeps its routing entry.
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup("a.txt").unwrap().unwrap().size, 100);
        assert_eq!(index.stats().unwrap().router.entry_count, 1);
    }

    #[test]
    fn test_rejected_insert_leaves_no_router_state() {
        let index = MetadataIndex::new(small_config()).unwrap();

        let oversized = "x".repeat(MAX_KEY_SIZE + 1);
        assert!(matches!(
            index.insert(file(&oversized)),
            Err(ShardexError::KeyTooLarge { .. })
        ));
        assert!(matches!(
            index.insert(file("")),
            Err(ShardexError::InvalidParameter { .. })
        ));

        let stats = index.stats().unwrap();
        assert_eq!(stats.router.entry_count, 0);
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.router.load_factor, 0.0);
    }

    #[test]
    fn test_merged_scan_is_globally_ordered() {
        let index = MetadataIndex::new(small_config()).unwrap();
        for n in [42u32, 7, 19, 3, 88, 55, 21, 64, 1, 99] {
            index.insert(file(&format!("{:03}", n))).unwrap();
        }
        let names: Vec<String> = index
            .list_all(true)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        let mut expected = names.clone();
        expected.sort();
        assert_eq!(names, expected);
        assert_eq!(names.len(), 10);

        let descending = index.list_all(false).unwrap();
        let mut reversed = expected.clone();
        reversed.reverse();
        assert_eq!(
            descending.into_iter().map(|r| r.name).collect::<Vec<_>>(),
            reversed
        );
    }

    #[test]
    fn test_range_scan_bounds_inclusive() {
        let index = MetadataIndex::new(small_config()).unwrap();
        for n in 0..30u32 {
            index.insert(file(&format!("{:03}", n))).unwrap();
        }
        let names: Vec<String> = index
            .range_scan("010", "015")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["010", "011", "012", "013", "014", "015"]);
    }

    #[test]
    fn test_tag_search_tracks_mutations() {
        let index = MetadataIndex::new(small_config()).unwrap();
        index
            .insert(file("a.txt").with_tags(["docs", "draft"]))
            .unwrap();
        index.insert(file("b.txt").with_tags(["docs"])).unwrap();

        let docs = index.search_by_tag("docs").unwrap();
        assert_eq!(docs.len(), 2);

        index.delete("a.txt").unwrap();
        assert_eq!(index.search_by_tag("docs").unwrap().len(), 1);
        assert!(index.search_by_tag("draft").unwrap().is_empty());

        // Overwriting with different tags replaces the old entries.
        index.insert(file("b.txt").with_tags(["archive"])).unwrap();
        assert!(index.search_by_tag("docs").unwrap().is_empty());
        assert_eq!(index.search_by_tag("archive").unwrap().len(), 1);
    }

    #[test]
    fn test_stats_shape() {
        let index = MetadataIndex::new(small_config()).unwrap();
        for n in 0..20u32 {
            index
                .insert(file(&format!("{:03}", n)).with_tags(["bulk"]))
                .unwrap();
        }
        let stats = index.stats().unwrap();
        assert_eq!(stats.total_files, 20);
        assert_eq!(stats.partition_count, 4);
        assert_eq!(stats.partition_lens.iter().sum::<u64>(), 20);
        assert_eq!(stats.tree_heights.len(), 4);
        assert_eq!(stats.tag_count, 1);
        assert_eq!(stats.router.entry_count, 20);
    }

    #[test]
    fn test_custom_comparator_orders_listing() {
        fn reverse_order(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
            b.cmp(a)
        }
        let config = IndexConfig {
            partition_count: 2,
            ..small_config()
        };
        let index = MetadataIndex::with_comparator(config, reverse_order).unwrap();
        for name in ["b", "a", "c"] {
            index.insert(file(name)).unwrap();
        }
        // Under the reversed comparator, "c" is the smallest key.
        let names: Vec<String> = index
            .range_scan("c", "a")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }
}
