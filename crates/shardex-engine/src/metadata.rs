//! File metadata records and the slab that owns them.
//!
//! The ordered trees store `EntryRef` values only; the actual records live
//! here, addressed by slot. Freed slots go on a free list and are handed out
//! again on the next insert.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardex_common::EntryRef;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Metadata for one indexed file. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub owner: String,
    pub created_at: u64,
    pub modified_at: u64,
    pub permissions: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>, size: u64, owner: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            name: name.into(),
            size,
            owner: owner.into(),
            created_at: now,
            modified_at: now,
            permissions: "rw-r--r--".to_string(),
            tags: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions = permissions.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Bumps the modification timestamp.
    pub fn touch(&mut self) {
        self.modified_at = unix_now();
    }
}

struct Slots {
    slots: Vec<Option<FileMetadata>>,
    free: Vec<u64>,
}

/// Slab of metadata records addressed by [`EntryRef`].
pub struct RecordStore {
    inner: RwLock<Slots>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Stores a record and returns its reference.
    pub fn insert(&self, record: FileMetadata) -> EntryRef {
        let mut inner = self.inner.write();
        match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot as usize] = Some(record);
                EntryRef::new(slot)
            }
            None => {
                inner.slots.push(Some(record));
                EntryRef::new((inner.slots.len() - 1) as u64)
            }
        }
    }

    /// Returns a copy of the record behind `entry`, if the slot is live.
    pub fn get(&self, entry: EntryRef) -> Option<FileMetadata> {
        self.inner
            .read()
            .slots
            .get(entry.as_u64() as usize)
            .and_then(|slot| slot.clone())
    }

    /// Removes and returns the record behind `entry`. The slot is recycled.
    pub fn remove(&self, entry: EntryRef) -> Option<FileMetadata> {
        let mut inner = self.inner.write();
        let record = inner
            .slots
            .get_mut(entry.as_u64() as usize)
            .and_then(Option::take);
        if record.is_some() {
            inner.free.push(entry.as_u64());
        }
        record
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let store = RecordStore::new();
        let entry = store.insert(FileMetadata::new("a.txt", 10, "alice"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(entry).unwrap().name, "a.txt");

        let removed = store.remove(entry).unwrap();
        assert_eq!(removed.name, "a.txt");
        assert_eq!(store.get(entry), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_remove_twice_returns_none() {
        let store = RecordStore::new();
        let entry = store.insert(FileMetadata::new("a.txt", 10, "alice"));
        assert!(store.remove(entry).is_some());
        assert!(store.remove(entry).is_none());
    }

    #[test]
    fn test_freed_slot_is_recycled() {
        let store = RecordStore::new();
        let a = store.insert(FileMetadata::new("a.txt", 1, "alice"));
        let _b = store.insert(FileMetadata::new("b.txt", 2, "bob"));
        store.remove(a);
        let c = store.insert(FileMetadata::new("c.txt", 3, "carol"));
        assert_eq!(c, a);
        assert_eq!(store.get(c).unwrap().name, "c.txt");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_metadata_builder() {
        let meta = FileMetadata::new("report.pdf", 4096, "alice")
            .with_permissions("r--r--r--")
            .with_tags(["finance", "q3"]);
        assert_eq!(meta.permissions, "r--r--r--");
        assert_eq!(meta.tags, vec!["finance", "q3"]);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.modified_at);
    }

    #[test]
    fn test_touch_moves_modified_at() {
        let mut meta = FileMetadata::new("a.txt", 1, "alice");
        meta.modified_at = 0;
        meta.touch();
        assert!(meta.modified_at >= meta.created_at);
    }

    #[test]
    fn test_metadata_serde_roundtrip() {
        let meta = FileMetadata::new("a.txt", 42, "alice").with_tags(["x"]);
        let json = serde_json::to_string(&meta).unwrap();
        let back: FileMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }
}
