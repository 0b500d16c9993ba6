//! Shared types for Shardex components.

use std::fmt;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 256;

/// Ordering function applied to raw key bytes. Supplied at tree
/// construction; defaults to [`compare_keys`].
pub type KeyComparator = fn(&[u8], &[u8]) -> std::cmp::Ordering;

/// Key comparison using u64 prefix for 8+ byte keys.
/// Falls back to slice comparison for shorter keys or when prefix matches.
#[inline(always)]
pub fn compare_keys(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    // For 8+ byte keys, compare first 8 bytes as u64 (big-endian for sort order)
    if a.len() >= 8 && b.len() >= 8 {
        let a_prefix = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
        let b_prefix = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        if a_prefix != b_prefix {
            return a_prefix.cmp(&b_prefix);
        }
        // Prefix matched, compare remaining bytes
        if a.len() == 8 && b.len() == 8 {
            return std::cmp::Ordering::Equal;
        }
    }
    a.cmp(b)
}

/// Opaque reference to a metadata record. The ordered index stores these
/// as values; only the record store interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef(u64);

impl EntryRef {
    /// Creates an entry reference from a raw slot value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw slot value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Reconstructs an entry reference from its raw value.
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{}", self.0)
    }
}

/// Identifier of the partition a key routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a partition identifier.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the partition number.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the partition number as an index into a partition vector.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_compare_short_keys() {
        assert_eq!(compare_keys(b"a", b"b"), Ordering::Less);
        assert_eq!(compare_keys(b"b", b"a"), Ordering::Greater);
        assert_eq!(compare_keys(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(compare_keys(b"ab", b"abc"), Ordering::Less);
        assert_eq!(compare_keys(b"", b"a"), Ordering::Less);
    }

    #[test]
    fn test_compare_long_keys_prefix_differs() {
        assert_eq!(compare_keys(b"aaaaaaaa", b"aaaaaaab"), Ordering::Less);
        assert_eq!(compare_keys(b"zzzzzzzz", b"aaaaaaaa"), Ordering::Greater);
    }

    #[test]
    fn test_compare_long_keys_prefix_matches() {
        assert_eq!(compare_keys(b"aaaaaaaa", b"aaaaaaaa"), Ordering::Equal);
        assert_eq!(compare_keys(b"aaaaaaaax", b"aaaaaaaa"), Ordering::Greater);
        assert_eq!(compare_keys(b"aaaaaaaax", b"aaaaaaaay"), Ordering::Less);
    }

    #[test]
    fn test_compare_matches_slice_ordering() {
        let keys: [&[u8]; 6] = [
            b"",
            b"a",
            b"abcdefgh",
            b"abcdefghi",
            b"file/0001",
            b"file/0002",
        ];
        for a in keys {
            for b in keys {
                assert_eq!(compare_keys(a, b), a.cmp(b), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_entry_ref_roundtrip() {
        let r = EntryRef::new(7);
        assert_eq!(r.as_u64(), 7);
        assert_eq!(EntryRef::from_u64(r.as_u64()), r);
        assert_eq!(r.to_string(), "ref:7");
    }

    #[test]
    fn test_partition_id() {
        let p = PartitionId::new(3);
        assert_eq!(p.as_u32(), 3);
        assert_eq!(p.as_usize(), 3);
        assert_eq!(p.to_string(), "partition:3");
    }
}
