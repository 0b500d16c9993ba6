//! B+ tree node representations and structural primitives.
//!
//! Nodes are order-bounded in-memory structures; the serialized form used at
//! the page-store boundary is produced by `to_bytes`/`from_bytes`:
//!
//! ```text
//! Leaf:      [tag:1=1][num_entries:2][next:8]
//!            ([key_len:2][key][entry_ref:8]) * num_entries
//! Internal:  [tag:1=2][num_keys:2]
//!            [child:8] * (num_keys + 1)
//!            ([key_len:2][key]) * num_keys
//! ```
//!
//! All integers are little-endian. `next = u64::MAX` means no next leaf.

use crate::arena::{NodeArc, NodeId};
use bytes::{BufMut, Bytes, BytesMut};
use shardex_common::types::{EntryRef, KeyComparator};
use shardex_common::{Result, ShardexError};
use std::cmp::Ordering;

/// Serialized node tag: leaf.
const NODE_TAG_LEAF: u8 = 1;
/// Serialized node tag: internal.
const NODE_TAG_INTERNAL: u8 = 2;

/// Sentinel for "no node" in serialized references.
pub const INVALID_NODE: u64 = u64::MAX;

/// Maximum number of keys a node of the given order may hold.
#[inline]
pub fn max_keys(order: usize) -> usize {
    order - 1
}

/// Minimum number of keys a non-root node of the given order must hold.
#[inline]
pub fn min_keys(order: usize) -> usize {
    order.div_ceil(2) - 1
}

/// A B+ tree node. `Retired` marks a node removed by a merge; it keeps a
/// strong reference telling in-flight scans where to resume.
#[derive(Debug)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
    Retired { resume: Option<NodeArc> },
}

impl Node {
    /// Number of keys held (0 for retired nodes).
    pub fn keys_len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(node) => node.keys.len(),
            Node::Retired { .. } => 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn is_retired(&self) -> bool {
        matches!(self, Node::Retired { .. })
    }

    pub fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            Node::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Node::Internal(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            Node::Internal(node) => Some(node),
            _ => None,
        }
    }

    /// Serializes the node for the page-store boundary.
    /// Retired nodes have no durable form.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.to_bytes()),
            Node::Internal(node) => Ok(node.to_bytes()),
            Node::Retired { .. } => Err(ShardexError::corrupt(
                "retired node has no serialized form",
            )),
        }
    }

    /// Deserializes a node from its page-store form.
    pub fn from_bytes(buf: &[u8]) -> Result<Node> {
        match buf.first() {
            Some(&NODE_TAG_LEAF) => Ok(Node::Leaf(LeafNode::from_bytes(&buf[1..])?)),
            Some(&NODE_TAG_INTERNAL) => Ok(Node::Internal(InternalNode::from_bytes(&buf[1..])?)),
            Some(tag) => Err(ShardexError::corrupt(format!("unknown node tag {}", tag))),
            None => Err(ShardexError::corrupt("empty node image")),
        }
    }
}

/// A leaf node: sorted key/value entries plus the sibling link.
#[derive(Debug, Default)]
pub struct LeafNode {
    /// Entries sorted by the tree's comparator.
    pub entries: Vec<(Bytes, EntryRef)>,
    /// Next leaf in key order, if any.
    pub next: Option<NodeId>,
}

impl LeafNode {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search for a key. Ok(i) = present at i, Err(i) = insert point.
    #[inline]
    pub fn search(&self, key: &[u8], cmp: KeyComparator) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| cmp(k.as_ref(), key))
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8], cmp: KeyComparator) -> Option<EntryRef> {
        self.search(key, cmp).ok().map(|i| self.entries[i].1)
    }

    /// Inserts a key. An existing key is replaced in place when `overwrite`
    /// is set (returning the previous value), and rejected otherwise.
    pub fn insert(
        &mut self,
        key: Bytes,
        value: EntryRef,
        cmp: KeyComparator,
        overwrite: bool,
    ) -> Result<Option<EntryRef>> {
        match self.search(key.as_ref(), cmp) {
            Ok(i) => {
                if !overwrite {
                    return Err(ShardexError::DuplicateKey);
                }
                let prev = self.entries[i].1;
                self.entries[i].1 = value;
                Ok(Some(prev))
            }
            Err(i) => {
                self.entries.insert(i, (key, value));
                Ok(None)
            }
        }
    }

    /// Removes a key, returning its value if present.
    pub fn delete(&mut self, key: &[u8], cmp: KeyComparator) -> Option<EntryRef> {
        match self.search(key, cmp) {
            Ok(i) => Some(self.entries.remove(i).1),
            Err(_) => None,
        }
    }

    /// Splits off the upper half into a new right sibling.
    ///
    /// Returns `(split_key, right)` where `split_key` is the first key of the
    /// new right leaf. The right leaf inherits this leaf's next pointer; the
    /// caller relinks `self.next` once the right leaf has an id.
    pub fn split(&mut self) -> (Bytes, LeafNode) {
        let mid = self.entries.len() / 2;
        let right_entries = self.entries.split_off(mid);
        let split_key = right_entries[0].0.clone();
        let right = LeafNode {
            entries: right_entries,
            next: self.next,
        };
        (split_key, right)
    }

    /// Takes the last entry of the left sibling as this leaf's new first
    /// entry. Returns the new parent separator (this leaf's first key).
    pub fn borrow_from_left(&mut self, left: &mut LeafNode) -> Result<Bytes> {
        let entry = left
            .entries
            .pop()
            .ok_or_else(|| ShardexError::corrupt("borrow from empty left leaf"))?;
        self.entries.insert(0, entry);
        Ok(self.entries[0].0.clone())
    }

    /// Takes the first entry of the right sibling as this leaf's new last
    /// entry. Returns the new parent separator (the right leaf's first key).
    pub fn borrow_from_right(&mut self, right: &mut LeafNode) -> Result<Bytes> {
        if right.entries.is_empty() {
            return Err(ShardexError::corrupt("borrow from empty right leaf"));
        }
        let entry = right.entries.remove(0);
        self.entries.push(entry);
        right
            .entries
            .first()
            .map(|(key, _)| key.clone())
            .ok_or_else(|| ShardexError::corrupt("right leaf drained by borrow"))
    }

    /// Absorbs the right sibling, relinking the leaf chain past it.
    pub fn merge_with_right(&mut self, right: &mut LeafNode) {
        self.entries.append(&mut right.entries);
        self.next = right.next;
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.entries.len() * 32);
        buf.put_u8(NODE_TAG_LEAF);
        buf.put_u16_le(self.entries.len() as u16);
        buf.put_u64_le(self.next.map_or(INVALID_NODE, |id| id.as_u64()));
        for (key, value) in &self.entries {
            buf.put_u16_le(key.len() as u16);
            buf.extend_from_slice(key);
            buf.put_u64_le(value.as_u64());
        }
        buf.freeze()
    }

    fn from_bytes(buf: &[u8]) -> Result<LeafNode> {
        if buf.len() < 10 {
            return Err(ShardexError::corrupt("truncated leaf header"));
        }
        let num_entries = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let next_raw = u64::from_le_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        let next = (next_raw != INVALID_NODE).then(|| NodeId::from_u64(next_raw));

        let mut entries = Vec::with_capacity(num_entries);
        let mut pos = 10;
        for _ in 0..num_entries {
            if buf.len() < pos + 2 {
                return Err(ShardexError::corrupt("truncated leaf entry"));
            }
            let key_len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            if buf.len() < pos + key_len + 8 {
                return Err(ShardexError::corrupt("truncated leaf entry"));
            }
            let key = Bytes::copy_from_slice(&buf[pos..pos + key_len]);
            pos += key_len;
            let raw = u64::from_le_bytes([
                buf[pos],
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
                buf[pos + 4],
                buf[pos + 5],
                buf[pos + 6],
                buf[pos + 7],
            ]);
            pos += 8;
            entries.push((key, EntryRef::from_u64(raw)));
        }
        Ok(LeafNode { entries, next })
    }
}

/// An internal node: separator keys and child ids, with
/// `children.len() == keys.len() + 1`. Subtree `children[i]` holds keys
/// strictly below `keys[i]`; keys at or above `keys[i]` route right of it.
#[derive(Debug, Default)]
pub struct InternalNode {
    pub keys: Vec<Bytes>,
    pub children: Vec<NodeId>,
}

impl InternalNode {
    /// Builds the root produced by a root split.
    pub fn new_root(separator: Bytes, left: NodeId, right: NodeId) -> Self {
        Self {
            keys: vec![separator],
            children: vec![left, right],
        }
    }

    /// Index of the child subtree responsible for `key`.
    #[inline]
    pub fn child_index(&self, key: &[u8], cmp: KeyComparator) -> usize {
        self.keys
            .partition_point(|k| cmp(k.as_ref(), key) != Ordering::Greater)
    }

    /// Inserts a separator with its right child at the sorted position.
    pub fn insert_separator(&mut self, key: Bytes, right_child: NodeId, cmp: KeyComparator) {
        let pos = self
            .keys
            .partition_point(|k| cmp(k.as_ref(), key.as_ref()) == Ordering::Less);
        self.keys.insert(pos, key);
        self.children.insert(pos + 1, right_child);
    }

    /// Position of a child id, if present.
    pub fn position_of(&self, child: NodeId) -> Option<usize> {
        self.children.iter().position(|c| *c == child)
    }

    /// Splits off the upper half into a new right sibling.
    ///
    /// Returns `(promoted_key, right)`; the promoted key moves to the parent
    /// and remains in neither half.
    pub fn split(&mut self) -> (Bytes, InternalNode) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let promoted = self.keys.pop().unwrap_or_default();
        let right_children = self.children.split_off(mid + 1);
        let right = InternalNode {
            keys: right_keys,
            children: right_children,
        };
        (promoted, right)
    }

    /// Rotates the left sibling's last child through the parent separator.
    /// Returns the new separator to store in the parent.
    pub fn borrow_from_left(&mut self, left: &mut InternalNode, separator: Bytes) -> Result<Bytes> {
        let child = left
            .children
            .pop()
            .ok_or_else(|| ShardexError::corrupt("borrow from childless left node"))?;
        let new_separator = left
            .keys
            .pop()
            .ok_or_else(|| ShardexError::corrupt("borrow from keyless left node"))?;
        self.keys.insert(0, separator);
        self.children.insert(0, child);
        Ok(new_separator)
    }

    /// Rotates the right sibling's first child through the parent separator.
    /// Returns the new separator to store in the parent.
    pub fn borrow_from_right(&mut self, right: &mut InternalNode, separator: Bytes) -> Result<Bytes> {
        if right.children.is_empty() || right.keys.is_empty() {
            return Err(ShardexError::corrupt("borrow from empty right node"));
        }
        self.keys.push(separator);
        self.children.push(right.children.remove(0));
        Ok(right.keys.remove(0))
    }

    /// Absorbs the right sibling, pulling the parent separator down.
    pub fn merge_with_right(&mut self, right: &mut InternalNode, separator: Bytes) {
        self.keys.push(separator);
        self.keys.append(&mut right.keys);
        self.children.append(&mut right.children);
    }

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.children.len() * 8 + self.keys.len() * 32);
        buf.put_u8(NODE_TAG_INTERNAL);
        buf.put_u16_le(self.keys.len() as u16);
        for child in &self.children {
            buf.put_u64_le(child.as_u64());
        }
        for key in &self.keys {
            buf.put_u16_le(key.len() as u16);
            buf.extend_from_slice(key);
        }
        buf.freeze()
    }

    fn from_bytes(buf: &[u8]) -> Result<InternalNode> {
        if buf.len() < 2 {
            return Err(ShardexError::corrupt("truncated internal header"));
        }
        let num_keys = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let mut pos = 2;

        let mut children = Vec::with_capacity(num_keys + 1);
        for _ in 0..num_keys + 1 {
            if buf.len() < pos + 8 {
                return Err(ShardexError::corrupt("truncated child pointer"));
            }
            let raw = u64::from_le_bytes([
                buf[pos],
                buf[pos + 1],
                buf[pos + 2],
                buf[pos + 3],
                buf[pos + 4],
                buf[pos + 5],
                buf[pos + 6],
                buf[pos + 7],
            ]);
            pos += 8;
            children.push(NodeId::from_u64(raw));
        }

        let mut keys = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            if buf.len() < pos + 2 {
                return Err(ShardexError::corrupt("truncated separator key"));
            }
            let key_len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
            pos += 2;
            if buf.len() < pos + key_len {
                return Err(ShardexError::corrupt("truncated separator key"));
            }
            keys.push(Bytes::copy_from_slice(&buf[pos..pos + key_len]));
            pos += key_len;
        }
        Ok(InternalNode { keys, children })
    }
}
