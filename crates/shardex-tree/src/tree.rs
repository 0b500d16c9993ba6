//! B+ tree with latch-crabbing concurrency.
//!
//! Structure:
//!
//! ```text
//!                 [root pointer latch]
//!                         |
//!                  +--------------+
//!                  |   internal   |        keys route: child[i] < keys[i],
//!                  +--------------+        keys >= keys[i] go right
//!                   /            \
//!           +--------+        +--------+
//!           |  leaf  | -----> |  leaf  | -----> ...   (next links)
//!           +--------+        +--------+
//! ```
//!
//! Readers couple shared latches parent-to-child, releasing the parent once
//! the child is held. Writers couple exclusive latches and retain the chain
//! of ancestors that a split or merge could modify, releasing everything
//! above the deepest safe node. Sibling latches are only taken while the
//! parent is held exclusively, so latch order is always top-down and the
//! protocol cannot deadlock.

use crate::arena::{NodeArc, NodeArena, NodeId};
use crate::iter::RangeScan;
use crate::latch::{LatchManager, NodeReadGuard, NodeWriteGuard};
use crate::node::{max_keys, min_keys, InternalNode, LeafNode, Node};
use crate::store::{CheckpointMeta, PageStore};
use bytes::Bytes;
use log::debug;
use parking_lot::RwLock;
use shardex_common::types::{compare_keys, EntryRef, KeyComparator, MAX_KEY_SIZE};
use shardex_common::{Result, ShardexError};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

/// Ordered index over byte keys: a B+ tree of configurable order.
pub struct BPlusTree {
    /// Node storage.
    pub(crate) arena: NodeArena,
    /// Root pointer, guarded by its own latch. Mutations acquire it first
    /// and release it once no root replacement can happen.
    root: RwLock<NodeId>,
    /// Tree height (1 = root is a leaf).
    height: AtomicU32,
    /// Number of entries.
    len: AtomicU64,
    order: usize,
    pub(crate) cmp: KeyComparator,
    overwrite: bool,
    pub(crate) latches: LatchManager,
}

impl BPlusTree {
    /// Creates an empty tree with the default byte-lexicographic comparator.
    pub fn new(order: usize, lock_timeout: Duration, overwrite: bool) -> Result<Self> {
        Self::with_comparator(order, lock_timeout, overwrite, compare_keys)
    }

    /// Creates an empty tree with a caller-supplied key comparator.
    pub fn with_comparator(
        order: usize,
        lock_timeout: Duration,
        overwrite: bool,
        cmp: KeyComparator,
    ) -> Result<Self> {
        if order < 3 {
            return Err(ShardexError::ConfigError(format!(
                "order must be at least 3, got {}",
                order
            )));
        }
        let arena = NodeArena::new();
        let root = arena.alloc(Node::Leaf(LeafNode::new()));
        Ok(Self {
            arena,
            root: RwLock::new(root),
            height: AtomicU32::new(1),
            len: AtomicU64::new(0),
            order,
            cmp,
            overwrite,
            latches: LatchManager::new(lock_timeout),
        })
    }

    /// Number of entries in the tree.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(AtomicOrdering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree height (1 = root is a leaf).
    #[inline]
    pub fn height(&self) -> u32 {
        self.height.load(AtomicOrdering::Acquire)
    }

    /// Configured order.
    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    // =========================================================================
    // Latch helpers
    // =========================================================================

    fn lock_timeout_err(&self) -> ShardexError {
        ShardexError::LockTimeout {
            waited_ms: self.latches.timeout().as_millis() as u64,
        }
    }

    fn root_read(&self) -> Result<parking_lot::RwLockReadGuard<'_, NodeId>> {
        self.root
            .try_read_for(self.latches.timeout())
            .ok_or_else(|| self.lock_timeout_err())
    }

    fn root_write(&self) -> Result<parking_lot::RwLockWriteGuard<'_, NodeId>> {
        self.root
            .try_write_for(self.latches.timeout())
            .ok_or_else(|| self.lock_timeout_err())
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<NodeArc> {
        self.arena
            .get(id)
            .ok_or_else(|| ShardexError::corrupt(format!("{} missing from arena", id)))
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(ShardexError::InvalidParameter {
                name: "key".to_string(),
                value: "<empty>".to_string(),
            });
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(ShardexError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }

    /// A node that can absorb one more key without splitting.
    #[inline]
    fn insert_safe(&self, node: &Node) -> bool {
        node.keys_len() < max_keys(self.order)
    }

    /// A node that can lose one key without underflowing.
    #[inline]
    fn delete_safe(&self, node: &Node) -> bool {
        node.keys_len() > min_keys(self.order)
    }

    fn child_for(&self, node: &Node, key: &[u8]) -> Result<NodeId> {
        match node {
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(ShardexError::corrupt(format!(
                        "internal node with {} keys and {} children",
                        internal.keys.len(),
                        internal.children.len()
                    )));
                }
                Ok(internal.children[internal.child_index(key, self.cmp)])
            }
            Node::Retired { .. } => Err(ShardexError::corrupt("descent reached retired node")),
            Node::Leaf(_) => Err(ShardexError::corrupt("descent past leaf level")),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read-crabs to the leaf responsible for `key`, returning the leaf slot
    /// and its held shared latch.
    pub(crate) fn leaf_for_read(&self, key: &[u8]) -> Result<(NodeArc, NodeReadGuard)> {
        let root_latch = self.root_read()?;
        let mut arc = self.node(*root_latch)?;
        let mut guard = self.latches.read(&arc)?;
        drop(root_latch);

        while !guard.is_leaf() {
            let child_id = self.child_for(&guard, key)?;
            let child_arc = self.node(child_id)?;
            // Acquire the child before the parent latch drops.
            let child_guard = self.latches.read(&child_arc)?;
            guard = child_guard;
            arc = child_arc;
        }
        Ok((arc, guard))
    }

    /// Point lookup. Absent keys are `Ok(None)`.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<EntryRef>> {
        self.validate_key(key)?;
        let (_, guard) = self.leaf_for_read(key)?;
        let leaf = guard
            .as_leaf()
            .ok_or_else(|| ShardexError::corrupt("descent ended on non-leaf"))?;
        Ok(leaf.get(key, self.cmp))
    }

    /// Lazy scan of keys in `[low, high]`, both bounds inclusive.
    ///
    /// The iterator latches one leaf at a time; concurrent mutations may or
    /// may not be observed, but yielded keys are strictly increasing and no
    /// linked leaf is ever skipped.
    pub fn range_scan(&self, low: &[u8], high: &[u8]) -> Result<RangeScan<'_>> {
        if (self.cmp)(low, high) == Ordering::Greater {
            return Ok(RangeScan::empty(self));
        }
        let (arc, guard) = self.leaf_for_read(low)?;
        drop(guard);
        Ok(RangeScan::new(self, arc, low, high))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Write-crabs to the leaf for `key`, using `safe` to decide when the
    /// retained ancestor chain and root latch can be released.
    fn descend_for_write<'a>(
        &'a self,
        key: &[u8],
        root_latch: parking_lot::RwLockWriteGuard<'a, NodeId>,
        safe: impl Fn(&Node) -> bool,
    ) -> Result<WritePath<'a>> {
        let root_id = *root_latch;
        let mut root_latch = Some(root_latch);
        let arc = self.node(root_id)?;
        let mut current_id = root_id;
        let mut current = self.latches.write(&arc)?;
        let mut retained: Vec<(NodeId, NodeWriteGuard)> = Vec::new();

        while !current.is_leaf() {
            let child_id = self.child_for(&current, key)?;
            let child_arc = self.node(child_id)?;
            let child_guard = self.latches.write(&child_arc)?;

            let parent_guard = std::mem::replace(&mut current, child_guard);
            if safe(&current) {
                // Nothing above this child can be modified; release it all.
                retained.clear();
                root_latch = None;
            } else {
                retained.push((current_id, parent_guard));
            }
            current_id = child_id;
        }

        Ok(WritePath {
            leaf_id: current_id,
            leaf: current,
            retained,
            root_latch,
        })
    }

    /// Inserts a key. Returns the replaced value for an in-place overwrite,
    /// `None` for a fresh insert, and `DuplicateKey` when overwriting is
    /// disabled and the key exists.
    pub fn insert(&self, key: &[u8], value: EntryRef) -> Result<Option<EntryRef>> {
        self.validate_key(key)?;
        let root_latch = self.root_write()?;
        let mut path =
            self.descend_for_write(key, root_latch, |node| self.insert_safe(node))?;

        let overflowed = {
            let leaf = path
                .leaf
                .as_leaf_mut()
                .ok_or_else(|| ShardexError::corrupt("descent ended on non-leaf"))?;
            let prev = leaf.insert(
                Bytes::copy_from_slice(key),
                value,
                self.cmp,
                self.overwrite,
            )?;
            if prev.is_some() {
                return Ok(prev);
            }
            self.len.fetch_add(1, AtomicOrdering::Release);
            leaf.len() >= self.order
        };

        if overflowed {
            self.split_upward(path)?;
        }
        Ok(None)
    }

    /// Splits the overflowed leaf at the bottom of `path` and propagates
    /// separators upward through the retained ancestors.
    fn split_upward(&self, mut path: WritePath<'_>) -> Result<()> {
        let (split_key, right_id) = {
            let leaf = path
                .leaf
                .as_leaf_mut()
                .ok_or_else(|| ShardexError::corrupt("split target is not a leaf"))?;
            let (split_key, right) = leaf.split();
            let right_id = self.arena.alloc(Node::Leaf(right));
            leaf.next = Some(right_id);
            (split_key, right_id)
        };
        drop(path.leaf);
        debug!("leaf {} split off {}", path.leaf_id, right_id);

        let mut sep = split_key;
        let mut left_id = path.leaf_id;
        let mut right_id = right_id;
        loop {
            match path.retained.pop() {
                Some((parent_id, mut parent_guard)) => {
                    let parent = parent_guard
                        .as_internal_mut()
                        .ok_or_else(|| ShardexError::corrupt("split parent is not internal"))?;
                    parent.insert_separator(sep, right_id, self.cmp);
                    if parent.keys.len() < self.order {
                        return Ok(());
                    }
                    let (promoted, right_node) = parent.split();
                    let new_right = self.arena.alloc(Node::Internal(right_node));
                    debug!("internal {} split off {}", parent_id, new_right);
                    sep = promoted;
                    left_id = parent_id;
                    right_id = new_right;
                }
                None => {
                    // The split reached the top of the retained chain, which
                    // by the crabbing rule is the root.
                    let mut root_latch = path
                        .root_latch
                        .take()
                        .ok_or_else(|| ShardexError::corrupt("root split without root latch"))?;
                    let new_root = InternalNode::new_root(sep, left_id, right_id);
                    let new_root_id = self.arena.alloc(Node::Internal(new_root));
                    *root_latch = new_root_id;
                    let height = self.height.fetch_add(1, AtomicOrdering::AcqRel) + 1;
                    debug!("root split; height now {}", height);
                    return Ok(());
                }
            }
        }
    }

    /// Removes a key, returning its value. Absent keys fail with
    /// `KeyNotFound` and leave the tree untouched.
    pub fn delete(&self, key: &[u8]) -> Result<EntryRef> {
        self.validate_key(key)?;
        let root_latch = self.root_write()?;
        let mut path =
            self.descend_for_write(key, root_latch, |node| self.delete_safe(node))?;

        let (removed, underfull) = {
            let leaf = path
                .leaf
                .as_leaf_mut()
                .ok_or_else(|| ShardexError::corrupt("descent ended on non-leaf"))?;
            let removed = leaf.delete(key, self.cmp).ok_or(ShardexError::KeyNotFound)?;
            self.len.fetch_sub(1, AtomicOrdering::Release);
            (removed, leaf.len() < min_keys(self.order))
        };

        // An underfull leaf with no retained parent is the root; root leaves
        // have no minimum.
        if underfull && !path.retained.is_empty() {
            self.rebalance_upward(path)?;
        }
        Ok(removed)
    }

    /// Repairs the underfull node at the bottom of `path`, walking upward
    /// while merges leave ancestors underfull.
    fn rebalance_upward(&self, mut path: WritePath<'_>) -> Result<()> {
        let mut node_id = path.leaf_id;
        let mut node_guard = path.leaf;
        loop {
            let (parent_id, mut parent_guard) = match path.retained.pop() {
                Some(entry) => entry,
                None => {
                    // Topmost held node: the root if the root latch is still
                    // held, otherwise the deepest safe node (no underflow).
                    if let Some(mut root_latch) = path.root_latch.take() {
                        let new_root = match &*node_guard {
                            Node::Internal(n) if n.keys.is_empty() => {
                                if n.children.len() != 1 {
                                    return Err(ShardexError::corrupt(
                                        "keyless root with multiple children",
                                    ));
                                }
                                Some(n.children[0])
                            }
                            _ => None,
                        };
                        if let Some(new_root_id) = new_root {
                            *root_latch = new_root_id;
                            let height = self.height.fetch_sub(1, AtomicOrdering::AcqRel) - 1;
                            *node_guard = Node::Retired { resume: None };
                            self.arena.release(node_id);
                            debug!("root collapsed; height now {}", height);
                        }
                    }
                    return Ok(());
                }
            };

            self.repair_child(&mut parent_guard, node_id, node_guard)?;

            if parent_guard.keys_len() >= min_keys(self.order) {
                return Ok(());
            }
            node_id = parent_id;
            node_guard = parent_guard;
        }
    }

    /// Restores the fill invariant of one underfull child: redistribution
    /// from a sibling with surplus, else a merge. The parent is held
    /// exclusively, so sibling latches cannot deadlock.
    fn repair_child(
        &self,
        parent_guard: &mut NodeWriteGuard,
        node_id: NodeId,
        mut node_guard: NodeWriteGuard,
    ) -> Result<()> {
        let (pos, left_id, right_id, sep_left, sep_right) = {
            let parent = parent_guard
                .as_internal()
                .ok_or_else(|| ShardexError::corrupt("rebalance parent is not internal"))?;
            let pos = parent
                .position_of(node_id)
                .ok_or_else(|| ShardexError::corrupt(format!("{} not under its parent", node_id)))?;
            (
                pos,
                (pos > 0).then(|| parent.children[pos - 1]),
                (pos + 1 < parent.children.len()).then(|| parent.children[pos + 1]),
                (pos > 0).then(|| parent.keys[pos - 1].clone()),
                (pos + 1 < parent.children.len()).then(|| parent.keys[pos].clone()),
            )
        };
        let min = min_keys(self.order);

        let mut left = match left_id {
            Some(id) => {
                let arc = self.node(id)?;
                let guard = self.latches.write(&arc)?;
                Some((id, arc, guard))
            }
            None => None,
        };
        let mut right = match right_id {
            Some(id) => {
                let arc = self.node(id)?;
                let guard = self.latches.write(&arc)?;
                Some((id, arc, guard))
            }
            None => None,
        };

        // 1. Redistribute from the left sibling.
        if let Some((left_sib_id, _, left_guard)) = left.as_mut() {
            if left_guard.keys_len() > min {
                let new_sep = match (&mut *node_guard, &mut **left_guard) {
                    (Node::Leaf(node), Node::Leaf(sib)) => node.borrow_from_left(sib)?,
                    (Node::Internal(node), Node::Internal(sib)) => {
                        let sep = sep_left
                            .clone()
                            .ok_or_else(|| ShardexError::corrupt("missing left separator"))?;
                        node.borrow_from_left(sib, sep)?
                    }
                    _ => return Err(ShardexError::corrupt("sibling kind mismatch")),
                };
                let parent = parent_guard
                    .as_internal_mut()
                    .ok_or_else(|| ShardexError::corrupt("rebalance parent is not internal"))?;
                parent.keys[pos - 1] = new_sep;
                debug!("{} redistributed from left sibling {}", node_id, left_sib_id);
                return Ok(());
            }
        }

        // 2. Redistribute from the right sibling.
        if let Some((right_sib_id, _, right_guard)) = right.as_mut() {
            if right_guard.keys_len() > min {
                let new_sep = match (&mut *node_guard, &mut **right_guard) {
                    (Node::Leaf(node), Node::Leaf(sib)) => node.borrow_from_right(sib)?,
                    (Node::Internal(node), Node::Internal(sib)) => {
                        let sep = sep_right
                            .clone()
                            .ok_or_else(|| ShardexError::corrupt("missing right separator"))?;
                        node.borrow_from_right(sib, sep)?
                    }
                    _ => return Err(ShardexError::corrupt("sibling kind mismatch")),
                };
                let parent = parent_guard
                    .as_internal_mut()
                    .ok_or_else(|| ShardexError::corrupt("rebalance parent is not internal"))?;
                parent.keys[pos] = new_sep;
                debug!(
                    "{} redistributed from right sibling {}",
                    node_id, right_sib_id
                );
                return Ok(());
            }
        }

        // 3. Merge the right sibling into this node.
        if let Some((right_sib_id, _, mut right_guard)) = right {
            let node_arc = self.node(node_id)?;
            match (&mut *node_guard, &mut *right_guard) {
                (Node::Leaf(node), Node::Leaf(sib)) => node.merge_with_right(sib),
                (Node::Internal(node), Node::Internal(sib)) => {
                    let sep = sep_right
                        .ok_or_else(|| ShardexError::corrupt("missing right separator"))?;
                    node.merge_with_right(sib, sep);
                }
                _ => return Err(ShardexError::corrupt("sibling kind mismatch")),
            }
            // In-flight scans holding the retired leaf resume at the
            // absorbing node; the watermark filter drops consumed keys.
            let resume = node_guard.is_leaf().then_some(node_arc);
            *right_guard = Node::Retired { resume };
            let parent = parent_guard
                .as_internal_mut()
                .ok_or_else(|| ShardexError::corrupt("rebalance parent is not internal"))?;
            parent.keys.remove(pos);
            parent.children.remove(pos + 1);
            self.arena.release(right_sib_id);
            debug!("merged right sibling {} into {}", right_sib_id, node_id);
            return Ok(());
        }

        // 4. Merge this node into the left sibling (rightmost child case).
        if let Some((left_sib_id, left_arc, mut left_guard)) = left {
            let resume = node_guard.is_leaf().then_some(left_arc);
            match (&mut *left_guard, &mut *node_guard) {
                (Node::Leaf(sib), Node::Leaf(node)) => sib.merge_with_right(node),
                (Node::Internal(sib), Node::Internal(node)) => {
                    let sep = sep_left
                        .ok_or_else(|| ShardexError::corrupt("missing left separator"))?;
                    sib.merge_with_right(node, sep);
                }
                _ => return Err(ShardexError::corrupt("sibling kind mismatch")),
            }
            *node_guard = Node::Retired { resume };
            let parent = parent_guard
                .as_internal_mut()
                .ok_or_else(|| ShardexError::corrupt("rebalance parent is not internal"))?;
            parent.keys.remove(pos - 1);
            parent.children.remove(pos);
            self.arena.release(node_id);
            debug!("merged {} into left sibling {}", node_id, left_sib_id);
            return Ok(());
        }

        Err(ShardexError::corrupt("underfull node has no siblings"))
    }

    // =========================================================================
    // Structural audit
    // =========================================================================

    /// Full structural audit: sortedness, separator bounds, fill bounds,
    /// uniform leaf depth, leaf-chain completeness, and entry count.
    pub fn check_invariants(&self) -> Result<()> {
        let root_latch = self.root_read()?;
        let root_id = *root_latch;
        let mut audit = Audit {
            tree: self,
            leaf_depth: None,
            leaves: Vec::new(),
            total: 0,
        };
        audit.visit(root_id, 1, None, None, true)?;

        let height = self.height() as usize;
        if audit.leaf_depth != Some(height) {
            return Err(ShardexError::corrupt(format!(
                "leaf depth {:?} does not match height {}",
                audit.leaf_depth, height
            )));
        }
        if audit.total != self.len() {
            return Err(ShardexError::corrupt(format!(
                "entry count {} does not match len {}",
                audit.total,
                self.len()
            )));
        }
        // Leaf chain must visit exactly the leaves, in key order.
        for window in audit.leaves.windows(2) {
            let (id, next) = window[0];
            if next != Some(window[1].0) {
                return Err(ShardexError::corrupt(format!(
                    "{} links to {:?}, expected {}",
                    id, next, window[1].0
                )));
            }
        }
        if let Some(&(id, next)) = audit.leaves.last() {
            if next.is_some() {
                return Err(ShardexError::corrupt(format!(
                    "last leaf {} has a dangling next link",
                    id
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Page-store boundary
    // =========================================================================

    /// Writes every live node through the page-store boundary, remapping
    /// node ids onto store-allocated ids.
    ///
    /// Holds the root latch exclusively for the duration, quiescing all
    /// mutations (they acquire the root latch first).
    pub fn checkpoint(&self, store: &mut dyn PageStore) -> Result<CheckpointMeta> {
        let root_latch = self.root_write()?;
        let root_id = *root_latch;

        // Pass 1: collect live node ids and assign store ids.
        let live = self.collect_live(root_id)?;
        let mut id_map: HashMap<u64, NodeId> = HashMap::with_capacity(live.len());
        for id in &live {
            id_map.insert(id.as_u64(), store.allocate_id()?);
        }
        let remap = |id: NodeId| -> Result<NodeId> {
            id_map
                .get(&id.as_u64())
                .copied()
                .ok_or_else(|| ShardexError::corrupt(format!("{} escaped checkpoint walk", id)))
        };

        // Pass 2: serialize with remapped references.
        for id in &live {
            let arc = self.node(*id)?;
            let guard = self.latches.read(&arc)?;
            let image = match &*guard {
                Node::Leaf(leaf) => {
                    let next = leaf.next.map(remap).transpose()?;
                    Node::Leaf(LeafNode {
                        entries: leaf.entries.clone(),
                        next,
                    })
                }
                Node::Internal(internal) => {
                    let children = internal
                        .children
                        .iter()
                        .map(|c| remap(*c))
                        .collect::<Result<Vec<_>>>()?;
                    Node::Internal(InternalNode {
                        keys: internal.keys.clone(),
                        children,
                    })
                }
                Node::Retired { .. } => {
                    return Err(ShardexError::corrupt("live walk found retired node"))
                }
            };
            store.write_node(remap(*id)?, image.to_bytes()?)?;
        }

        debug!("checkpointed {} nodes", live.len());
        Ok(CheckpointMeta {
            root: remap(root_id)?,
            height: self.height(),
            len: self.len(),
        })
    }

    /// Rebuilds a tree from a page-store image produced by [`checkpoint`].
    ///
    /// [`checkpoint`]: BPlusTree::checkpoint
    pub fn restore(
        store: &dyn PageStore,
        meta: &CheckpointMeta,
        order: usize,
        lock_timeout: Duration,
        overwrite: bool,
    ) -> Result<Self> {
        if order < 3 {
            return Err(ShardexError::ConfigError(format!(
                "order must be at least 3, got {}",
                order
            )));
        }

        // Breadth-first over store ids from the root; arena ids are assigned
        // by visit order.
        let mut visit_order: Vec<NodeId> = vec![meta.root];
        let mut id_map: HashMap<u64, NodeId> = HashMap::new();
        id_map.insert(meta.root.as_u64(), NodeId::from_u64(0));
        let mut raw: Vec<Node> = Vec::new();
        let mut cursor = 0;
        while cursor < visit_order.len() {
            let store_id = visit_order[cursor];
            cursor += 1;
            let node = Node::from_bytes(&store.read_node(store_id)?)?;
            if let Node::Internal(internal) = &node {
                for child in &internal.children {
                    if !id_map.contains_key(&child.as_u64()) {
                        id_map.insert(child.as_u64(), NodeId::from_u64(visit_order.len() as u64));
                        visit_order.push(*child);
                    }
                }
            }
            raw.push(node);
        }

        let remap = |id: NodeId| -> Result<NodeId> {
            id_map
                .get(&id.as_u64())
                .copied()
                .ok_or_else(|| ShardexError::corrupt(format!("{} missing from image", id)))
        };
        let mut nodes = Vec::with_capacity(raw.len());
        for node in raw {
            nodes.push(match node {
                Node::Leaf(leaf) => Node::Leaf(LeafNode {
                    entries: leaf.entries,
                    next: leaf.next.map(remap).transpose()?,
                }),
                Node::Internal(internal) => Node::Internal(InternalNode {
                    keys: internal.keys,
                    children: internal
                        .children
                        .iter()
                        .map(|c| remap(*c))
                        .collect::<Result<Vec<_>>>()?,
                }),
                Node::Retired { .. } => {
                    return Err(ShardexError::corrupt("image contains retired node"))
                }
            });
        }

        Ok(Self {
            arena: NodeArena::from_nodes(nodes),
            root: RwLock::new(NodeId::from_u64(0)),
            height: AtomicU32::new(meta.height),
            len: AtomicU64::new(meta.len),
            order,
            cmp: compare_keys,
            overwrite,
            latches: LatchManager::new(lock_timeout),
        })
    }

    /// Depth-first collection of live node ids, leaves last per subtree.
    fn collect_live(&self, root: NodeId) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let arc = self.node(id)?;
            let guard = self.latches.read(&arc)?;
            if let Node::Internal(internal) = &*guard {
                stack.extend(internal.children.iter().copied());
            }
        }
        Ok(out)
    }
}

/// Latches held on the way down a mutating descent.
struct WritePath<'a> {
    leaf_id: NodeId,
    leaf: NodeWriteGuard,
    /// Ancestors that the mutation may modify, shallowest first.
    retained: Vec<(NodeId, NodeWriteGuard)>,
    /// Held while the root pointer itself may change.
    root_latch: Option<parking_lot::RwLockWriteGuard<'a, NodeId>>,
}

/// Recursive invariant walk state.
struct Audit<'a> {
    tree: &'a BPlusTree,
    leaf_depth: Option<usize>,
    leaves: Vec<(NodeId, Option<NodeId>)>,
    total: u64,
}

impl Audit<'_> {
    fn visit(
        &mut self,
        id: NodeId,
        depth: usize,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        is_root: bool,
    ) -> Result<()> {
        let tree = self.tree;
        let arc = tree.node(id)?;
        let guard = tree.latches.read(&arc)?;
        let cmp = tree.cmp;

        let check_sorted = |keys: &[Bytes]| -> Result<()> {
            for pair in keys.windows(2) {
                if cmp(pair[0].as_ref(), pair[1].as_ref()) != Ordering::Less {
                    return Err(ShardexError::corrupt(format!("{} keys out of order", id)));
                }
            }
            Ok(())
        };
        let check_bounds = |key: &Bytes| -> Result<()> {
            if let Some(lo) = lower {
                if cmp(key.as_ref(), lo.as_ref()) == Ordering::Less {
                    return Err(ShardexError::corrupt(format!("{} key below separator", id)));
                }
            }
            if let Some(hi) = upper {
                if cmp(key.as_ref(), hi.as_ref()) != Ordering::Less {
                    return Err(ShardexError::corrupt(format!("{} key above separator", id)));
                }
            }
            Ok(())
        };

        match &*guard {
            Node::Leaf(leaf) => {
                if leaf.len() > max_keys(tree.order) {
                    return Err(ShardexError::corrupt(format!("{} overfull leaf", id)));
                }
                if !is_root && leaf.len() < min_keys(tree.order) {
                    return Err(ShardexError::corrupt(format!("{} underfull leaf", id)));
                }
                let keys: Vec<Bytes> = leaf.entries.iter().map(|(k, _)| k.clone()).collect();
                check_sorted(&keys)?;
                for key in &keys {
                    check_bounds(key)?;
                }
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(ShardexError::corrupt(format!(
                            "{} at depth {}, expected {}",
                            id, depth, expected
                        )))
                    }
                    _ => {}
                }
                self.total += leaf.len() as u64;
                self.leaves.push((id, leaf.next));
            }
            Node::Internal(internal) => {
                if internal.children.len() != internal.keys.len() + 1 {
                    return Err(ShardexError::corrupt(format!("{} bad child arity", id)));
                }
                if internal.keys.len() > max_keys(tree.order) {
                    return Err(ShardexError::corrupt(format!("{} overfull node", id)));
                }
                if !is_root && internal.keys.len() < min_keys(tree.order) {
                    return Err(ShardexError::corrupt(format!("{} underfull node", id)));
                }
                if is_root && internal.keys.is_empty() {
                    return Err(ShardexError::corrupt("keyless internal root"));
                }
                check_sorted(&internal.keys)?;
                for key in &internal.keys {
                    check_bounds(key)?;
                }
                let children = internal.children.clone();
                let keys = internal.keys.clone();
                drop(guard);
                for (i, child) in children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(&keys[i - 1]) };
                    let child_upper = if i == keys.len() {
                        upper
                    } else {
                        Some(&keys[i])
                    };
                    self.visit(*child, depth + 1, child_lower, child_upper, false)?;
                }
            }
            Node::Retired { .. } => {
                return Err(ShardexError::corrupt(format!("{} retired but reachable", id)))
            }
        }
        Ok(())
    }
}
