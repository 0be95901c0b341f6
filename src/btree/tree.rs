//! B+Tree implementation
//!
//! This is the main data structure exposed by the library.
//!

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::ControlFlow;

use anyhow::Result;
use thiserror::Error;

use super::node::{Node, NodeId};
use super::sparse::BuildIdentityHasher;
use crate::comparator::{BytewiseComparator, KeyComparator};

/// Identifier of a fixed-size storage block.
///
/// Assigned and owned by the block/buffer layer; the tree only records
/// key-to-block associations and never allocates or frees a block.
pub type BlockId = u64;

/// Branching factor used when a tree is built via `Default`.
///
/// A node splits once it holds more entries than its branching factor and
/// a non-root node rebalances once it holds fewer than half of it, so the
/// default keeps every non-root node between 24 and 48 entries.
pub const DEFAULT_BRANCH: u64 = 48;

/// Index specific errors.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Supplied branching factor too small
    #[error("branch: {0} must be >=2")]
    BranchTooSmall(u64),

    /// The requested key is not present in the index
    #[error("key not present in index")]
    KeyNotFound,

    /// Could not find a node's child
    #[error("could not find child for node with index: {0}")]
    LostChild(usize),

    /// Could not find a node's parent
    #[error("could not find parent for node with index: {0}")]
    LostParent(usize),
}

/// A B+Tree mapping byte-string keys to block ids.
///
/// Keys are copied into the tree; ordering is delegated to the comparator
/// chosen at construction. The tree is single-writer: callers must not
/// retain node references across mutating calls, and all rebalancing
/// happens before a mutating call returns.
#[derive(Debug)]
pub struct BPlusTree<C = BytewiseComparator> {
    nodes: HashMap<NodeId, Node, BuildIdentityHasher>,
    root: NodeId,
    next_idx: NodeId,
    branch: u64,
    comparator: C,
}

impl BPlusTree {
    /// Create a new index with the specified branching factor and bytewise
    /// key ordering.
    pub fn try_new(branch: u64) -> Result<Self> {
        Self::try_with_comparator(branch, BytewiseComparator::default())
    }
}

impl Default for BPlusTree {
    fn default() -> Self {
        Self::build(DEFAULT_BRANCH, BytewiseComparator::default())
    }
}

impl<C> BPlusTree<C>
where
    C: KeyComparator,
{
    /// Create a new index ordered by the supplied comparator.
    pub fn try_with_comparator(branch: u64, comparator: C) -> Result<Self> {
        if branch < 2 {
            return Err(IndexError::BranchTooSmall(branch).into());
        }
        tracing::info!(
            branch,
            comparator = comparator.name(),
            "creating B+Tree index"
        );
        Ok(Self::build(branch, comparator))
    }

    fn build(branch: u64, comparator: C) -> Self {
        let mut nodes: HashMap<_, _, BuildIdentityHasher> = HashMap::default();
        let mut root = Node::root(branch);
        root.set_index(1);
        nodes.insert(1, root);
        Self {
            nodes,
            root: 1,
            next_idx: 2,
            branch,
            comparator,
        }
    }

    /// Record that `key` lives in `block`.
    ///
    /// A key the index already holds is absorbed silently; insertion never
    /// rebinds. Overflowing nodes split on the way back up, growing a new
    /// root when the split reaches the top.
    pub fn insert(&mut self, key: &[u8], block: BlockId) -> Result<()> {
        let (_, leaf_idx) = self.find(key)?;
        let node = self
            .nodes
            .get_mut(&leaf_idx)
            .ok_or(IndexError::LostChild(leaf_idx))?;
        let Some(pos) = node.insert_block(key.to_vec(), block, &self.comparator) else {
            tracing::debug!(?key, "key already present, insert absorbed");
            return Ok(());
        };
        if pos == 0 {
            // The leaf has a new minimum, so ancestor separators are stale.
            self.refresh_separator(leaf_idx)?;
        }
        if self.node(leaf_idx)?.is_full() {
            self.split_upward(leaf_idx)?;
        }
        Ok(())
    }

    /// Return the block holding `key`, or `None` when the index does not
    /// hold the key.
    pub fn search(&self, key: &[u8]) -> Option<BlockId> {
        let (found, leaf_idx) = self.find(key).ok()?;
        if !found {
            return None;
        }
        self.node(leaf_idx).ok()?.block(key, &self.comparator)
    }

    /// Does the index hold this key?
    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).map(|(found, _)| found).unwrap_or(false)
    }

    /// Forget `key`, returning the block it was bound to.
    ///
    /// Removing an absent key is a no-op reported as `Ok(None)`. `block` is
    /// the binding the caller believes it is releasing; a mismatch against
    /// the stored binding is logged, and the stored binding still wins.
    /// Underflowing nodes borrow from or merge with a sibling, cascading
    /// toward the root, which collapses once it is left with one child.
    pub fn remove(&mut self, key: &[u8], block: BlockId) -> Result<Option<BlockId>> {
        let (found, leaf_idx) = self.find(key)?;
        if !found {
            return Ok(None);
        }
        let node = self
            .nodes
            .get_mut(&leaf_idx)
            .ok_or(IndexError::LostChild(leaf_idx))?;
        let Some((pos, removed)) = node.remove_block(key, &self.comparator) else {
            return Ok(None);
        };
        if removed != block {
            tracing::debug!(
                stored = removed,
                supplied = block,
                "removed binding differs from caller's block id"
            );
        }
        if pos == 0 {
            self.refresh_separator(leaf_idx)?;
        }
        self.rebalance(leaf_idx)?;
        Ok(Some(removed))
    }

    /// Rebind `key` to `block`, returning the previous binding.
    ///
    /// Unlike removal, rebinding a key the index does not hold is a caller
    /// error, reported as [`IndexError::KeyNotFound`].
    pub fn update(&mut self, key: &[u8], block: BlockId) -> Result<BlockId> {
        let (found, leaf_idx) = self.find(key)?;
        if !found {
            tracing::debug!(?key, "update on a key the index does not hold");
            return Err(IndexError::KeyNotFound.into());
        }
        let node = self
            .nodes
            .get_mut(&leaf_idx)
            .ok_or(IndexError::LostChild(leaf_idx))?;
        let old = node
            .replace_block(key, block, &self.comparator)
            .ok_or(IndexError::KeyNotFound)?;
        Ok(old)
    }

    /// Reset to an empty tree.
    ///
    /// The table layer rebuilds the index by rescanning its blocks, so a
    /// wholesale reset is part of its recovery path.
    pub fn clear(&mut self) {
        tracing::debug!("clearing index");
        self.nodes.clear();
        let mut root = Node::root(self.branch);
        root.set_index(1);
        self.nodes.insert(1, root);
        self.root = 1;
        self.next_idx = 2;
    }

    /// Return count of entries.
    pub fn count(&self) -> usize {
        let mut count = 0;
        let _ = self.traverse_leaves(|leaf| {
            count += leaf.len();
            ControlFlow::Continue(())
        });
        count
    }

    /// Does the index hold no keys at all?
    pub fn is_empty(&self) -> bool {
        self.node(self.root)
            .map(|root| root.is_leaf() && root.is_empty())
            .unwrap_or(false)
    }

    /// Number of levels from the root down to the leaves.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = match self.node(self.root) {
            Ok(node) => node,
            Err(_) => return 0,
        };
        while !node.is_leaf() {
            depth += 1;
            node = match self.node(node.first_child()) {
                Ok(node) => node,
                Err(_) => return depth,
            };
        }
        depth
    }

    /// Return leaf node utilization.
    pub fn utilization(&self) -> f64 {
        let mut used = 0usize;
        let mut total = 0usize;
        let _ = self.traverse_leaves(|leaf| {
            used += leaf.len();
            total += self.branch as usize;
            ControlFlow::Continue(())
        });
        if total == 0 {
            return 0.0;
        }
        used as f64 / total as f64
    }

    /// Log basic information about the index.
    pub fn info(&self) {
        tracing::info!(
            branching = self.branch,
            entries = self.count(),
            depth = self.depth(),
            "B+Tree index"
        );
    }

    /// Verify every structural invariant, panicking on the first violation:
    /// sorted keys inside every node, fan-out bounds, separator keys equal
    /// to their child's minimum, parent back-references, and a leaf chain
    /// that visits every leaf exactly once in ascending key order.
    pub fn verify(&self) -> Result<()> {
        self.verify_node(self.root, None)?;
        self.verify_chain()
    }

    fn verify_node(&self, idx: NodeId, parent: Option<NodeId>) -> Result<()> {
        let node = self.node(idx)?;
        assert_eq!(node.parent(), parent, "parent back-reference mismatch");
        assert!(!node.is_full(), "node exceeds its branching factor");
        if parent.is_some() {
            assert!(!node.is_minimum(), "non-root node below minimum fan-out");
        }
        node.verify_keys(&self.comparator);
        if !node.is_leaf() {
            for (key, child) in node.child_entries() {
                let child_node = self.node(child)?;
                assert_eq!(
                    self.comparator.compare(key, child_node.min_key()),
                    Ordering::Equal,
                    "separator key does not match child minimum"
                );
                self.verify_node(child, Some(idx))?;
            }
        }
        Ok(())
    }

    fn verify_chain(&self) -> Result<()> {
        let mut leaves = 0usize;
        let mut previous: Option<Vec<u8>> = None;
        self.traverse_leaves(|leaf| {
            leaves += 1;
            for key in leaf.keys() {
                if let Some(prev) = &previous {
                    assert!(
                        self.comparator.compare(prev, key) == Ordering::Less,
                        "leaf chain keys not strictly ascending"
                    );
                }
                previous = Some(key.to_vec());
            }
            ControlFlow::Continue(())
        })?;
        let known = self.nodes.values().filter(|node| node.is_leaf()).count();
        assert_eq!(leaves, known, "leaf chain must visit every leaf");
        Ok(())
    }

    /// Descend from the root to the leaf that holds `key`, or would hold
    /// it. Returns whether the key is actually present in that leaf.
    fn find(&self, key: &[u8]) -> Result<(bool, NodeId)> {
        let mut node = self.node(self.root)?;
        loop {
            if node.is_leaf() {
                let found = node.key_index(key, &self.comparator).is_some();
                return Ok((found, node.index()));
            }
            node = self.node(node.child_for(key, &self.comparator))?;
        }
    }

    /// Split `idx` and keep splitting parents while they overflow, growing
    /// a new root if the top level splits.
    fn split_upward(&mut self, mut idx: NodeId) -> Result<()> {
        loop {
            let mut node = self.take_node(idx)?;
            if !node.is_full() {
                self.put_node(node);
                return Ok(());
            }
            let new = node.split();
            let new_is_leaf = new.is_leaf();
            let sep = new.min_key().to_vec();
            let parent = node.parent();
            self.put_node(node);
            let new_idx = self.add_node(new);
            if new_is_leaf {
                // Keep the leaf chain intact across the split.
                self.update_node(idx, |node| node.set_next_leaf(Some(new_idx)))?;
            }
            tracing::debug!(node = idx, sibling = new_idx, "node overflowed, split");
            match parent {
                Some(p_idx) => {
                    let parent = self
                        .nodes
                        .get_mut(&p_idx)
                        .ok_or(IndexError::LostParent(idx))?;
                    parent.insert_child(sep, new_idx, &self.comparator);
                    idx = p_idx;
                }
                None => {
                    let low = self.node(idx)?.min_key().to_vec();
                    let root =
                        Node::internal(self.branch, None, vec![low, sep], vec![idx, new_idx]);
                    let root_idx = self.add_node(root);
                    self.root = root_idx;
                    tracing::debug!(root = root_idx, "tree grew a level");
                    return Ok(());
                }
            }
        }
    }

    /// Re-establish ancestor separator keys after `idx` gained or lost its
    /// minimum entry. Walks upward while the changed node stays the first
    /// child of its parent.
    fn refresh_separator(&mut self, mut idx: NodeId) -> Result<()> {
        loop {
            let node = self.node(idx)?;
            if node.is_empty() {
                return Ok(());
            }
            let min = node.min_key().to_vec();
            let Some(p_idx) = node.parent() else {
                return Ok(());
            };
            let parent = self
                .nodes
                .get_mut(&p_idx)
                .ok_or(IndexError::LostParent(idx))?;
            parent.update_child_key(idx, min);
            match parent.child_position(idx) {
                Some(0) => idx = p_idx,
                Some(_) => return Ok(()),
                None => return Err(IndexError::LostChild(idx).into()),
            }
        }
    }

    /// Bring `idx` back above the minimum fan-out: borrow from the left
    /// sibling, else from the right, else merge, preferring the left.
    /// Merges shrink the parent, so the check cascades toward the root.
    fn rebalance(&mut self, mut idx: NodeId) -> Result<()> {
        loop {
            if idx == self.root {
                return self.collapse_root();
            }
            if !self.node(idx)?.is_minimum() {
                return Ok(());
            }
            let p_idx = self.node(idx)?.parent().ok_or(IndexError::LostParent(idx))?;
            let parent = self.node(p_idx)?;
            let pos = parent.child_position(idx).ok_or(IndexError::LostChild(idx))?;
            let left = (pos > 0).then(|| parent.child_at(pos - 1));
            let right = (pos + 1 < parent.len()).then(|| parent.child_at(pos + 1));

            if let Some(donor) = left {
                if self.node(donor)?.can_spare() {
                    return self.borrow_from_left(donor, idx, p_idx);
                }
            }
            if let Some(donor) = right {
                if self.node(donor)?.can_spare() {
                    return self.borrow_from_right(idx, donor, p_idx);
                }
            }
            if let Some(sibling) = left {
                self.merge_into_left(sibling, idx, p_idx)?;
            } else if let Some(sibling) = right {
                self.merge_into_left(idx, sibling, p_idx)?;
            } else {
                // A consistent tree gives every non-root node a sibling.
                return Err(IndexError::LostChild(idx).into());
            }
            idx = p_idx;
        }
    }

    /// While the root is an internal node with a single child, that child
    /// becomes the root and the tree shrinks by one level.
    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let root = self.node(self.root)?;
            if root.is_leaf() || root.len() != 1 {
                return Ok(());
            }
            let child = root.first_child();
            let old = self.root;
            self.nodes.remove(&old);
            self.update_node(child, |node| node.set_parent(None))?;
            self.root = child;
            tracing::debug!(root = child, "tree collapsed a level");
        }
    }

    fn borrow_from_left(&mut self, donor_idx: NodeId, idx: NodeId, p_idx: NodeId) -> Result<()> {
        tracing::debug!(donor = donor_idx, node = idx, "borrowing from left sibling");
        let mut donor = self.take_node(donor_idx)?;
        let node = self
            .nodes
            .get_mut(&idx)
            .ok_or(IndexError::LostChild(idx))?;
        let moved = donor.steal_last_into(node);
        self.put_node(donor);
        if let Some(child) = moved {
            self.update_node(child, |child| child.set_parent(Some(idx)))?;
        }
        // The node has a new minimum; fix its separator in the parent.
        let min = self.node(idx)?.min_key().to_vec();
        let parent = self
            .nodes
            .get_mut(&p_idx)
            .ok_or(IndexError::LostParent(idx))?;
        parent.update_child_key(idx, min);
        Ok(())
    }

    fn borrow_from_right(&mut self, idx: NodeId, donor_idx: NodeId, p_idx: NodeId) -> Result<()> {
        tracing::debug!(donor = donor_idx, node = idx, "borrowing from right sibling");
        let mut donor = self.take_node(donor_idx)?;
        let node = self
            .nodes
            .get_mut(&idx)
            .ok_or(IndexError::LostChild(idx))?;
        let moved = donor.steal_first_into(node);
        // The donor has a new minimum; fix its separator in the parent.
        let min = donor.min_key().to_vec();
        self.put_node(donor);
        if let Some(child) = moved {
            self.update_node(child, |child| child.set_parent(Some(idx)))?;
        }
        let parent = self
            .nodes
            .get_mut(&p_idx)
            .ok_or(IndexError::LostParent(donor_idx))?;
        parent.update_child_key(donor_idx, min);
        // The stolen entry is the node's new minimum if the node was empty.
        self.refresh_separator(idx)?;
        Ok(())
    }

    /// Absorb `right_idx` into `left_idx` and drop it from the parent and
    /// the arena. An emptied left node takes its minimum from the absorbed
    /// entries, so its ancestor separators are refreshed.
    fn merge_into_left(&mut self, left_idx: NodeId, right_idx: NodeId, p_idx: NodeId) -> Result<()> {
        tracing::debug!(absorbing = right_idx, into = left_idx, "merging sibling nodes");
        let right = self.take_node(right_idx)?;
        let moved: Vec<NodeId> = if right.is_leaf() {
            Vec::new()
        } else {
            right.children().collect()
        };
        let left = self
            .nodes
            .get_mut(&left_idx)
            .ok_or(IndexError::LostChild(left_idx))?;
        left.merge(right);
        for child in moved {
            self.update_node(child, |child| child.set_parent(Some(left_idx)))?;
        }
        let parent = self
            .nodes
            .get_mut(&p_idx)
            .ok_or(IndexError::LostParent(left_idx))?;
        parent
            .remove_child(right_idx)
            .ok_or(IndexError::LostChild(right_idx))?;
        self.refresh_separator(left_idx)?;
        Ok(())
    }

    fn first_leaf(&self) -> Result<NodeId> {
        let mut node = self.node(self.root)?;
        loop {
            if node.is_leaf() {
                return Ok(node.index());
            }
            node = self.node(node.first_child())?;
        }
    }

    /// Walk the leaf chain left to right until exhausted or the callback
    /// breaks.
    fn traverse_leaves(&self, mut f: impl FnMut(&Node) -> ControlFlow<()>) -> Result<()> {
        let mut idx = self.first_leaf()?;
        loop {
            let leaf = self.node(idx)?;
            if let ControlFlow::Break(_) = f(leaf) {
                return Ok(());
            }
            match leaf.next_leaf() {
                Some(next) => idx = next,
                None => return Ok(()),
            }
        }
    }

    fn node(&self, idx: NodeId) -> Result<&Node> {
        Ok(self.nodes.get(&idx).ok_or(IndexError::LostChild(idx))?)
    }

    fn take_node(&mut self, idx: NodeId) -> Result<Node> {
        Ok(self.nodes.remove(&idx).ok_or(IndexError::LostChild(idx))?)
    }

    fn put_node(&mut self, node: Node) {
        self.nodes.insert(node.index(), node);
    }

    fn update_node<R>(&mut self, idx: NodeId, f: impl FnOnce(&mut Node) -> R) -> Result<R> {
        let node = self.nodes.get_mut(&idx).ok_or(IndexError::LostChild(idx))?;
        Ok(f(node))
    }

    /// Register a freshly split or created node in the arena, handing it
    /// the next index and re-pointing any children it carries at it.
    fn add_node(&mut self, mut node: Node) -> NodeId {
        let idx = self.next_idx;
        self.next_idx += 1;
        node.set_index(idx);
        if !node.is_leaf() {
            let children: Vec<NodeId> = node.children().collect();
            for child in children {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.set_parent(Some(idx));
                }
            }
        }
        self.nodes.insert(idx, node);
        idx
    }
}
