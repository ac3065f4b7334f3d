//! NVM-resident sorted segment: a doubly-linked skiplist of byte-string
//! key/value pairs.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`] handles;
//! per-level forward/backward links are id vectors. Level 0 is the source of
//! truth: key and value bytes are flushed when a node is built, and the two
//! level-0 forward-link flushes during insert publish the node durably.
//! Higher levels are an in-memory acceleration structure that adoption
//! rebuilds from node heights, so a crash between high-level link writes and
//! the level-0 publication leaves a consistent pre-insert structure.
//!
//! Single writer. Readers concurrent with a writer are not supported.

use std::cell::Cell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comparator::{BytewiseComparator, Comparator};
use crate::flush::FlushPolicy;

/// Hard cap on node height; sentinels are always this tall.
pub const MAX_LEVEL: usize = 32;

/// Stable handle to a node in the list's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

const HEAD: NodeId = NodeId(0);
const TAIL: NodeId = NodeId(1);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct SkiplistOptions {
    /// Maximum node height drawn by the level generator.
    pub max_level: usize,
    /// Geometric promotion: a node reaches the next level with
    /// probability `1 / branching`.
    pub branching: u32,
}

impl Default for SkiplistOptions {
    fn default() -> Self {
        Self {
            max_level: MAX_LEVEL,
            branching: 4,
        }
    }
}

#[derive(Debug)]
struct Node {
    key: Bytes,
    value: Bytes,
    level: usize,
    next: Vec<NodeId>,
    prev: Vec<NodeId>,
}

impl Node {
    fn payload_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Owns the nodes of one list (or one released chain). Unlinked nodes stay
/// allocated until the arena drops, which is when physical reclamation
/// happens.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Box<Node>>,
}

impl NodeArena {
    fn alloc(&mut self, key: Bytes, value: Bytes, level: usize) -> NodeId {
        let id = u32::try_from(self.nodes.len()).expect("arena exhausted");
        self.nodes.push(Box::new(Node {
            key,
            value,
            level,
            next: vec![NodeId(0); level],
            prev: vec![NodeId(0); level],
        }));
        NodeId(id)
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Address of the level-0 forward-link slot, for publication flushes.
    fn next0_slot(&self, id: NodeId) -> (*const u8, usize) {
        let slot = &self.nodes[id.index()].next[0];
        (slot as *const NodeId as *const u8, mem::size_of::<NodeId>())
    }
}

/// A still-linked level-0 run of nodes released from a skiplist, together
/// with the arena that owns them. The ownership-safe rendition of handing a
/// `[first, last]` pair of in-NVM nodes to a new container.
#[derive(Debug)]
pub struct Chain {
    arena: NodeArena,
    first: NodeId,
    last: NodeId,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain endpoints are not connected at level 0")]
    Broken,
}

/// Read-only view of one node.
pub struct NodeRef<'a, C: Comparator> {
    list: &'a PersistentSkiplist<C>,
    id: NodeId,
}

impl<C: Comparator> Clone for NodeRef<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Comparator> Copy for NodeRef<'_, C> {}

impl<'a, C: Comparator> NodeRef<'a, C> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &'a [u8] {
        &self.list.arena.node(self.id).key
    }

    pub fn value(&self) -> &'a [u8] {
        &self.list.arena.node(self.id).value
    }

    pub fn level(&self) -> usize {
        self.list.arena.node(self.id).level
    }

    pub fn next(&self, level: usize) -> Option<NodeId> {
        self.list.arena.node(self.id).next.get(level).copied()
    }

    pub fn prev(&self, level: usize) -> Option<NodeId> {
        self.list.arena.node(self.id).prev.get(level).copied()
    }
}

pub struct PersistentSkiplist<C: Comparator = BytewiseComparator> {
    comparator: C,
    flush: Arc<dyn FlushPolicy>,
    options: SkiplistOptions,
    arena: NodeArena,
    current_level: usize,
    current_size: usize,
    rng: StdRng,
    // Single-writer structure: keeps the type !Sync so shared references
    // cannot cross threads while a writer runs.
    _not_sync: PhantomData<Cell<()>>,
}

impl<C: Comparator> PersistentSkiplist<C> {
    pub fn new(comparator: C, flush: Arc<dyn FlushPolicy>, options: SkiplistOptions) -> Self {
        Self::with_rng(comparator, flush, options, StdRng::from_entropy())
    }

    /// Deterministic construction for tests and repeatable benchmarks.
    pub fn with_rng(
        comparator: C,
        flush: Arc<dyn FlushPolicy>,
        options: SkiplistOptions,
        rng: StdRng,
    ) -> Self {
        assert!(options.max_level >= 1 && options.max_level <= MAX_LEVEL);
        assert!(options.branching >= 2);
        let mut arena = NodeArena::default();
        let max = options.max_level;
        let head = arena.alloc(Bytes::new(), Bytes::new(), max);
        let tail = arena.alloc(Bytes::new(), Bytes::new(), max);
        debug_assert_eq!(head, HEAD);
        debug_assert_eq!(tail, TAIL);
        for i in 0..max {
            arena.node_mut(HEAD).next[i] = TAIL;
            arena.node_mut(HEAD).prev[i] = HEAD;
            arena.node_mut(TAIL).prev[i] = HEAD;
            arena.node_mut(TAIL).next[i] = TAIL;
        }
        let (addr, len) = arena.next0_slot(HEAD);
        flush.flush(addr, len);
        Self {
            comparator,
            flush,
            options,
            arena,
            current_level: 1,
            current_size: 0,
            rng,
            _not_sync: PhantomData,
        }
    }

    /// Adopts a released chain without copying its nodes: threads the
    /// chain's sentinels over the existing level-0 run and rebuilds every
    /// higher level from node heights. Only level 0 is trusted, so this is
    /// also the recovery path for a chain whose upper levels are stale.
    pub fn adopt(
        comparator: C,
        flush: Arc<dyn FlushPolicy>,
        options: SkiplistOptions,
        chain: Chain,
    ) -> Result<Self, ChainError> {
        assert!(options.max_level >= 1 && options.max_level <= MAX_LEVEL);
        assert!(options.branching >= 2);
        let Chain {
            mut arena,
            first,
            last,
        } = chain;

        // The chain's nodes are never taller than its sentinels, so the
        // sentinel height bounds every level touched below.
        let sentinel_level = arena.node(HEAD).level;
        for i in 0..sentinel_level {
            arena.node_mut(HEAD).next[i] = TAIL;
            arena.node_mut(HEAD).prev[i] = HEAD;
            arena.node_mut(TAIL).prev[i] = HEAD;
            arena.node_mut(TAIL).next[i] = TAIL;
        }

        arena.node_mut(HEAD).next[0] = first;
        arena.node_mut(first).prev[0] = HEAD;
        arena.node_mut(TAIL).prev[0] = last;
        arena.node_mut(last).next[0] = TAIL;
        let (addr, len) = arena.next0_slot(HEAD);
        flush.flush(addr, len);

        // Rebuild levels > 0 by walking the chain once, appending each node
        // tall enough for a level behind that level's running tail.
        let mut current_level = 1;
        let mut current_size = 0;
        let mut tails = vec![HEAD; sentinel_level];
        let mut node = first;
        loop {
            let level = arena.node(node).level;
            current_size += arena.node(node).payload_size();
            if level > current_level {
                current_level = level;
            }
            for i in 1..level {
                let left = tails[i];
                arena.node_mut(left).next[i] = node;
                arena.node_mut(node).prev[i] = left;
                arena.node_mut(node).next[i] = TAIL;
                arena.node_mut(TAIL).prev[i] = node;
                tails[i] = node;
            }
            if node == last {
                break;
            }
            let next = arena.node(node).next[0];
            if next == TAIL || next == node {
                return Err(ChainError::Broken);
            }
            node = next;
        }

        Ok(Self {
            comparator,
            flush,
            options,
            arena,
            current_level,
            current_size,
            rng: StdRng::from_entropy(),
            _not_sync: PhantomData,
        })
    }

    /// Strips the sentinels and hands out the level-0 chain, still linked,
    /// for adoption by another list. `None` when the list holds no nodes.
    pub fn release(self) -> Option<Chain> {
        let first = self.arena.node(HEAD).next[0];
        if first == TAIL {
            return None;
        }
        let last = self.arena.node(TAIL).prev[0];
        Some(Chain {
            arena: self.arena,
            first,
            last,
        })
    }

    pub fn head(&self) -> NodeId {
        HEAD
    }

    pub fn tail(&self) -> NodeId {
        TAIL
    }

    pub fn node(&self, id: NodeId) -> NodeRef<'_, C> {
        NodeRef { list: self, id }
    }

    pub fn is_empty(&self) -> bool {
        self.arena.node(HEAD).next[0] == TAIL
    }

    pub fn current_level(&self) -> usize {
        self.current_level
    }

    /// Total key+value bytes of live nodes. Cheap; excludes link overhead.
    pub fn approximate_memory_usage(&self) -> usize {
        self.current_size
    }

    /// Inserts the pair and returns the new node's handle. An equal key is
    /// placed after the first existing equal node, so level-0 order is
    /// non-decreasing with duplicates allowed and every duplicate stays
    /// reachable.
    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> NodeId {
        let key = key.into();
        let value = value.into();

        let geq = self.find_greater_or_equal(&key);
        // An equal key lands immediately after the existing node, keeping
        // level 0 non-decreasing with every duplicate still reachable.
        let (mut prev, mut next) = if geq != TAIL && self.equal(&self.arena.node(geq).key, &key) {
            (geq, self.arena.node(geq).next[0])
        } else {
            (self.arena.node(geq).prev[0], geq)
        };

        let level = self.random_level();
        let id = self.make_node(key, value, level);
        if level > self.current_level {
            self.current_level = level;
        }

        for i in 0..level {
            // Climb to neighbors tall enough for this level.
            while self.arena.node(next).level <= i {
                next = self.arena.node(next).next[i - 1];
            }
            while self.arena.node(prev).level <= i {
                prev = self.arena.node(prev).prev[i - 1];
            }
            self.arena.node_mut(id).next[i] = next;
            self.arena.node_mut(next).prev[i] = id;
            self.arena.node_mut(id).prev[i] = prev;
            self.arena.node_mut(prev).next[i] = id;
            if i == 0 {
                // The two forward-link flushes publish the node; everything
                // above level 0 is reconstructable.
                let (addr, len) = self.arena.next0_slot(id);
                self.flush.flush(addr, len);
                let (addr, len) = self.arena.next0_slot(next);
                self.flush.flush(addr, len);
            }
        }

        self.current_size += self.arena.node(id).payload_size();
        id
    }

    /// Handle of the node holding `key`, if present. With duplicates this
    /// is the first (oldest) node of the equal run.
    pub fn find(&self, key: &[u8]) -> Option<NodeId> {
        let id = self.find_greater_or_equal(key);
        if id != TAIL && self.equal(&self.arena.node(id).key, key) {
            Some(id)
        } else {
            None
        }
    }

    /// Unlinks the inclusive range `[first, last]` from every level. The
    /// nodes stay allocated in the arena; only the links change. The
    /// level-0 flush of the left neighbor's forward link commits the
    /// unlink durably.
    pub fn erase(&mut self, first: NodeId, last: NodeId) {
        assert!(first != HEAD && first != TAIL && last != HEAD && last != TAIL);

        // Walk the doomed run once for size accounting, verifying the
        // endpoints actually bound a level-0 range.
        let mut erased = 0usize;
        let mut node = first;
        loop {
            assert!(node != TAIL, "erase endpoints do not bound a range");
            erased += self.arena.node(node).payload_size();
            if node == last {
                break;
            }
            node = self.arena.node(node).next[0];
        }

        let mut left = self.arena.node(first).prev[0];
        let mut right = self.arena.node(last).next[0];
        for level in 0..self.current_level {
            self.arena.node_mut(left).next[level] = right;
            self.arena.node_mut(right).prev[level] = left;
            if level == 0 {
                let (addr, len) = self.arena.next0_slot(left);
                self.flush.flush(addr, len);
            }
            // Move outward to neighbors tall enough for the next level.
            // The sentinels are maximal, so stop there.
            while left != HEAD && self.arena.node(left).level <= level + 1 {
                left = self.arena.node(left).prev[level];
            }
            while right != TAIL && self.arena.node(right).level <= level + 1 {
                right = self.arena.node(right).next[level];
            }
        }

        while self.current_level > 1 && self.arena.node(HEAD).next[self.current_level - 1] == TAIL
        {
            self.current_level -= 1;
        }
        self.current_size -= erased;
    }

    fn find_greater_or_equal(&self, key: &[u8]) -> NodeId {
        let mut node = HEAD;
        for i in (0..self.current_level).rev() {
            loop {
                let next = self.arena.node(node).next[i];
                if next != TAIL
                    && self.comparator.compare(&self.arena.node(next).key, key) == Ordering::Less
                {
                    node = next;
                } else {
                    break;
                }
            }
        }
        self.arena.node(node).next[0]
    }

    fn equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.comparator.compare(a, b) == Ordering::Equal
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < self.options.max_level && self.rng.gen_ratio(1, self.options.branching) {
            level += 1;
        }
        level
    }

    /// Allocates the node and flushes its payload bytes; links are written
    /// (and the forward chain published) by the caller.
    fn make_node(&mut self, key: Bytes, value: Bytes, level: usize) -> NodeId {
        let id = self.arena.alloc(key, value, level);
        self.flush.flush_slice(&self.arena.node(id).key);
        self.flush.flush_slice(&self.arena.node(id).value);
        id
    }
}
