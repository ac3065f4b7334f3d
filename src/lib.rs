//! `nvmindex` is the persistent secondary-index layer of a log-structured
//! key-value store whose data files live on byte-addressable non-volatile
//! memory.
//!
//! This crate is intentionally opinionated about crash consistency first:
//! - Every in-place mutation that must survive power loss goes through one
//!   flush primitive, and every flush is a publication flush: payload bytes
//!   reach the persistence domain before the pointer write exposing them.
//! - The index applies writes through a single background consumer, so the
//!   backing tree has exactly one writer and operations land in enqueue
//!   order.
//! - The skiplist treats level 0 as the only durable truth; higher levels
//!   are rebuilt, never recovered.
//!
//! Two hardened structures make up the crate: [`Index`], an ordered
//! `u32 -> IndexMeta` map with durable updates and asynchronous batching,
//! and [`PersistentSkiplist`], an NVM-resident doubly-linked skiplist used
//! as a sorted mutable segment of the store.

pub mod comparator;
pub mod flush;
pub mod index;
pub mod meta;
pub mod skiplist;
pub mod tree;

pub use comparator::{BytewiseComparator, Comparator};
pub use flush::{CacheLineFlush, FlushPolicy, NoopFlush, RecordingFlush};
pub use index::{Index, IndexMetrics, IndexOptions};
pub use meta::{parse_key_prefix, IndexMeta, KeyAndMeta};
pub use skiplist::{Chain, ChainError, NodeId, NodeRef, PersistentSkiplist, SkiplistOptions, MAX_LEVEL};
pub use tree::{BTreeStandIn, MetaTree};
