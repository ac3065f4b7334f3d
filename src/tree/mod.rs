//! Backing-tree seam.
//!
//! The index publishes into a persistent ordered map owned by the embedding
//! store (a B+-tree variant on NVM). The map's persistence and concurrency
//! contracts are its own; the index only requires that `search` may run
//! concurrently with a writer and never observes a torn record.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::meta::IndexMeta;

pub trait MetaTree: Send + Sync {
    /// Point lookup. Racing with a concurrent insert is allowed; the result
    /// is either the old or the new record.
    fn search(&self, key: u32) -> Option<IndexMeta>;

    /// Unconditional publish. An existing entry is replaced.
    fn insert(&self, key: u32, meta: IndexMeta);

    /// Conditional replace: applied only while the indexed entry still
    /// references `prev_file_number`. Stale updates are dropped silently.
    fn update(&self, key: u32, prev_file_number: u32, meta: IndexMeta);
}

/// Stand-in for the persistent B+-tree.
///
/// An ordinary ordered map behind a read-write lock. Keeps the API surface
/// identical so the real tree can replace the internals without touching
/// call sites; used by tests and volatile runs.
#[derive(Debug, Default)]
pub struct BTreeStandIn {
    map: RwLock<BTreeMap<u32, IndexMeta>>,
}

impl BTreeStandIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl MetaTree for BTreeStandIn {
    fn search(&self, key: u32) -> Option<IndexMeta> {
        self.map.read().get(&key).copied()
    }

    fn insert(&self, key: u32, meta: IndexMeta) {
        self.map.write().insert(key, meta);
    }

    fn update(&self, key: u32, prev_file_number: u32, meta: IndexMeta) {
        let mut map = self.map.write();
        match map.get(&key) {
            Some(current) if current.file_number == prev_file_number => {
                map.insert(key, meta);
            }
            _ => {}
        }
    }
}
