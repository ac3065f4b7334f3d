//! Integer-key index facade over the backing persistent tree.
//!
//! Foreground writers either publish directly (`insert`/`update`) or hand
//! operations to `async_insert`/`add_queue`, which feed a single background
//! consumer. The consumer applies operations to the tree in enqueue order,
//! so per-producer FIFO holds and the tree has exactly one writer once the
//! async path is in use.
//!
//! Durability: `insert` flushes the metadata record and the key before the
//! tree publishes the entry, so a post-crash reader that finds the pointer
//! finds the pointee intact. `update` emits no flush; the async pipeline
//! flushes at apply time and direct callers carry the same obligation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::flush::{flush_value, FlushPolicy};
use crate::meta::{parse_key_prefix, IndexMeta, KeyAndMeta};
use crate::tree::MetaTree;

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Name of the background consumer thread.
    pub thread_name: String,
    /// Initial capacity of the pending queue.
    pub queue_capacity: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            thread_name: "nvmindex-bg".to_string(),
            queue_capacity: 1024,
        }
    }
}

/// Counter snapshot, in the spirit of the store's other metrics structs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexMetrics {
    pub enqueued: u64,
    pub batches_drained: u64,
    pub inserts_applied: u64,
    pub updates_applied: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    batches_drained: AtomicU64,
    inserts_applied: AtomicU64,
    updates_applied: AtomicU64,
}

struct Pending {
    queue: VecDeque<KeyAndMeta>,
    /// Latches true when the consumer is first started and stays true for
    /// the lifetime of the index.
    bg_started: bool,
    bg_thread: Option<JoinHandle<()>>,
}

struct IndexInner<T: MetaTree> {
    tree: Arc<T>,
    flush: Arc<dyn FlushPolicy>,
    pending: Mutex<Pending>,
    nonempty: Condvar,
    shutdown: AtomicBool,
    counters: Counters,
}

/// Ordered `u32 -> IndexMeta` index with durable publication and an
/// asynchronously drained write pipeline.
pub struct Index<T: MetaTree> {
    inner: Arc<IndexInner<T>>,
    options: IndexOptions,
}

impl<T: MetaTree + 'static> Index<T> {
    pub fn new(tree: Arc<T>, flush: Arc<dyn FlushPolicy>, options: IndexOptions) -> Self {
        let pending = Pending {
            queue: VecDeque::with_capacity(options.queue_capacity),
            bg_started: false,
            bg_thread: None,
        };
        Self {
            inner: Arc::new(IndexInner {
                tree,
                flush,
                pending: Mutex::new(pending),
                nonempty: Condvar::new(),
                shutdown: AtomicBool::new(false),
                counters: Counters::default(),
            }),
            options,
        }
    }

    /// Looks up the metadata for the integer encoded as the leading ASCII
    /// digits of `key`. Takes no lock; a read racing a concurrent publish
    /// observes either the old or the new record.
    pub fn get(&self, key: &[u8]) -> Option<IndexMeta> {
        self.inner.tree.search(parse_key_prefix(key))
    }

    /// Durable publish: flush the record, flush the key, then insert.
    pub fn insert(&self, key: u32, meta: IndexMeta) {
        self.inner.apply_insert(key, meta);
    }

    /// Conditional replace, dropped silently by the tree when the witness
    /// file number is stale.
    pub fn update(&self, key: u32, prev_file_number: u32, meta: IndexMeta) {
        self.inner.apply_update(key, prev_file_number, meta);
    }

    /// Enqueues one operation for the background consumer and returns
    /// immediately. Starts the consumer on first use; fails once the index
    /// has been stopped.
    pub fn async_insert(&self, op: KeyAndMeta) -> anyhow::Result<()> {
        let mut pending = self.inner.pending.lock();
        // Checked under the lock: the consumer only honors shutdown on an
        // empty queue, so everything accepted here is still applied.
        if self.inner.shutdown.load(Ordering::Acquire) {
            anyhow::bail!("index is stopped");
        }
        self.ensure_consumer(&mut pending)?;
        // Signal before pushing: the consumer re-checks emptiness under the
        // lock, and this keeps the empty->non-empty transition the only
        // wakeup edge.
        if pending.queue.is_empty() {
            self.inner.nonempty.notify_one();
        }
        pending.queue.push_back(op);
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bulk handoff of a pre-built batch, preserving its order without one
    /// signal per element. The pending queue must be fully drained; fails
    /// once the index has been stopped.
    pub fn add_queue(&self, batch: VecDeque<KeyAndMeta>) -> anyhow::Result<()> {
        let mut pending = self.inner.pending.lock();
        if self.inner.shutdown.load(Ordering::Acquire) {
            anyhow::bail!("index is stopped");
        }
        assert!(
            pending.queue.is_empty(),
            "batch handoff requires a drained pending queue"
        );
        self.inner
            .counters
            .enqueued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        pending.queue = batch;
        self.ensure_consumer(&mut pending)?;
        self.inner.nonempty.notify_one();
        Ok(())
    }

    pub fn metrics(&self) -> IndexMetrics {
        let queue_depth = self.inner.pending.lock().queue.len();
        let c = &self.inner.counters;
        IndexMetrics {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            batches_drained: c.batches_drained.load(Ordering::Relaxed),
            inserts_applied: c.inserts_applied.load(Ordering::Relaxed),
            updates_applied: c.updates_applied.load(Ordering::Relaxed),
            queue_depth,
        }
    }

    /// Stops the background consumer after it drains everything already
    /// enqueued, joins it, and returns the final counters. Stopping is
    /// terminal: later `async_insert`/`add_queue` calls are rejected.
    pub fn stop(&self) -> anyhow::Result<IndexMetrics> {
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = {
            let mut pending = self.inner.pending.lock();
            self.inner.nonempty.notify_one();
            pending.bg_thread.take()
        };
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("index consumer thread panicked"))?;
        }
        Ok(self.metrics())
    }

    fn ensure_consumer(&self, pending: &mut Pending) -> anyhow::Result<()> {
        if pending.bg_started {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(self.options.thread_name.clone())
            .spawn(move || inner.run())
            .context("spawn index consumer thread")?;
        pending.bg_started = true;
        pending.bg_thread = Some(handle);
        debug!(thread = %self.options.thread_name, "index consumer started");
        Ok(())
    }
}

impl<T: MetaTree> Drop for Index<T> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let handle = {
            let mut pending = self.inner.pending.lock();
            self.inner.nonempty.notify_one();
            pending.bg_thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<T: MetaTree> IndexInner<T> {
    fn apply_insert(&self, key: u32, meta: IndexMeta) {
        // Publication order: pointee first, then the key, then the pointer
        // write inside the tree.
        flush_value(&*self.flush, &meta);
        flush_value(&*self.flush, &key);
        self.tree.insert(key, meta);
        self.counters.inserts_applied.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_update(&self, key: u32, prev_file_number: u32, meta: IndexMeta) {
        self.tree.update(key, prev_file_number, meta);
        self.counters.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer loop. Waits for the queue to turn non-empty, drains it
    /// fully with the lock held, and goes back to waiting. The shutdown
    /// flag is honored only on an empty queue, so everything enqueued
    /// before `stop` is applied.
    fn run(&self) {
        loop {
            let mut pending = self.pending.lock();
            while pending.queue.is_empty() {
                if self.shutdown.load(Ordering::Acquire) {
                    debug!("index consumer exiting");
                    return;
                }
                self.nonempty.wait(&mut pending);
            }

            let drained = pending.queue.len();
            while let Some(op) = pending.queue.pop_front() {
                if op.prev_file_number == 0 {
                    self.apply_insert(op.key, op.meta);
                } else {
                    // The queued record was flushed when its data file was
                    // written; the conditional replace publishes it as-is.
                    flush_value(&*self.flush, &op.meta);
                    self.apply_update(op.key, op.prev_file_number, op.meta);
                }
            }
            debug_assert!(pending.queue.is_empty());
            self.counters.batches_drained.fetch_add(1, Ordering::Relaxed);
            trace!(drained, "index batch applied");
        }
    }
}
