// Staging queue: lock-free multi-producer ingress with a single-consumer
// drain, either order-preserving (swap a generation out, settle writers,
// sort) or high-throughput unordered.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_queue::SegQueue;

use crate::record::Record;

/// Upper bound on one unordered drain.
pub(crate) const DRAIN_BATCH: usize = 1024;

/// One swappable instance of the staging structure. The channel does not
/// guarantee FIFO across producers, so each record carries an index from the
/// atomic counter and ordered drains sort by it.
pub(crate) struct Generation {
    insert_pos: AtomicU64,
    writers: AtomicI32,
    queue: SegQueue<Record>,
}

impl Generation {
    fn new() -> Self {
        Self {
            insert_pos: AtomicU64::new(0),
            writers: AtomicI32::new(0),
            queue: SegQueue::new(),
        }
    }

    fn push_unordered(&self, mut record: Record) {
        record.insertion_index = self.insert_pos.fetch_add(1, Ordering::Relaxed);
        self.queue.push(record);
    }

    // The writer count brackets the publish so an ordered drain can wait out
    // producers that hold an index but have not pushed yet.
    fn push_ordered(&self, mut record: Record) {
        self.writers.fetch_add(1, Ordering::AcqRel);
        record.insertion_index = self.insert_pos.fetch_add(1, Ordering::Relaxed);
        self.queue.push(record);
        self.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Multi-producer, single-consumer staging queue.
///
/// Producers never block on capacity; the queue is logically unbounded. The
/// delivery mode is chosen once at pipeline init and not changed while
/// records are in flight.
pub(crate) struct StagingQueue {
    requests_remaining: AtomicU64,
    ordered: AtomicBool,
    active: RwLock<Arc<Generation>>,
}

impl StagingQueue {
    pub fn new() -> Self {
        Self {
            requests_remaining: AtomicU64::new(0),
            ordered: AtomicBool::new(true),
            active: RwLock::new(Arc::new(Generation::new())),
        }
    }

    pub fn set_ordered(&self, ordered: bool) {
        self.ordered.store(ordered, Ordering::Relaxed);
    }

    /// Records enqueued but not yet drained.
    pub fn requests_remaining(&self) -> u64 {
        self.requests_remaining.load(Ordering::Relaxed)
    }

    /// Non-blocking; safe from any number of producers concurrently. The
    /// generation handle is held across the publish so a concurrent swap
    /// can never strand a record in a detached generation.
    pub fn enqueue(&self, record: Record) {
        self.requests_remaining.fetch_add(1, Ordering::Relaxed);
        let active = self.active.read().unwrap();
        if self.ordered.load(Ordering::Relaxed) {
            active.push_ordered(record);
        } else {
            active.push_unordered(record);
        }
    }

    /// Drain in the configured mode into `out`, reusing its allocation.
    pub fn drain(&self, out: &mut Vec<Record>) {
        if self.ordered.load(Ordering::Relaxed) {
            self.drain_ordered(out);
        } else {
            self.drain_unordered(out);
        }
    }

    /// Bulk-dequeue up to [`DRAIN_BATCH`] records with no ordering claim.
    pub fn drain_unordered(&self, out: &mut Vec<Record>) {
        out.clear();
        let active = Arc::clone(&self.active.read().unwrap());
        while out.len() < DRAIN_BATCH {
            match active.queue.pop() {
                Some(record) => out.push(record),
                None => break,
            }
        }
        self.requests_remaining
            .fetch_sub(out.len() as u64, Ordering::Relaxed);
    }

    /// Swap a fresh generation in, wait for in-flight writers on the old one
    /// to settle, then take everything it holds and restore enqueue order.
    pub fn drain_ordered(&self, out: &mut Vec<Record>) {
        out.clear();

        let standby = Arc::new(Generation::new());
        let drained = {
            let mut active = self.active.write().unwrap();
            std::mem::replace(&mut *active, standby)
        };

        // Expected to settle within nanoseconds.
        while drained.writers.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }

        let published = drained.insert_pos.load(Ordering::Acquire);
        if published == 0 {
            return;
        }

        out.reserve(published as usize);
        while (out.len() as u64) < published {
            match drained.queue.pop() {
                Some(record) => out.push(record),
                None => break,
            }
        }

        // The channel buckets per producer; a stable adaptive sort restores
        // global order cheaply because the runs are already mostly sorted.
        out.sort();

        self.requests_remaining
            .fetch_sub(out.len() as u64, Ordering::Relaxed);
    }
}
