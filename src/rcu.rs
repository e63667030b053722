//! Module `rcu` implement quiescent-state based reclamation for index
//! workers.
//!
//! Every worker, foreground or background, registers for a stable
//! worker-id and publishes a monotonically increasing epoch word. Workers
//! bump their epoch between model-node hops and at the end of every
//! operation, which declares: _I hold no reference obtained before this
//! point_. A worker parked on a blocking call publishes a `waiting` flag
//! instead.
//!
//! [Registry::barrier] samples every non-waiting worker's epoch and spins
//! until each of them either advances or turns waiting. A background job
//! calls the barrier after publishing a replacement node and before
//! releasing the retired node, proving no concurrent reader can still be
//! inside it.

use std::sync::atomic::{
    AtomicBool, AtomicU64, AtomicUsize,
    Ordering::SeqCst,
};
use std::thread;

use crate::{Error, Result};

/// One cache line per worker, writers of one slot never contend with
/// another worker's slot.
#[repr(align(64))]
#[derive(Default)]
struct Slot {
    epoch: AtomicU64,
    waiting: AtomicBool,
}

/// Registry of worker epochs, sized at construction.
pub struct Registry {
    slots: Vec<Slot>,
    registered: AtomicUsize,
}

impl Registry {
    pub fn new(max_workers: usize) -> Registry {
        let mut slots = Vec::with_capacity(max_workers);
        (0..max_workers).for_each(|_| slots.push(Slot::default()));

        Registry {
            slots,
            registered: AtomicUsize::new(0),
        }
    }

    /// Hand out the next stable worker-id. A fresh worker starts in
    /// waiting state, it goes on-line at the head of each operation via
    /// [Registry::stop_waiting] and off-line again at the tail via
    /// [Registry::start_waiting], so that idle workers never hold up a
    /// [Registry::barrier].
    pub fn register(&self) -> Result<usize> {
        let worker_id = self.registered.fetch_add(1, SeqCst);
        if worker_id >= self.slots.len() {
            self.registered.fetch_sub(1, SeqCst);
            err_at!(InvalidInput, msg: "can't register more than {} workers", self.slots.len())
        } else {
            self.slots[worker_id].waiting.store(true, SeqCst);
            Ok(worker_id)
        }
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        std::cmp::min(self.registered.load(SeqCst), self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declare a quiescent point for `worker_id`.
    #[inline]
    pub fn progress(&self, worker_id: usize) {
        self.slots[worker_id].epoch.fetch_add(1, SeqCst);
    }

    /// Declare that `worker_id` is parked on a blocking call and shall not
    /// be waited upon by [Registry::barrier].
    #[inline]
    pub fn start_waiting(&self, worker_id: usize) {
        self.slots[worker_id].waiting.store(true, SeqCst);
    }

    /// Worker resumed, epoch is bumped so that pre-wait references don't
    /// count against a concurrent barrier.
    #[inline]
    pub fn stop_waiting(&self, worker_id: usize) {
        self.slots[worker_id].epoch.fetch_add(1, SeqCst);
        self.slots[worker_id].waiting.store(false, SeqCst);
    }

    /// Wait till every registered worker passes a quiescent point, at least
    /// once after this call sampled its epoch. `worker_id` is the caller's
    /// own slot, marked waiting for the duration so that concurrent
    /// barriers don't dead-lock on each other.
    pub fn barrier(&self, worker_id: usize) {
        self.start_waiting(worker_id);

        let n = self.len();
        let sampled: Vec<u64> = (0..n).map(|w| self.slots[w].epoch.load(SeqCst)).collect();

        for w in 0..n {
            if w == worker_id {
                continue;
            }
            loop {
                if self.slots[w].waiting.load(SeqCst) {
                    break;
                }
                if self.slots[w].epoch.load(SeqCst) > sampled[w] {
                    break;
                }
                thread::yield_now();
            }
        }

        self.stop_waiting(worker_id);
    }
}

#[cfg(test)]
#[path = "rcu_test.rs"]
mod rcu_test;
