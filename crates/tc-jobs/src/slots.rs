//! Bounded pool of transcoder slots.
//!
//! A [`ResourceSlot`] is held for the whole time a job's process runs. The
//! pool never blocks: callers either get a slot now or queue the job
//! themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct SlotCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub capacity: usize,
    pub in_use: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

/// Fixed-capacity slot pool.
#[derive(Debug, Clone)]
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<SlotCounters>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::default(),
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<ResourceSlot> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Some(ResourceSlot {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.capacity,
            in_use: self.in_use(),
            acquired_total: self.counters.acquired.load(Ordering::Relaxed),
            released_total: self.counters.released.load(Ordering::Relaxed),
        }
    }
}

/// A held slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct ResourceSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl Drop for ResourceSlot {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}
