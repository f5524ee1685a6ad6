// src/core/backlog.rs

//! Byte accounting for the unbounded queues between a connection's tasks.
//!
//! Producers add what they queue and consumers subtract what they have
//! written. A producer that can be paused (a socket read loop) stops reading
//! once the count reaches the high-water mark and resumes when the consumer
//! has brought it back down to the low-water mark.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Queued bytes at which reads feeding the queue are paused.
pub const HIGH_WATER: usize = 1024 * 1024;
/// Queued bytes at which paused reads resume.
pub const LOW_WATER: usize = HIGH_WATER / 4;

#[derive(Debug)]
pub struct Backlog {
    queued: AtomicUsize,
    high: usize,
    low: usize,
    drained: Notify,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new(HIGH_WATER, LOW_WATER)
    }
}

impl Backlog {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            high,
            low: low.min(high),
            drained: Notify::new(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.queued() >= self.high
    }

    pub fn add(&self, bytes: usize) {
        self.queued.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub(&self, bytes: usize) {
        let previous = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(bytes))
            })
            .unwrap_or_default();
        if previous > self.low && previous.saturating_sub(bytes) <= self.low {
            self.drained.notify_waiters();
        }
    }

    /// Returns at once unless the queue is full; otherwise waits until it has
    /// drained to the low-water mark.
    pub async fn wait_for_room(&self) {
        if !self.is_full() {
            return;
        }
        loop {
            // Registered before the check so a drain in between is not missed.
            let drained = self.drained.notified();
            if self.queued() <= self.low {
                return;
            }
            drained.await;
        }
    }
}
