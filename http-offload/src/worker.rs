//! Single-flight coordination for background refreshes.
//!
//! When a stale entry is served, the handler schedules a refresh of that key
//! against the upstream. The queue guarantees that at most one refresh per
//! key is running at any instant and bounds the total number of tracked
//! refreshes, so a burst of stale hits cannot stampede the upstream.
//!
//! The queue only coordinates, it never spawns. Callers run
//! [`UpdateQueue::start`] on a task of their own (detached from the request
//! that triggered it, so client disconnects do not cancel refreshes already
//! under way).

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

/// Default bound on concurrently tracked refreshes.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// Tracks cache keys with a refresh in flight, admitting at most one refresh
/// per key and at most `capacity` refreshes overall.
#[derive(Debug)]
pub struct UpdateQueue {
    in_flight: Mutex<HashSet<String>>,
    capacity: usize,
}

impl Default for UpdateQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl UpdateQueue {
    /// Creates a queue tracking at most `capacity` refreshes; zero falls
    /// back to [`DEFAULT_QUEUE_SIZE`].
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 { DEFAULT_QUEUE_SIZE } else { capacity };
        Self { in_flight: Mutex::new(HashSet::new()), capacity }
    }

    /// Runs `work` unless a refresh for `key` is already in flight or the
    /// queue is at capacity, in which case the refresh is dropped (the next
    /// stale hit will retry). The key stays tracked for the duration of
    /// `work` and is released however `work` terminates, panic unwind and
    /// task abort included.
    pub async fn start<F>(&self, key: &str, work: F)
    where
        F: Future<Output = ()>,
    {
        let Some(_guard) = self.admit(key) else { return };
        work.await;
    }

    /// Number of refreshes currently tracked.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn admit(&self, key: &str) -> Option<InFlight<'_>> {
        let mut in_flight = self.lock();
        if in_flight.len() >= self.capacity {
            warn!("revalidation queue is full, dropping refresh for {key}");
            return None;
        }
        if !in_flight.insert(key.to_owned()) {
            debug!("refresh for {key} already in flight");
            return None;
        }
        Some(InFlight { queue: self, key: key.to_owned() })
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the tracked key when dropped, which also covers unwinding and
/// cancelled tasks.
struct InFlight<'a> {
    queue: &'a UpdateQueue,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.lock().remove(&self.key);
    }
}
