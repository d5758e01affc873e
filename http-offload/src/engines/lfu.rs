use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;

use super::list::{Arena, List, NIL};
use super::{capacity_bytes, freshness_since, lookup_with_deadline};
use crate::{CachedResponse, Cacher, Freshness, Result};

/// In-memory cache that evicts the least frequently used entry under
/// capacity pressure, breaking frequency ties by recency.
///
/// Entries are grouped into one recency list per access frequency. A hit
/// moves the entry to the head of the next-higher frequency list; eviction
/// takes the tail of the lowest populated frequency, so at equal frequency
/// the least recently used entry goes first. `min_frequency` tracks the
/// lowest populated list; when that list drains, the next minimum comes from
/// a scan of the remaining frequencies.
#[derive(Debug)]
pub struct LfuCache {
    inner: Arc<Mutex<LfuInner>>,
    stale_after: Duration,
    lookup_timeout: Duration,
}

#[derive(Debug)]
struct LfuInner {
    arena: Arena<Entry>,
    lists: HashMap<u64, List>,
    index: HashMap<String, usize>,
    min_frequency: u64,
    size: u64,
    capacity: u64,
}

#[derive(Debug)]
struct Entry {
    key: String,
    response: CachedResponse,
    inserted_at: Instant,
    frequency: u64,
}

impl LfuCache {
    /// Creates an engine holding at most `capacity_mb` megabytes of body
    /// bytes. Non-positive capacities fall back to
    /// [`DEFAULT_CAPACITY_MB`](super::DEFAULT_CAPACITY_MB).
    pub fn new(capacity_mb: f64, stale_after: Duration, lookup_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LfuInner {
                arena: Arena::new(),
                lists: HashMap::new(),
                index: HashMap::new(),
                min_frequency: 1,
                size: 0,
                capacity: capacity_bytes(capacity_mb),
            })),
            stale_after,
            lookup_timeout,
        }
    }

    /// Number of entries currently cached.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LfuInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Cacher for LfuCache {
    async fn lookup(&self, key: &str) -> Result<Option<(CachedResponse, Freshness)>> {
        let inner = Arc::clone(&self.inner);
        let stale_after = self.stale_after;
        let key = key.to_owned();
        lookup_with_deadline(self.lookup_timeout, move || {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.lookup(&key, stale_after)
        })
        .await
    }

    async fn store(&self, key: &str, response: CachedResponse) -> Result<()> {
        self.lock().store(key, response);
        Ok(())
    }
}

impl LfuInner {
    fn lookup(&mut self, key: &str, stale_after: Duration) -> Option<(CachedResponse, Freshness)> {
        let idx = *self.index.get(key)?;
        self.promote(idx);
        let entry = self.arena.get(idx);
        Some((entry.response.clone(), freshness_since(entry.inserted_at, stale_after)))
    }

    fn store(&mut self, key: &str, response: CachedResponse) {
        let body_len = response.body_len() as u64;
        if body_len > self.capacity {
            warn!("response body ({body_len} bytes) exceeds the cache capacity, not storing");
            return;
        }

        if let Some(&idx) = self.index.get(key) {
            let entry = self.arena.get_mut(idx);
            self.size -= entry.response.body_len() as u64;
            entry.response = response;
            entry.inserted_at = Instant::now();
            self.size += body_len;
            self.promote(idx);
            while self.size > self.capacity && self.evict() {}
            return;
        }

        self.size += body_len;
        while self.size > self.capacity && self.evict() {}

        let idx = self.arena.insert(Entry {
            key: key.to_owned(),
            response,
            inserted_at: Instant::now(),
            frequency: 1,
        });
        self.lists.entry(1).or_insert_with(List::new).push_front(&mut self.arena, idx);
        self.index.insert(key.to_owned(), idx);
        self.min_frequency = 1;
    }

    /// Moves the entry from its current frequency list to the head of the
    /// next one, advancing `min_frequency` when the old list drains.
    fn promote(&mut self, idx: usize) {
        let count = self.arena.get(idx).frequency;
        let mut drained = false;
        if let Some(list) = self.lists.get_mut(&count) {
            list.unlink(&mut self.arena, idx);
            drained = list.is_empty();
        }
        if drained {
            self.lists.remove(&count);
            if self.min_frequency == count {
                self.min_frequency = count + 1;
            }
        }
        let next = count + 1;
        self.arena.get_mut(idx).frequency = next;
        self.lists.entry(next).or_insert_with(List::new).push_front(&mut self.arena, idx);
    }

    fn evict(&mut self) -> bool {
        let min = self.min_frequency;
        let Some(list) = self.lists.get_mut(&min) else {
            return false;
        };
        let victim = list.tail();
        if victim == NIL {
            return false;
        }
        list.unlink(&mut self.arena, victim);
        let drained = list.is_empty();
        if drained {
            self.lists.remove(&min);
            self.min_frequency = self.next_min();
        }
        let evicted = self.arena.remove(victim);
        self.index.remove(&evicted.key);
        self.size -= evicted.response.body_len() as u64;
        true
    }

    /// O(number of distinct frequencies); the common case of the next
    /// frequency up being populated is checked first.
    fn next_min(&self) -> u64 {
        if self.lists.contains_key(&(self.min_frequency + 1)) {
            return self.min_frequency + 1;
        }
        self.lists.keys().copied().min().unwrap_or(1)
    }
}
