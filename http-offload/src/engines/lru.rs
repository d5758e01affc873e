use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::warn;

use super::list::{Arena, List, NIL};
use super::{capacity_bytes, freshness_since, lookup_with_deadline};
use crate::{CachedResponse, Cacher, Freshness, Result};

/// In-memory cache that evicts the least recently used entry under capacity
/// pressure.
///
/// Entries sit on a doubly-linked list ordered most-recently-used first;
/// both lookups and stores splice the touched entry to the head, and the
/// eviction loop pops tails until the tracked body size fits the capacity
/// again. An envelope whose body alone exceeds the whole capacity is
/// rejected with a warning rather than wiping the cache for it.
#[derive(Debug)]
pub struct LruCache {
    inner: Arc<Mutex<LruInner>>,
    stale_after: Duration,
    lookup_timeout: Duration,
}

#[derive(Debug)]
struct LruInner {
    arena: Arena<Entry>,
    order: List,
    index: HashMap<String, usize>,
    size: u64,
    capacity: u64,
}

#[derive(Debug)]
struct Entry {
    key: String,
    response: CachedResponse,
    inserted_at: Instant,
}

impl LruCache {
    /// Creates an engine holding at most `capacity_mb` megabytes of body
    /// bytes. Non-positive capacities fall back to
    /// [`DEFAULT_CAPACITY_MB`](super::DEFAULT_CAPACITY_MB).
    pub fn new(capacity_mb: f64, stale_after: Duration, lookup_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LruInner {
                arena: Arena::new(),
                order: List::new(),
                index: HashMap::new(),
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

    fn lock(&self) -> MutexGuard<'_, LruInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Cacher for LruCache {
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

impl LruInner {
    fn lookup(&mut self, key: &str, stale_after: Duration) -> Option<(CachedResponse, Freshness)> {
        let idx = *self.index.get(key)?;
        self.order.unlink(&mut self.arena, idx);
        self.order.push_front(&mut self.arena, idx);
        let entry = self.arena.get(idx);
        Some((entry.response.clone(), freshness_since(entry.inserted_at, stale_after)))
    }

    fn store(&mut self, key: &str, response: CachedResponse) {
        let body_len = response.body_len() as u64;
        if body_len > self.capacity {
            warn!("response body ({body_len} bytes) exceeds the cache capacity, not storing");
            return;
        }

        match self.index.get(key).copied() {
            Some(idx) => {
                let entry = self.arena.get_mut(idx);
                self.size -= entry.response.body_len() as u64;
                entry.response = response;
                entry.inserted_at = Instant::now();
                self.size += body_len;
                self.order.unlink(&mut self.arena, idx);
                self.order.push_front(&mut self.arena, idx);
            }
            None => {
                let idx = self.arena.insert(Entry {
                    key: key.to_owned(),
                    response,
                    inserted_at: Instant::now(),
                });
                self.order.push_front(&mut self.arena, idx);
                self.index.insert(key.to_owned(), idx);
                self.size += body_len;
            }
        }

        while self.size > self.capacity {
            let victim = self.order.tail();
            if victim == NIL {
                break;
            }
            self.order.unlink(&mut self.arena, victim);
            let evicted = self.arena.remove(victim);
            self.index.remove(&evicted.key);
            self.size -= evicted.response.body_len() as u64;
        }
    }
}
