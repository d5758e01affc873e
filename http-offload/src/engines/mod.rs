//! Capacity-bounded in-memory cache engines.
//!
//! Two eviction policies share one contract: capacity is a floating-point
//! number of megabytes counted over body bytes only (headers and bookkeeping
//! are excluded since bodies dominate), entries age against a single
//! `stale_after` horizon, and lookups run under a deadline so a contended
//! cache lock cannot stall the request path.
//!
//! Engine state sits behind one mutex per instance. Stores hold it for their
//! whole duration; lookups do too, because a hit mutates the
//! recency/frequency bookkeeping. The deadline is enforced by running the
//! locked lookup body on a blocking side task and racing it against a timer.

mod lfu;
mod list;
mod lru;

pub use lfu::LfuCache;
pub use lru::LruCache;

use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::{CacheError, Freshness, Result};

/// Fallback capacity applied when a non-positive size is configured.
pub const DEFAULT_CAPACITY_MB: f64 = 50.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn capacity_bytes(capacity_mb: f64) -> u64 {
    let mb = if capacity_mb <= 0.0 { DEFAULT_CAPACITY_MB } else { capacity_mb };
    (mb * BYTES_PER_MB) as u64
}

fn freshness_since(inserted_at: Instant, stale_after: Duration) -> Freshness {
    if inserted_at.elapsed() < stale_after {
        Freshness::Fresh
    } else {
        Freshness::Stale
    }
}

/// Runs `body` (which acquires the engine lock) on a blocking task, racing it
/// against `deadline`. Expiry surfaces as [`CacheError::LookupTimeout`].
async fn lookup_with_deadline<T, F>(deadline: Duration, body: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(body)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join)) => Err(CacheError::Internal(anyhow!("cache lookup task failed: {join}"))),
        Err(_) => Err(CacheError::LookupTimeout),
    }
}
