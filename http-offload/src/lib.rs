#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! Core building blocks for a memoizing reverse proxy.
//!
//! A proxy built on this crate sits in front of an upstream HTTP service and
//! transparently replays previously captured responses for idempotent
//! requests, refreshing stale entries in the background while still serving
//! the stale copy (stale-while-revalidate). This crate provides the pieces
//! that policy hangs off of:
//!
//! - [`CachedResponse`]: the stored unit of status, headers and body captured
//!   from the upstream, with hop-by-hop headers stripped.
//! - [`key`]: deterministic request fingerprinting (SHA-256 over method,
//!   path and canonical query/header projections) plus literal global keys
//!   for whole path sub-trees.
//! - [`engines`]: capacity-bounded in-memory caches with LRU or LFU
//!   eviction and freshness tracking.
//! - [`worker`]: a single-flight queue guaranteeing at most one background
//!   refresh per key.
//! - `RedisCacher` (feature `backend-redis`): the same [`Cacher`] contract
//!   backed by a shared Redis instance instead of process memory.
//!
//! The HTTP surface itself (routing, upstream client, metrics exposition)
//! lives in the companion proxy crate; everything here is transport-agnostic
//! beyond the `http` types.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use bytes::Bytes;
//! use http::{HeaderMap, StatusCode};
//! use http_offload::{engines::LruCache, CachedResponse, Cacher, Freshness};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> http_offload::Result<()> {
//! let cache = LruCache::new(50.0, Duration::from_secs(5), Duration::from_millis(500));
//! let envelope = CachedResponse::new(
//!     StatusCode::OK,
//!     HeaderMap::new(),
//!     Bytes::from_static(b"hello"),
//! );
//! cache.store("key", envelope).await?;
//! let (hit, freshness) = cache.lookup("key").await?.expect("entry just stored");
//! assert_eq!(hit.body.as_ref(), b"hello");
//! assert_eq!(freshness, Freshness::Fresh);
//! # Ok(())
//! # }
//! ```

pub mod engines;
mod error;
pub mod key;
pub mod worker;

#[cfg(feature = "backend-redis")]
mod backends;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, StatusCode};

pub use error::{CacheError, Result};

#[cfg(feature = "backend-redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "backend-redis")))]
pub use backends::redis::RedisCacher;

/// `x-cache` header: HIT when the response was served from cache, MISS when
/// it was captured from the upstream.
pub const XCACHE: &str = "x-cache";

/// Headers whose meaning is local to a single transport connection. They are
/// never forwarded to the upstream, stored in the cache, or replayed from it.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers from `headers`, including any additional names
/// the `Connection` header declares hop-by-hop for this exchange.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in connection_listed {
        headers.remove(&name);
    }
}

/// Age of a cache entry relative to the configured freshness horizon.
///
/// Computed by the cache on every lookup; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The entry is younger than the horizon and can be served as-is.
    Fresh,
    /// The entry outlived the horizon. It is still served, but the handler
    /// should schedule a background refresh.
    Stale,
}

impl Freshness {
    /// Whether a background refresh should be scheduled for this entry.
    pub fn is_stale(self) -> bool {
        matches!(self, Freshness::Stale)
    }
}

/// A response captured from the upstream, as the cache stores and replays it.
///
/// Headers keep their insertion and per-name order. The body is reference
/// counted, so handing an envelope out of the cache does not copy it; holders
/// must treat it as read-only.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Status code, captured verbatim from the upstream.
    pub status: StatusCode,
    /// Response headers destined for (or replayed from) the cache.
    pub headers: HeaderMap,
    /// The full response body.
    pub body: Bytes,
}

impl CachedResponse {
    /// Builds an envelope from captured response parts.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// Body length in bytes; this is the entry's weight for capacity
    /// accounting.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Removes everything that must not survive the hop into the cache:
    /// hop-by-hop headers and `Set-Cookie`.
    pub fn strip_for_storage(&mut self) {
        strip_hop_by_hop(&mut self.headers);
        self.headers.remove(header::SET_COOKIE);
    }
}

/// The storage contract the proxy handler runs against.
///
/// Implemented by the in-memory [`engines`] and by the Redis backend. The
/// cache is an accelerator, not a source of truth: callers treat every error
/// from these methods as a miss and fall through to the upstream.
#[async_trait]
pub trait Cacher: Send + Sync + 'static {
    /// Fetches the envelope stored under `key` together with its freshness,
    /// updating the engine's recency/frequency bookkeeping on a hit.
    ///
    /// Fails with [`CacheError::LookupTimeout`] when the engine cannot answer
    /// within its configured deadline.
    async fn lookup(&self, key: &str) -> Result<Option<(CachedResponse, Freshness)>>;

    /// Inserts or replaces the envelope stored under `key`, evicting entries
    /// as needed to stay within capacity. Replacing resets the entry's age.
    async fn store(&self, key: &str, response: CachedResponse) -> Result<()>;

    /// Health check backing the readiness probe. In-memory engines are
    /// always ready.
    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test;
