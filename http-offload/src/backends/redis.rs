//! Redis-backed cache, behind the `backend-redis` feature.
//!
//! Unlike the in-memory engines, capacity and eviction are Redis's problem
//! (configure `maxmemory` + an eviction policy server-side); this adapter
//! only implements the [`Cacher`] contract. The stored record carries a
//! wall-clock insertion timestamp so freshness survives the hop out of the
//! process.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::{CacheError, CachedResponse, Cacher, Freshness, Result};

/// Wire form of an envelope. Headers are kept as ordered pairs so insertion
/// and per-name order survive the round trip.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEnvelope {
    status: u16,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    stored_at: u64,
}

impl StoredEnvelope {
    fn from_response(response: &CachedResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), value.as_bytes().to_vec()))
                .collect(),
            body: response.body.to_vec(),
            stored_at: unix_now(),
        }
    }

    fn into_response(self) -> Result<CachedResponse> {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            headers.append(name, HeaderValue::from_bytes(value)?);
        }
        Ok(CachedResponse {
            status: StatusCode::from_u16(self.status)?,
            headers,
            body: Bytes::from(self.body),
        })
    }
}

/// Implements [`Cacher`] against a shared Redis instance, for deployments
/// where several proxy replicas should agree on cached content.
#[derive(Clone)]
pub struct RedisCacher {
    conn: redis::aio::MultiplexedConnection,
    stale_after: Duration,
    command_timeout: Duration,
}

impl fmt::Debug for RedisCacher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedisCacher")
            .field("stale_after", &self.stale_after)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisCacher {
    /// Connects to Redis at `url` over a multiplexed connection.
    pub async fn connect(url: &str, stale_after: Duration, command_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn, stale_after, command_timeout })
    }
}

#[async_trait]
impl Cacher for RedisCacher {
    async fn lookup(&self, key: &str) -> Result<Option<(CachedResponse, Freshness)>> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> =
            tokio::time::timeout(self.command_timeout, conn.get::<_, Option<Vec<u8>>>(key))
                .await
                .map_err(|_| CacheError::LookupTimeout)??;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored: StoredEnvelope = postcard::from_bytes(&raw)?;
        let age = unix_now().saturating_sub(stored.stored_at);
        let freshness = if age < self.stale_after.as_secs() {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Ok(Some((stored.into_response()?, freshness)))
    }

    async fn store(&self, key: &str, response: CachedResponse) -> Result<()> {
        let raw = postcard::to_allocvec(&StoredEnvelope::from_response(&response))?;
        let mut conn = self.conn.clone();
        tokio::time::timeout(self.command_timeout, conn.set::<_, _, ()>(key, raw))
            .await
            .map_err(|_| CacheError::LookupTimeout)??;
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|age| age.as_secs()).unwrap_or(0)
}
