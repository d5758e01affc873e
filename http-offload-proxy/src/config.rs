//! Environment-driven configuration.
//!
//! Everything the proxy needs comes from environment variables (a `.env`
//! file is honored when present). Values with sensible defaults fall back
//! silently; `DOWNSTREAM_HOST` is the only variable that must be set for a
//! memory-backed deployment.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use http::Uri;

use http_offload::key::KeyConfig;

const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Eviction policy for the in-memory engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Evict the least recently used entry.
    Lru,
    /// Evict the least frequently used entry.
    Lfu,
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Strategy::Lru),
            "lfu" => Ok(Strategy::Lfu),
            other => bail!("unknown cache strategy {other:?}, expected \"lru\" or \"lfu\""),
        }
    }
}

/// Which backend holds cached responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Per-instance in-memory cache.
    Memory,
    /// Shared Redis instance (requires the `backend-redis` feature).
    Redis,
}

impl FromStr for Storage {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Storage::Memory),
            "redis" => Ok(Storage::Redis),
            other => bail!("unknown storage {other:?}, expected \"memory\" or \"redis\""),
        }
    }
}

/// Listener and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// How long a graceful shutdown may drain connections.
    pub grace_period: Duration,
    /// Cache backend selection.
    pub storage: Storage,
    /// Filter directive for the tracing subscriber.
    pub log_level: String,
}

/// Cache behavior settings consumed by the handler and the engines.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Eviction policy.
    pub strategy: Strategy,
    /// Engine capacity in megabytes of body bytes.
    pub capacity_mb: f64,
    /// Freshness horizon for cached entries.
    pub stale_after: Duration,
    /// Fingerprint configuration.
    pub key: KeyConfig,
    /// Path prefixes that bypass the cache entirely.
    pub ignore_paths: Vec<String>,
    /// Bound on concurrently tracked background refreshes.
    pub revalidate_queue_size: usize,
    /// Largest response body eligible for caching.
    pub max_cache_body_bytes: usize,
    /// Per-lookup deadline.
    pub lookup_timeout: Duration,
    /// The upstream origin requests are forwarded to.
    pub downstream_host: Uri,
}

/// Redis connection settings, read only when `SERVER_STORAGE=redis`.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub connection_string: String,
}

/// The full proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and process-level settings.
    pub server: ServerConfig,
    /// Cache behavior settings.
    pub cache: CacheSettings,
    /// Redis settings, present when the redis backend is selected.
    pub redis: Option<RedisConfig>,
}

impl Config {
    /// Reads the whole configuration from the environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let storage: Storage = env_or("SERVER_STORAGE", "memory").parse()?;

        let server = ServerConfig {
            port: parse_env("SERVER_PORT", "8000")?,
            grace_period: Duration::from_secs(parse_env("SHUTDOWN_GRACE_PERIOD", "30")?),
            storage,
            log_level: env_or("SERVER_LOG_LEVEL", "warn"),
        };

        let downstream_host = required_env("DOWNSTREAM_HOST")?;
        let downstream_host: Uri = downstream_host
            .parse()
            .with_context(|| format!("could not parse downstream url: {downstream_host}"))?;
        if downstream_host.scheme().is_none() || downstream_host.authority().is_none() {
            bail!("DOWNSTREAM_HOST must be an absolute URL, e.g. http://backend:8080");
        }

        let key = KeyConfig {
            hash_query: parse_env("CACHE_SHOULD_HASH_QUERY", "true")?,
            query_ignore: lowercase_set(env_as_list("CACHE_HASH_QUERY_IGNORE")),
            hash_headers: env_as_list("CACHE_HASH_HEADERS"),
            global_keys: parse_global_keys(&env_or("CACHE_GLOBAL_KEYS", "")),
        };

        let cache = CacheSettings {
            strategy: env_or("CACHE_STRATEGY", "lfu").parse()?,
            capacity_mb: parse_env("CACHE_CAPACITY_MB", "50")?,
            stale_after: Duration::from_secs(parse_env("CACHE_STALE_WHILE_REVALIDATE_SEC", "5")?),
            key,
            ignore_paths: env_as_list("CACHE_IGNORE_ENDPOINTS"),
            revalidate_queue_size: parse_env("CACHE_REVALIDATE_QUEUE_SIZE", "1000")?,
            max_cache_body_bytes: parse_env(
                "CACHE_MAX_BODY_BYTES",
                &DEFAULT_MAX_BODY_BYTES.to_string(),
            )?,
            lookup_timeout: Duration::from_millis(parse_env("CACHE_LOOKUP_TIMEOUT_MS", "500")?),
            downstream_host,
        };

        let redis = match storage {
            Storage::Redis => Some(RedisConfig {
                connection_string: required_env("REDIS_CONNECTION_STRING")?,
            }),
            Storage::Memory => None,
        };

        Ok(Self { server, cache, redis })
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_owned(),
        _ => default.to_owned(),
    }
}

fn required_env(key: &str) -> anyhow::Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_owned()),
        _ => bail!("{key} is not set"),
    }
}

fn parse_env<T>(key: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_or(key, default)
        .parse()
        .with_context(|| format!("could not parse {key}"))
}

fn env_as_list(key: &str) -> Vec<String> {
    split_list(&env_or(key, ""))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

fn lowercase_set(values: Vec<String>) -> HashSet<String> {
    values.into_iter().map(|value| value.to_ascii_lowercase()).collect()
}

/// Parses `"/assets:static-assets,/_next:nextjs-assets"` into ordered
/// `(prefix, key)` pairs. Pairs without exactly one colon are skipped as
/// malformed.
fn parse_global_keys(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.split(':');
            let (Some(prefix), Some(key), None) = (parts.next(), parts.next(), parts.next())
            else {
                return None;
            };
            let (prefix, key) = (prefix.trim(), key.trim());
            if prefix.is_empty() || key.is_empty() {
                return None;
            }
            Some((prefix.to_owned(), key.to_owned()))
        })
        .collect()
}
