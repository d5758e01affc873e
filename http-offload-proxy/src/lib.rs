//! A memoizing reverse proxy.
//!
//! Sits between clients and one upstream HTTP service and transparently
//! replays cached responses for idempotent requests. Fresh entries are
//! served straight from memory; stale entries are still served immediately
//! while a single-flight background refresh brings them up to date
//! (stale-while-revalidate). Everything else (non-GET methods, WebSocket
//! upgrades, range requests and configured path prefixes) passes straight
//! through to the upstream.
//!
//! The cache machinery (fingerprinting, LRU/LFU engines, revalidation
//! queue) lives in the `http-offload` crate; this crate wires it to an HTTP
//! surface: environment configuration, the hyper server with graceful
//! shutdown, the pooled upstream client, Prometheus counters and the
//! liveness/readiness probes.

pub mod config;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

use http_offload::engines::{LfuCache, LruCache};
use http_offload::Cacher;

use crate::config::{Config, Storage, Strategy};

/// Installs the global tracing subscriber, filtered by the configured level.
/// A [`LogTracer`] is installed first so `log` records from the core crate
/// land in the same pipe.
pub fn init_tracing(level: &str) {
    if let Err(err) = LogTracer::init() {
        eprintln!("could not install the log bridge: {err}");
    }
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not install the tracing subscriber: {err}");
    }
}

/// Builds the cache backend selected by `SERVER_STORAGE` and
/// `CACHE_STRATEGY`.
pub async fn build_cacher(config: &Config) -> anyhow::Result<Arc<dyn Cacher>> {
    let cache = &config.cache;
    match config.server.storage {
        Storage::Memory => match cache.strategy {
            Strategy::Lru => Ok(Arc::new(LruCache::new(
                cache.capacity_mb,
                cache.stale_after,
                cache.lookup_timeout,
            ))),
            Strategy::Lfu => Ok(Arc::new(LfuCache::new(
                cache.capacity_mb,
                cache.stale_after,
                cache.lookup_timeout,
            ))),
        },
        Storage::Redis => build_redis_cacher(config, cache.stale_after, cache.lookup_timeout).await,
    }
}

#[cfg(feature = "backend-redis")]
async fn build_redis_cacher(
    config: &Config,
    stale_after: Duration,
    command_timeout: Duration,
) -> anyhow::Result<Arc<dyn Cacher>> {
    use anyhow::Context;

    let redis = config
        .redis
        .as_ref()
        .context("REDIS_CONNECTION_STRING is required when SERVER_STORAGE=redis")?;
    let cacher =
        http_offload::RedisCacher::connect(&redis.connection_string, stale_after, command_timeout)
            .await
            .context("could not connect to redis")?;
    Ok(Arc::new(cacher))
}

#[cfg(not(feature = "backend-redis"))]
async fn build_redis_cacher(
    _config: &Config,
    _stale_after: Duration,
    _command_timeout: Duration,
) -> anyhow::Result<Arc<dyn Cacher>> {
    anyhow::bail!("SERVER_STORAGE=redis requires a build with the backend-redis feature")
}
