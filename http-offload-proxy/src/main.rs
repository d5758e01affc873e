use std::sync::Arc;

use prometheus::Registry;

use http_offload::worker::UpdateQueue;
use http_offload_proxy::config::Config;
use http_offload_proxy::handler::CacheHandler;
use http_offload_proxy::metrics::PrometheusSink;
use http_offload_proxy::server::{self, App};
use http_offload_proxy::upstream::UpstreamClient;
use http_offload_proxy::{build_cacher, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(&config.server.log_level);

    let cacher = build_cacher(&config).await?;
    let worker = Arc::new(UpdateQueue::new(config.cache.revalidate_queue_size));
    let registry = Registry::new();
    let metrics = Arc::new(PrometheusSink::new(&registry)?);
    let upstream = Arc::new(UpstreamClient::new(config.cache.downstream_host.clone()));

    let handler = CacheHandler::new(
        Arc::clone(&cacher),
        worker,
        metrics,
        upstream,
        Arc::new(config.cache.clone()),
    );
    let app = App::new(handler, cacher, registry, config.cache.ignore_paths.clone());

    server::run(app, config.server.port, config.server.grace_period).await
}
