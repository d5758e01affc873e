//! HTTP surface: routing, probes, metrics exposition and the serve loop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use prometheus::Registry;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use http_offload::Cacher;

use crate::handler::CacheHandler;
use crate::metrics;
use crate::upstream::{full_body, ProxyBody};

/// The routed application: cache handler plus the operational endpoints.
pub struct App {
    handler: CacheHandler,
    cacher: Arc<dyn Cacher>,
    registry: Registry,
    ignore_paths: Vec<String>,
}

impl App {
    /// Assembles the application surface.
    pub fn new(
        handler: CacheHandler,
        cacher: Arc<dyn Cacher>,
        registry: Registry,
        ignore_paths: Vec<String>,
    ) -> Self {
        Self { handler, cacher, registry, ignore_paths }
    }

    /// Routes one request.
    pub async fn route(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        match req.uri().path() {
            "/metrics/prometheus" => self.metrics_response(),
            "/probes/liveness" => plain(StatusCode::OK, "ok"),
            "/probes/readiness" => self.readiness().await,
            path if self.is_ignored(path) => {
                info!(path, "will not cache this request");
                self.handler.forward_only(req).await
            }
            _ => self.handler.handle(req).await,
        }
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignore_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    fn metrics_response(&self) -> Response<ProxyBody> {
        match metrics::render(&self.registry) {
            Ok(rendered) => {
                let mut response = Response::new(full_body(rendered));
                response.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(err) => {
                warn!(error = %err, "could not encode metrics");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }

    async fn readiness(&self) -> Response<ProxyBody> {
        match self.cacher.check_connection().await {
            Ok(()) => plain(StatusCode::OK, "ready"),
            Err(err) => {
                warn!(error = %err, "readiness check failed");
                plain(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}

/// Binds `0.0.0.0:port` and serves until SIGINT/SIGTERM, then drains
/// connections within `grace_period`.
pub async fn run(app: App, port: u16, grace_period: Duration) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("could not bind port {port}"))?;
    info!(port, "starting server");
    serve(app, listener, grace_period).await
}

/// Serves connections from an already-bound listener. Split out so tests can
/// bind an ephemeral port themselves.
pub async fn serve(app: App, listener: TcpListener, grace_period: Duration) -> anyhow::Result<()> {
    let app = Arc::new(app);
    let builder = auto::Builder::new(TokioExecutor::new());
    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let app = Arc::clone(&app);
                let service = service_fn(move |req| {
                    let app = Arc::clone(&app);
                    async move { Ok::<_, Infallible>(app.route(req).await) }
                });
                let conn = builder.serve_connection_with_upgrades(io, service).into_owned();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(err) = conn.await {
                        debug!(error = %err, "connection ended with an error");
                    }
                });
            }
            () = &mut shutdown => {
                warn!("received interrupt signal, shutting down");
                break;
            }
        }
    }

    tokio::select! {
        () = graceful.shutdown() => info!("all connections drained"),
        () = tokio::time::sleep(grace_period) => warn!("graceful shutdown timed out, forcing exit"),
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
