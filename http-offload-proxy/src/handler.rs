//! The cache-aware request handler.
//!
//! Disposition of an incoming request, in order: WebSocket upgrades, non-GET
//! methods and range requests bypass the cache and proxy straight through.
//! Everything else is fingerprinted and looked up; a fresh hit is served
//! from memory, a stale hit is served from memory *and* schedules a
//! single-flight background refresh, and a miss proxies upstream with a
//! capture hook that stores eligible responses.
//!
//! The cache is an accelerator, not a source of truth: no cache-layer error
//! ever turns a successful upstream response into a client-visible failure.
//! Lookup errors degrade to a plain pass-through.

use std::sync::Arc;

use bytes::Bytes;
use http::request::Parts;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::{debug, error, info, warn};

use http_offload::key::fingerprint;
use http_offload::worker::UpdateQueue;
use http_offload::{strip_hop_by_hop, CachedResponse, Cacher, XCACHE};

use crate::config::CacheSettings;
use crate::metrics::MetricsSink;
use crate::upstream::{full_body, ProxyBody, UpstreamClient};

const BAD_GATEWAY_BODY: &str = "service unavailable";

/// Orchestrates lookup, proxy fallback, response capture and revalidation
/// dispatch.
pub struct CacheHandler {
    cacher: Arc<dyn Cacher>,
    worker: Arc<UpdateQueue>,
    metrics: Arc<dyn MetricsSink>,
    upstream: Arc<UpstreamClient>,
    settings: Arc<CacheSettings>,
}

impl Clone for CacheHandler {
    fn clone(&self) -> Self {
        Self {
            cacher: Arc::clone(&self.cacher),
            worker: Arc::clone(&self.worker),
            metrics: Arc::clone(&self.metrics),
            upstream: Arc::clone(&self.upstream),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl CacheHandler {
    /// Wires the handler to its collaborators.
    pub fn new(
        cacher: Arc<dyn Cacher>,
        worker: Arc<UpdateQueue>,
        metrics: Arc<dyn MetricsSink>,
        upstream: Arc<UpstreamClient>,
        settings: Arc<CacheSettings>,
    ) -> Self {
        Self { cacher, worker, metrics, upstream, settings }
    }

    /// Serves one request. Never fails: upstream trouble surfaces as a
    /// `502 Bad Gateway` response.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if is_websocket_upgrade(req.headers()) {
            info!(path = %req.uri().path(), "will not cache websocket request");
            return match self.upstream.tunnel(req).await {
                Ok(response) => response,
                Err(err) => bad_gateway(&err),
            };
        }

        let (parts, body) = req.into_parts();

        if parts.method != Method::GET {
            debug!(method = %parts.method, "will not cache non-GET request");
            return self.forward(parts, body).await;
        }
        if parts.headers.contains_key(header::RANGE) {
            debug!("will not cache range request");
            return self.forward(parts, body).await;
        }

        let key = fingerprint(&parts, &self.settings.key);

        let hit = match self.cacher.lookup(&key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(error = %err, "cache lookup failed, treating as miss");
                None
            }
        };

        match hit {
            None => self.fetch_and_capture(&parts, key).await,
            Some((cached, freshness)) => {
                info!(path = %parts.uri.path(), "serving request from cache");
                self.metrics.cache_hit(&parts.method, cached.status);
                if freshness.is_stale() {
                    self.dispatch_revalidation(key, parts);
                }
                serve_cached(cached)
            }
        }
    }

    /// Plain pass-through for requests that never participate in caching.
    /// Upgrade requests are tunneled.
    pub async fn forward_only(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if is_websocket_upgrade(req.headers()) {
            return match self.upstream.tunnel(req).await {
                Ok(response) => response,
                Err(err) => bad_gateway(&err),
            };
        }
        let (parts, body) = req.into_parts();
        self.forward(parts, body).await
    }

    async fn forward(&self, parts: Parts, body: Incoming) -> Response<ProxyBody> {
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!(error = %err, "failed to read request body");
                return plain_response(StatusCode::BAD_REQUEST, "bad request");
            }
        };
        match self.upstream.send(&parts, body).await {
            Ok(response) => response.map(BodyExt::boxed),
            Err(err) => bad_gateway(&err),
        }
    }

    /// Miss path: proxy upstream, buffer the response, store it when
    /// eligible and relay it to the client.
    async fn fetch_and_capture(&self, parts: &Parts, key: String) -> Response<ProxyBody> {
        debug!("will cache response from downstream");
        let response = match self.upstream.send(parts, Bytes::new()).await {
            Ok(response) => response,
            Err(err) => return bad_gateway(&err),
        };

        let (res_parts, res_body) = response.into_parts();
        self.metrics.cache_miss(&parts.method, res_parts.status);

        let body = match res_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!(error = %err, "error reading upstream response body");
                return bad_gateway(&err);
            }
        };

        if let Some(envelope) =
            capture_envelope(&self.settings, res_parts.status, &res_parts.headers, &body)
        {
            if let Err(err) = self.cacher.store(&key, envelope).await {
                error!(error = %err, "error storing response in cache");
            }
        }

        let mut response = Response::from_parts(res_parts, full_body(body));
        strip_hop_by_hop(response.headers_mut());
        response.headers_mut().insert(XCACHE, HeaderValue::from_static("MISS"));
        response
    }

    /// Hands the refresh to the single-flight queue on a detached task, so
    /// the client going away cannot cancel it.
    fn dispatch_revalidation(&self, key: String, parts: Parts) {
        let cacher = Arc::clone(&self.cacher);
        let metrics = Arc::clone(&self.metrics);
        let upstream = Arc::clone(&self.upstream);
        let worker = Arc::clone(&self.worker);
        let settings = Arc::clone(&self.settings);

        tokio::spawn(async move {
            let work = async {
                let response = match upstream.send(&parts, Bytes::new()).await {
                    Ok(response) => response,
                    Err(err) => {
                        error!(error = %err, "revalidation request to upstream failed");
                        return;
                    }
                };
                let (res_parts, res_body) = response.into_parts();
                metrics.cache_miss(&parts.method, res_parts.status);
                let body = match res_body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(err) => {
                        error!(error = %err, "error reading revalidation response body");
                        return;
                    }
                };
                if let Some(envelope) =
                    capture_envelope(&settings, res_parts.status, &res_parts.headers, &body)
                {
                    if let Err(err) = cacher.store(&key, envelope).await {
                        error!(error = %err, "error storing revalidated response");
                    }
                }
            };
            worker.start(&key, work).await;
        });
    }
}

/// Applies the write policy: only `200`/`204` responses without
/// `Set-Cookie` and within the body size cap are stored, with hop-by-hop
/// headers stripped from the stored copy.
fn capture_envelope(
    settings: &CacheSettings,
    status: StatusCode,
    headers: &HeaderMap,
    body: &Bytes,
) -> Option<CachedResponse> {
    if status.is_server_error() {
        warn!("won't cache 5XX downstream responses");
        return None;
    }
    if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
        debug!(status = %status, "response status is not cacheable");
        return None;
    }
    if headers.contains_key(header::SET_COOKIE) {
        debug!("won't cache response carrying set-cookie");
        return None;
    }
    if body.len() > settings.max_cache_body_bytes {
        warn!(
            size = body.len(),
            limit = settings.max_cache_body_bytes,
            "response body exceeds the cacheable size limit"
        );
        return None;
    }
    let mut envelope = CachedResponse::new(status, headers.clone(), body.clone());
    envelope.strip_for_storage();
    Some(envelope)
}

/// Replays a stored envelope: stored headers (hop-by-hop stripped again),
/// explicit `Content-Length`, then status and body.
fn serve_cached(cached: CachedResponse) -> Response<ProxyBody> {
    let CachedResponse { status, mut headers, body } = cached;
    strip_hop_by_hop(&mut headers);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(XCACHE, HeaderValue::from_static("HIT"));

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let to_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    wants_upgrade && to_websocket
}

fn bad_gateway(err: &dyn std::error::Error) -> Response<ProxyBody> {
    error!(error = %err, "downstream server is unreachable");
    plain_response(StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY)
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::get("/connect");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn websocket_upgrade_needs_both_headers() {
        assert!(is_websocket_upgrade(
            request(&[("connection", "Upgrade"), ("upgrade", "websocket")]).headers()
        ));
        assert!(is_websocket_upgrade(
            request(&[("connection", "keep-alive, Upgrade"), ("upgrade", "WebSocket")]).headers()
        ));
        assert!(!is_websocket_upgrade(request(&[("connection", "upgrade")]).headers()));
        assert!(!is_websocket_upgrade(request(&[("upgrade", "websocket")]).headers()));
        assert!(!is_websocket_upgrade(
            request(&[("connection", "upgrade"), ("upgrade", "h2c")]).headers()
        ));
    }

    fn settings() -> CacheSettings {
        use crate::config::Strategy;
        use http_offload::key::KeyConfig;
        use std::time::Duration;

        CacheSettings {
            strategy: Strategy::Lru,
            capacity_mb: 50.0,
            stale_after: Duration::from_secs(5),
            key: KeyConfig::default(),
            ignore_paths: Vec::new(),
            revalidate_queue_size: 10,
            max_cache_body_bytes: 16,
            lookup_timeout: Duration::from_millis(500),
            downstream_host: http::Uri::from_static("http://backend:8080"),
        }
    }

    fn ok_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers
    }

    #[test]
    fn capture_rejects_ineligible_statuses() {
        let settings = settings();
        let body = Bytes::from_static(b"x");
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::CREATED,
            StatusCode::MOVED_PERMANENTLY,
            StatusCode::NOT_FOUND,
        ] {
            assert!(capture_envelope(&settings, status, &ok_headers(), &body).is_none());
        }
        assert!(capture_envelope(&settings, StatusCode::OK, &ok_headers(), &body).is_some());
        assert!(capture_envelope(&settings, StatusCode::NO_CONTENT, &ok_headers(), &body).is_some());
    }

    #[test]
    fn capture_rejects_set_cookie() {
        let settings = settings();
        let mut headers = ok_headers();
        headers.insert("set-cookie", HeaderValue::from_static("session=1"));
        assert!(
            capture_envelope(&settings, StatusCode::OK, &headers, &Bytes::from_static(b"x"))
                .is_none()
        );
    }

    #[test]
    fn capture_rejects_oversized_bodies() {
        let settings = settings();
        let at_limit = Bytes::from(vec![0u8; settings.max_cache_body_bytes]);
        let over_limit = Bytes::from(vec![0u8; settings.max_cache_body_bytes + 1]);
        assert!(capture_envelope(&settings, StatusCode::OK, &ok_headers(), &at_limit).is_some());
        assert!(capture_envelope(&settings, StatusCode::OK, &ok_headers(), &over_limit).is_none());
    }

    #[test]
    fn capture_strips_hop_by_hop_headers() {
        let settings = settings();
        let mut headers = ok_headers();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let envelope =
            capture_envelope(&settings, StatusCode::OK, &headers, &Bytes::from_static(b"x"))
                .expect("eligible response");
        assert!(envelope.headers.get("transfer-encoding").is_none());
        assert_eq!(envelope.headers.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn served_response_carries_length_and_cache_marker() {
        let mut headers = ok_headers();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let cached =
            CachedResponse::new(StatusCode::OK, headers, Bytes::from_static(b"cached body"));

        let response = serve_cached(cached);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(XCACHE).unwrap(), "HIT");
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "11");
        assert!(response.headers().get("connection").is_none());
    }
}
