//! Upstream plumbing: URI rewriting, the pooled client and upgrade
//! tunneling.

use std::time::Duration;

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{header, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tracing::warn;

use http_offload::strip_hop_by_hop;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Boxed response body used across the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A body holding the given bytes.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// An empty body.
pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// Errors from talking to the upstream origin.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No response within the request timeout.
    #[error("upstream request timed out")]
    Timeout,
    /// Connection-level failure.
    #[error(transparent)]
    Connect(#[from] hyper_util::client::legacy::Error),
    /// The rewritten request could not be assembled.
    #[error(transparent)]
    Http(#[from] http::Error),
}

/// Pooled client pinned to one origin. Every outgoing request is rewritten
/// onto that origin with hop-by-hop request headers stripped and the `Host`
/// header substituted.
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    origin: Uri,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").field("origin", &self.origin).finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Creates a client for the given origin (scheme + authority).
    pub fn new(origin: Uri) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build_http();
        Self { client, origin }
    }

    /// Sends `parts` (with `body`) to the origin and returns the streaming
    /// response.
    pub async fn send(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(self.rewrite_uri(&parts.uri)?)
            .body(Full::new(body))?;

        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);
        self.substitute_host(&mut headers);
        *request.headers_mut() = headers;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        Ok(response)
    }

    /// Forwards an upgrade request (WebSockets and friends) with its
    /// hop-by-hop headers intact. When the origin answers `101 Switching
    /// Protocols`, both sides are upgraded and spliced together on a
    /// detached task.
    pub async fn tunnel(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, UpstreamError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();

        // The handshake itself carries no body.
        let mut upstream_req = Request::builder()
            .method(parts.method.clone())
            .uri(self.rewrite_uri(&parts.uri)?)
            .body(Full::new(Bytes::new()))?;
        let mut headers = parts.headers.clone();
        self.substitute_host(&mut headers);
        *upstream_req.headers_mut() = headers;

        let mut response = self.client.request(upstream_req).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Ok(response.map(BodyExt::boxed));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, upstream_upgrade) {
                Ok((client_io, upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    if let Err(err) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        warn!(error = %err, "upgraded connection closed with an error");
                    }
                }
                Err(err) => warn!(error = %err, "upgrade handshake failed"),
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }

    fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, http::Error> {
        let mut builder = Uri::builder();
        if let Some(scheme) = self.origin.scheme() {
            builder = builder.scheme(scheme.clone());
        }
        if let Some(authority) = self.origin.authority() {
            builder = builder.authority(authority.clone());
        }
        let path_and_query = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        builder.path_and_query(path_and_query).build()
    }

    fn substitute_host(&self, headers: &mut http::HeaderMap) {
        headers.remove(header::HOST);
        if let Some(authority) = self.origin.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UpstreamClient {
        UpstreamClient::new(Uri::from_static("http://backend:8080"))
    }

    #[test]
    fn rewrites_onto_the_origin() {
        let uri = client().rewrite_uri(&Uri::from_static("/api/users?page=2")).unwrap();
        assert_eq!(uri, Uri::from_static("http://backend:8080/api/users?page=2"));
    }

    #[test]
    fn empty_path_becomes_root() {
        let uri = client().rewrite_uri(&Uri::from_static("http://example.com")).unwrap();
        assert_eq!(uri.path(), "/");
        assert_eq!(uri.authority().unwrap().as_str(), "backend:8080");
    }

    #[test]
    fn host_header_is_substituted() {
        let mut headers = http::HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("public.example.com"));
        client().substitute_host(&mut headers);
        assert_eq!(headers.get(header::HOST).unwrap(), "backend:8080");
    }
}
