//! Forwarding handlers bound to a single worker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HOST, HeaderName, HeaderValue};
use hyper::{Request, Response};
use tracing::debug;

use super::worker::WorkerSpec;
use crate::error::{Error, Result};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");

/// Builds forwarding handlers.
///
/// The factory holds only settings; every handler it builds gets its own
/// HTTP client, so a replacement never reuses pooled connections to the
/// worker it replaces.
#[derive(Debug, Clone, Copy)]
pub struct ProxyFactory {
    timeout: Duration,
}

impl ProxyFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Build a handler forwarding to the spec's published port.
    pub fn build(&self, spec: &WorkerSpec) -> Result<Arc<ForwardingHandler>> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .no_proxy()
            .build()
            .map_err(|e| Error::ProxyBuild {
                worker: spec.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(Arc::new(ForwardingHandler {
            worker: spec.name.clone(),
            origin: spec.origin(),
            client,
            timeout: self.timeout,
        }))
    }
}

/// Forwards requests to one worker.
#[derive(Debug)]
pub struct ForwardingHandler {
    worker: String,
    origin: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ForwardingHandler {
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// `host:port` the handler connects to.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Forward a request to the worker and return its response.
    ///
    /// HTTP error statuses from the worker are returned as responses; only
    /// transport failures (refused, reset, timed out) produce `Error::Forward`.
    pub async fn forward(&self, req: Request<Bytes>) -> Result<Response<Full<Bytes>>> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", self.origin, path);

        let mut request_builder = self
            .client
            .request(parts.method.clone(), &url)
            .timeout(self.timeout);

        // Forward headers (skip hop-by-hop headers and Host)
        for (name, value) in parts.headers.iter() {
            if *name == HOST || is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            request_builder = request_builder.header(name.clone(), value.clone());
        }
        if let Some(host) = parts.headers.get(HOST) {
            request_builder = request_builder.header(X_FORWARDED_HOST, host.clone());
        }
        if let Ok(origin) = HeaderValue::from_str(&self.origin) {
            request_builder = request_builder.header(X_ORIGIN_HOST, origin);
        }

        if !body.is_empty() {
            request_builder = request_builder.body(body);
        }

        let response = request_builder.send().await.map_err(|e| self.unreachable(e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.unreachable(e))?;

        debug!(worker = %self.worker, %status, path = %path, "Forwarded request");

        let mut proxied = Response::new(Full::new(body));
        *proxied.status_mut() = status;
        for (name, value) in headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                proxied.headers_mut().append(name.clone(), value.clone());
            }
        }

        Ok(proxied)
    }

    fn unreachable(&self, source: reqwest::Error) -> Error {
        Error::Forward {
            worker: self.worker.clone(),
            source,
        }
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
