//! Request forwarding to backends.
//!
//! HTTP descriptors are forwarded to their declared URL; stdio descriptors
//! resolve their adapter's loopback port through the allocator and their
//! liveness through the supervisor. Upstream failures map to gateway
//! status codes before anything is written to the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use mcpgw_core::{BackendDescriptor, Protocol};
use mcpgw_runtime::{PortAllocator, ProcessState, Supervisor};

use crate::stats::ProxyStats;

/// Headers never forwarded in either direction (hop-by-hop plus the ones
/// the proxy rewrites itself).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn should_forward_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// Target resolution failures, mapped to status codes before forwarding.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No port allocated for '{0}'")]
    NoPortAllocated(String),

    #[error("Backend '{0}' is not running")]
    NotRunning(String),

    #[error("Backend '{0}' has no target URL")]
    NoTargetUrl(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoPortAllocated(_) | ProxyError::NotRunning(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::NoTargetUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Stateless forwarder shared by the router.
pub struct ReverseProxy {
    client: Client,
    allocator: Arc<PortAllocator>,
    supervisor: Supervisor,
    stats: ProxyStats,
}

impl ReverseProxy {
    /// `timeout` bounds each upstream round-trip; expiry maps to 504.
    pub fn new(
        allocator: Arc<PortAllocator>,
        supervisor: Supervisor,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_default();
        Self {
            client,
            allocator,
            supervisor,
            stats: ProxyStats::new(),
        }
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Forward one request to `descriptor`'s backend and stream the answer
    /// back. Never returns an error: failures become gateway responses.
    pub async fn forward(&self, descriptor: &BackendDescriptor, req: Request) -> Response {
        self.stats.record_request(&descriptor.name);
        let started = Instant::now();

        let base = match self.resolve_base(descriptor) {
            Ok(base) => base,
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "Cannot resolve backend");
                self.stats.record_failure();
                return error_response(e.status(), &e.to_string());
            }
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let target = format!("{base}{path_and_query}");
        debug!(server = %descriptor.name, target = %target, "Forwarding request");

        let (parts, body) = req.into_parts();
        let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                self.stats.record_failure();
                return error_response(StatusCode::BAD_REQUEST, "Invalid method");
            }
        };

        let mut builder = self.client.request(method, &target);
        for (name, value) in &parts.headers {
            if should_forward_header(name.as_str())
                && let Ok(value_str) = value.to_str()
            {
                builder = builder.header(name.as_str(), value_str);
            }
        }

        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.record_failure();
                warn!(server = %descriptor.name, error = %e, "Failed to read request body");
                return error_response(StatusCode::BAD_REQUEST, "Unreadable request body");
            }
        };

        let upstream = match builder.body(body_bytes).send().await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return map_upstream_error(&e);
            }
        };

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response = Response::builder().status(status);
        for (name, value) in upstream.headers() {
            if should_forward_header(name.as_str())
                && let Ok(value_str) = value.to_str()
            {
                response = response.header(name.as_str(), value_str);
            }
        }

        self.stats.record_success(started.elapsed());
        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        response
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// The scheme://host:port prefix requests to this backend go to.
    fn resolve_base(&self, descriptor: &BackendDescriptor) -> Result<String, ProxyError> {
        match descriptor.protocol {
            Protocol::Http => descriptor
                .url
                .clone()
                .map(|url| url.trim_end_matches('/').to_string())
                .ok_or_else(|| ProxyError::NoTargetUrl(descriptor.name.clone())),
            Protocol::Stdio => {
                let port = self
                    .allocator
                    .port_for_name(&descriptor.name)
                    .ok_or_else(|| ProxyError::NoPortAllocated(descriptor.name.clone()))?;
                if descriptor.command.is_some()
                    && self.supervisor.process_state(&descriptor.name)
                        != Some(ProcessState::Running)
                {
                    return Err(ProxyError::NotRunning(descriptor.name.clone()));
                }
                Ok(format!("http://127.0.0.1:{port}"))
            }
        }
    }
}

fn map_upstream_error(error: &reqwest::Error) -> Response {
    if error.is_timeout() {
        error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
    } else if error.is_connect() {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
    } else {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
