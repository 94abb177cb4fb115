//! Per-backend loopback HTTP front.
//!
//! One [`AdapterInstance`] exists per stdio descriptor: an axum listener
//! bound to the backend's allocated port on 127.0.0.1 whose handler
//! validates, frames, and round-trips requests through the child's stdio.
//! The child itself is owned by the supervisor; the adapter only borrows
//! the per-child stdio lock, so a restart never leaves a dangling handle
//! here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mcpgw_core::{
    AdapterSettings, BackendDescriptor, EventBus, GatewayEvent, Protocol, SupervisorError, now_ms,
};
use mcpgw_runtime::{ChildIoError, Supervisor};

use crate::validate::{RequestError, sanitize_body, sanitize_headers, validate_method, validate_url};
use crate::wire::{StdioReply, StdioRequest};

/// Errors raised while creating or stopping adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Backend '{0}' declares protocol=http and needs no adapter")]
    NotStdio(String),

    #[error("Adapter for '{name}' already exists on port {port}")]
    AlreadyExists { name: String, port: u16 },

    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Serializable view of one adapter, for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub name: String,
    pub port: u16,
    pub is_healthy: bool,
    pub started_at: u64,
    pub last_activity: u64,
}

/// Shared state behind one adapter's request handler.
struct AdapterInstance {
    descriptor: BackendDescriptor,
    port: u16,
    settings: AdapterSettings,
    supervisor: Supervisor,
    healthy: AtomicBool,
    started_at: u64,
    last_activity: AtomicU64,
}

impl AdapterInstance {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.descriptor.name.clone(),
            port: self.port,
            is_healthy: self.healthy.load(Ordering::Relaxed),
            started_at: self.started_at,
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }
}

struct AdapterEntry {
    instance: Arc<AdapterInstance>,
    cancel: CancellationToken,
}

/// Owner of every [`AdapterInstance`] and its loopback listener.
pub struct AdapterManager {
    supervisor: Supervisor,
    settings: AdapterSettings,
    adapters: Mutex<HashMap<String, AdapterEntry>>,
    events: EventBus,
}

impl AdapterManager {
    pub fn new(supervisor: Supervisor, settings: AdapterSettings, events: EventBus) -> Self {
        Self {
            supervisor,
            settings,
            adapters: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Bind the loopback listener for one stdio backend and, when the
    /// descriptor carries a command, start its child. The listener is torn
    /// down again if the child fails to start.
    pub async fn create_adapter(
        &self,
        descriptor: &BackendDescriptor,
        port: u16,
    ) -> Result<(), AdapterError> {
        if descriptor.protocol != Protocol::Stdio {
            return Err(AdapterError::NotStdio(descriptor.name.clone()));
        }
        {
            let adapters = self.adapters.lock().unwrap();
            if adapters.contains_key(&descriptor.name) {
                return Err(AdapterError::AlreadyExists {
                    name: descriptor.name.clone(),
                    port,
                });
            }
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| AdapterError::Bind { port, source })?;

        let instance = Arc::new(AdapterInstance {
            descriptor: descriptor.clone(),
            port,
            settings: self.settings.clone(),
            supervisor: self.supervisor.clone(),
            healthy: AtomicBool::new(false),
            started_at: now_ms(),
            last_activity: AtomicU64::new(now_ms()),
        });

        let app = Router::new()
            .fallback(handle_request)
            .with_state(Arc::clone(&instance));
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let name = descriptor.name.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(serve_cancel.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(server = %name, error = %e, "Adapter listener failed");
            }
        });

        if descriptor.command.is_some() {
            if let Err(e) = self.supervisor.start_server(descriptor, Some(port)).await {
                cancel.cancel();
                return Err(e.into());
            }
        }
        // A spawned child, or a command-less adapter waiting on an
        // external process, both count as healthy.
        instance.healthy.store(true, Ordering::Relaxed);

        info!(server = %descriptor.name, port = %port, "Adapter listening");
        self.adapters.lock().unwrap().insert(
            descriptor.name.clone(),
            AdapterEntry {
                instance,
                cancel,
            },
        );
        self.events.emit(GatewayEvent::AdapterStarted {
            name: descriptor.name.clone(),
            port,
            timestamp: now_ms(),
        });
        Ok(())
    }

    /// Stop the child (term, then kill) and close the loopback listener.
    /// Unknown names are a no-op.
    pub async fn stop_adapter(&self, name: &str) {
        let Some(entry) = self.adapters.lock().unwrap().remove(name) else {
            return;
        };
        if entry.instance.descriptor.command.is_some() {
            if let Err(e) = self.supervisor.stop_server(name).await {
                warn!(server = %name, error = %e, "Failed to stop adapter child");
            }
        }
        entry.cancel.cancel();
        self.events.emit(GatewayEvent::AdapterStopped {
            name: name.to_string(),
            timestamp: now_ms(),
        });
    }

    /// Stop every adapter, one at a time.
    pub async fn stop_all_adapters(&self) {
        let names: Vec<String> = self.adapters.lock().unwrap().keys().cloned().collect();
        for name in names {
            self.stop_adapter(&name).await;
        }
    }

    pub fn adapter_info(&self, name: &str) -> Option<AdapterInfo> {
        self.adapters
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.instance.info())
    }

    pub fn all_adapters(&self) -> Vec<AdapterInfo> {
        let adapters = self.adapters.lock().unwrap();
        let mut all: Vec<_> = adapters.values().map(|e| e.instance.info()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

/// The adapter's whole HTTP surface: preflight, health, then translation.
async fn handle_request(State(instance): State<Arc<AdapterInstance>>, req: Request) -> Response {
    instance.last_activity.store(now_ms(), Ordering::Relaxed);

    if req.method() == Method::OPTIONS {
        return preflight_response(&instance.settings);
    }

    let path = req.uri().path().to_string();
    if req.method() == Method::GET && path == instance.settings.health_check_path {
        return health_response(&instance);
    }

    let Some(io) = instance.supervisor.child_io(&instance.descriptor.name) else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available");
    };

    // Validate before anything is written to the child.
    let method = match validate_method(req.method()) {
        Ok(m) => m,
        Err(e) => return request_error_response(&e),
    };
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    if let Err(e) = validate_url(&url) {
        return request_error_response(&e);
    }
    let headers = sanitize_headers(req.headers());

    let limit = instance.settings.max_buffer_size;
    let body_bytes = match axum::body::to_bytes(req.into_body(), limit).await {
        Ok(bytes) => bytes,
        Err(_) => return request_error_response(&RequestError::BodyTooLarge { limit }),
    };
    let body = match sanitize_body(&body_bytes, limit) {
        Ok(cleaned) => String::from_utf8_lossy(&cleaned).into_owned(),
        Err(e) => return request_error_response(&e),
    };

    let request = StdioRequest {
        method,
        url,
        headers,
        body,
    };
    let line = match request.to_line() {
        Ok(line) => line,
        Err(e) => {
            warn!(server = %instance.descriptor.name, error = %e, "Failed to encode request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    // The stdio lock serialises requests: one in flight per child.
    let reply = {
        let mut io = io.lock().await;
        io.round_trip(&line, instance.settings.timeout()).await
    };

    let raw = match reply {
        Ok(raw) => raw,
        Err(ChildIoError::Timeout) => {
            warn!(server = %instance.descriptor.name, "Stdio request timed out");
            return error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
        }
        Err(e) => {
            warn!(server = %instance.descriptor.name, error = %e, "Stdio request failed");
            return error_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    match StdioReply::from_line(&raw) {
        Ok(reply) => {
            debug!(server = %instance.descriptor.name, status = %reply.status_code, "Stdio reply");
            let status =
                StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(reply.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            warn!(server = %instance.descriptor.name, error = %e, "Unparseable stdio reply");
            error_response(StatusCode::BAD_GATEWAY, "Invalid backend reply")
        }
    }
}

fn preflight_response(settings: &AdapterSettings) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("access-control-allow-origin", settings.cors_origin.clone())
        .header("access-control-allow-methods", settings.cors_methods.clone())
        .header("access-control-allow-headers", settings.cors_headers.clone())
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::OK.into_response())
}

fn health_response(instance: &AdapterInstance) -> Response {
    let healthy = instance.healthy.load(Ordering::Relaxed);
    let has_child = instance.supervisor.has_child(&instance.descriptor.name);
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "server": instance.descriptor.name,
        "type": instance.descriptor.detected_type,
        "uptimeMs": now_ms().saturating_sub(instance.started_at),
        "lastActivity": instance.last_activity.load(Ordering::Relaxed),
        "hasChildProcess": has_child,
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body)).into_response()
}

fn request_error_response(error: &RequestError) -> Response {
    let status = match error {
        RequestError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(json!({ "error": message }))).into_response()
}
