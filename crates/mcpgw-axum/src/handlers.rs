//! Built-in admin endpoints and the routing fallback.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sysinfo::System;

use mcpgw_core::now_ms;

use crate::state::AppState;

/// `GET /` - gateway identity and surface description.
pub async fn root(State(state): State<AppState>) -> Response {
    let body = json!({
        "name": "mcpgw",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "MCP gateway: one HTTP front for stdio and HTTP backends",
        "endpoints": {
            "health": "/health",
            "servers": "/servers",
            "ports": "/ports",
            "metrics": "/metrics",
            "stats": "/stats",
            "backends": "/<name>/...",
            "websocket": "/ws/<name>",
        },
        "servers": state.router.names(),
        "features": {
            "cors": state.settings.enable_cors,
            "metrics": state.settings.enable_metrics,
            "websocket": state.settings.enable_websocket,
        },
    });
    axum::Json(body).into_response()
}

/// `GET /health` - 200 while no managed process is failed, else 503.
pub async fn health(State(state): State<AppState>) -> Response {
    let processes = state.supervisor.all_processes();
    let failed = state.supervisor.failed_processes().len();
    let running = state.supervisor.running_processes().len();
    let healthy = failed == 0;

    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": now_ms(),
        "uptime": state.uptime_secs(),
        "servers": {
            "total": processes.len(),
            "running": running,
            "failed": failed,
        },
        "memory": memory_snapshot(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body)).into_response()
}

/// `GET /servers` - descriptor, process state and allocated port per backend.
pub async fn servers(State(state): State<AppState>) -> Response {
    let servers: Vec<_> = state
        .descriptors
        .iter()
        .map(|descriptor| {
            json!({
                "descriptor": descriptor,
                "process": state.supervisor.process_info(&descriptor.name),
                "port": state.allocator.port_for_name(&descriptor.name),
                "adapter": state.adapters.adapter_info(&descriptor.name),
            })
        })
        .collect();
    axum::Json(json!({ "servers": servers })).into_response()
}

/// `GET /ports` - allocator range, allocations and reservations.
pub async fn ports(State(state): State<AppState>) -> Response {
    let body = json!({
        "range": state.allocator.range_info(),
        "allocations": state.allocator.allocations(),
        "reservedPorts": state.allocator.reserved_ports(),
    });
    axum::Json(body).into_response()
}

/// `GET /metrics` - aggregate counters across the plane. Only routed when
/// the metrics feature is enabled.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let processes = state.supervisor.all_processes();
    let restarts: u32 = processes.iter().map(|p| p.restart_count).sum();
    let body = json!({
        "proxy": state.proxy.stats().snapshot(),
        "servers": {
            "total": processes.len(),
            "running": state.supervisor.running_processes().len(),
            "failed": state.supervisor.failed_processes().len(),
            "restarts": restarts,
        },
        "ports": state.allocator.range_info(),
        "websocket": state.relay.stats(),
        "routes": state.router.len(),
    });
    axum::Json(body).into_response()
}

/// `GET /stats` - minimal uptime/memory/connection snapshot.
pub async fn stats(State(state): State<AppState>) -> Response {
    let body = json!({
        "uptime": state.uptime_secs(),
        "memory": memory_snapshot(),
        "connections": state.relay.connection_count(),
        "servers": state.router.len(),
    });
    axum::Json(body).into_response()
}

/// Everything that is not a built-in endpoint goes through the router;
/// unmatched paths answer 404 with the registered names.
pub async fn fallback(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    match state.router.route_request(req).await {
        Some(response) => response,
        None => {
            let body = json!({
                "error": "Not Found",
                "message": format!("No backend matches '{path}'"),
                "availableServers": state.router.names(),
            });
            (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
        }
    }
}

/// Memory numbers for `/health` and `/stats`.
fn memory_snapshot() -> serde_json::Value {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, false);
    let process_bytes = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| system.process(pid))
        .map(|p| p.memory());
    json!({
        "totalBytes": system.total_memory(),
        "usedBytes": system.used_memory(),
        "processBytes": process_bytes,
    })
}
