//! Route table for the public listener.
//!
//! Built-in admin endpoints are dispatched first; everything else falls
//! through to the name-prefix router. WebSocket upgrades and the metrics
//! endpoint are only wired up when their features are enabled.

use axum::Router;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::{Method, StatusCode, Uri};
use axum::middleware::{Next, from_fn};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use tower_http::cors::{Any, CorsLayer};

use crate::handlers;
use crate::state::AppState;

/// Build the public router for one gateway context.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/servers", get(handlers::servers))
        .route("/ports", get(handlers::ports))
        .route("/stats", get(handlers::stats));

    if state.settings.enable_metrics {
        router = router.route("/metrics", get(handlers::metrics));
    }
    if state.settings.enable_websocket {
        router = router
            .route("/ws", any(relay_upgrade))
            .route("/ws/{*rest}", any(relay_upgrade));
    }

    let enable_cors = state.settings.enable_cors;
    let app = router.fallback(handlers::fallback).with_state(state);

    if enable_cors {
        // Every OPTIONS request answers 200 before any dispatch; the CORS
        // layer wraps it so the answer carries the CORS headers and real
        // preflights are still handled by tower-http.
        app.layer(from_fn(short_circuit_options)).layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    }
}

/// Answer any OPTIONS request with 200, regardless of path.
async fn short_circuit_options(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(req).await
}

/// `GET /ws/<name>` upgrade endpoint, relayed to the backend.
async fn relay_upgrade(
    State(state): State<AppState>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_string();
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| async move {
        relay.handle_socket(socket, &path).await;
    })
    .into_response()
}
