//! Public HTTP surface of the mcpgw gateway.
//!
//! Composes the allocator, supervisor, adapters, proxy and router behind
//! one listener, serves the built-in admin endpoints, and relays
//! WebSocket connections to backends.

pub mod bootstrap;
pub mod handlers;
pub mod relay;
pub mod routes;
pub mod state;

pub use bootstrap::{GatewayContext, bootstrap, run, serve};
pub use relay::{ConnectionInfo, RelayStats, WsRelay};
pub use routes::build_router;
pub use state::AppState;
