//! Shared application state type.

use std::sync::Arc;

use crate::bootstrap::GatewayContext;

/// State handed to every handler: an Arc-wrapped [`GatewayContext`].
pub type AppState = Arc<GatewayContext>;
