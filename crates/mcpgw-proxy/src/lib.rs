//! Traffic plane for the mcpgw gateway: the name-prefix router and the
//! reverse proxy it delegates to, plus per-proxy counters.

pub mod forward;
pub mod router;
pub mod stats;

pub use forward::{ProxyError, ReverseProxy};
pub use router::{RequestRouter, RouterConfig};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
