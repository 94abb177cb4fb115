//! Stdio to HTTP adapter for the mcpgw gateway.
//!
//! Every stdio backend gets a loopback HTTP listener that speaks plain
//! HTTP on one side and newline-delimited JSON over the child's
//! stdin/stdout on the other. Requests are validated, sanitized, and
//! strictly serialised per child.

pub mod adapter;
pub mod validate;
pub mod wire;

pub use adapter::{AdapterError, AdapterInfo, AdapterManager};
pub use validate::RequestError;
pub use wire::{StdioReply, StdioRequest};
