//! Domain layer for the mcpgw gateway.
//!
//! This crate holds the types every other crate agrees on: backend
//! descriptors and their validation rules, the error taxonomy of the
//! supervision and traffic plane, gateway lifecycle events, and the
//! settings consumed at composition time. It has no I/O of its own.

pub mod descriptor;
pub mod error;
pub mod events;
pub mod settings;

pub use descriptor::{
    BackendDescriptor, Capabilities, DetectedType, HealthCheckConfig, Protocol, ValidationError,
    validate_args, validate_command,
};
pub use error::{AllocatorError, SupervisorError};
pub use events::{EventBus, GatewayEvent, StopReason, now_ms};
pub use settings::{
    AdapterSettings, GatewaySettings, RelaySettings, SettingsError, SupervisorSettings,
};
