//! Error taxonomy of the supervision plane.
//!
//! Traffic-plane errors (adapter request validation, proxy failure mapping)
//! live next to their subsystems; the kinds here are the ones that cross
//! crate boundaries.

use thiserror::Error;

use crate::descriptor::ValidationError;

/// Errors raised by the port allocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("Invalid port range {start}..={end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("No ports available in range {start}..={end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("No port allocated for '{0}'")]
    NotAllocated(String),

    #[error("Port {port} is allocated to '{owner}', not '{name}'")]
    WrongOwner {
        port: u16,
        name: String,
        owner: String,
    },
}

/// Errors raised by the process supervisor.
///
/// Startup failures propagate to the caller of `start_server`; runtime
/// crashes do not, and are observable only through events and queries.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Backend '{0}' declares protocol=http and cannot be spawned")]
    HttpNotSpawnable(String),

    #[error("Backend '{0}' has no command to spawn")]
    NoCommand(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to spawn '{name}': {message}")]
    SpawnFailed { name: String, message: String },

    #[error("Backend '{0}' did not start within the startup timeout")]
    StartupTimeout(String),

    #[error("Backend '{name}' exited during startup (code={code:?}, signal={signal:?})")]
    ExitedDuringStartup {
        name: String,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("No such server '{0}'")]
    UnknownServer(String),
}
