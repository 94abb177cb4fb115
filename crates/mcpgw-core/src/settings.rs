//! Gateway settings.
//!
//! Deserialized by the external configuration loader and validated once
//! before the gateway is constructed. Durations are carried as integer
//! seconds/milliseconds on the wire and exposed as [`Duration`] accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PORT_RANGE_START: u16 = 3001;
pub const DEFAULT_PORT_RANGE_END: u16 = 3099;

/// Top-level settings consumed by the gateway at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Interface the public listener binds.
    pub host: String,
    /// Port the public listener binds.
    pub port: u16,
    /// First loopback port handed to stdio adapters.
    pub port_range_start: u16,
    /// Last loopback port handed to stdio adapters (inclusive).
    pub port_range_end: u16,
    /// Seconds a port reservation flag survives before it is cleared.
    pub reservation_timeout_secs: u64,
    pub enable_cors: bool,
    pub enable_metrics: bool,
    pub enable_websocket: bool,
    pub supervisor: SupervisorSettings,
    pub adapter: AdapterSettings,
    pub relay: RelaySettings,
}

/// Process supervisor knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// Auto-restarts allowed before a backend stays failed.
    pub max_restarts: u32,
    /// Milliseconds between a crash and the restart attempt.
    pub restart_delay_ms: u64,
    /// Seconds a spawn may take before it is abandoned.
    pub startup_timeout_secs: u64,
    /// Seconds a graceful stop waits before escalating.
    pub shutdown_timeout_secs: u64,
}

/// Stdio adapter knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterSettings {
    /// Seconds one stdio round-trip may take.
    pub timeout_secs: u64,
    /// Largest request body the adapter accepts, in bytes.
    pub max_buffer_size: usize,
    /// Path the adapter intercepts for its own health report.
    pub health_check_path: String,
    pub cors_origin: String,
    pub cors_methods: String,
    pub cors_headers: String,
}

/// WebSocket relay knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Active connections accepted before new upgrades are refused.
    pub max_connections: usize,
    /// Milliseconds between heartbeat sweeps.
    pub ping_interval_ms: u64,
    /// Milliseconds of silence before a connection is considered idle;
    /// also bounds the backend dial.
    pub connection_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            reservation_timeout_secs: 60,
            enable_cors: true,
            enable_metrics: true,
            enable_websocket: true,
            supervisor: SupervisorSettings::default(),
            adapter: AdapterSettings::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay_ms: 5_000,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_buffer_size: 10 * 1024 * 1024,
            health_check_path: "/health".to_string(),
            cors_origin: "*".to_string(),
            cors_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            cors_headers: "Content-Type, Authorization".to_string(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_connections: 1_000,
            ping_interval_ms: 30_000,
            connection_timeout_ms: 60_000,
        }
    }
}

/// Settings rejected at validation time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid port range {start}..={end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("maxBufferSize must be positive")]
    ZeroBufferSize,

    #[error("maxConnections must be positive")]
    ZeroConnections,
}

impl GatewaySettings {
    /// Validate cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.port_range_start == 0
            || self.port_range_end == 0
            || self.port_range_start >= self.port_range_end
        {
            return Err(SettingsError::InvalidPortRange {
                start: self.port_range_start,
                end: self.port_range_end,
            });
        }
        if self.adapter.max_buffer_size == 0 {
            return Err(SettingsError::ZeroBufferSize);
        }
        if self.relay.max_connections == 0 {
            return Err(SettingsError::ZeroConnections);
        }
        Ok(())
    }

    pub fn reservation_timeout(&self) -> Duration {
        Duration::from_secs(self.reservation_timeout_secs)
    }
}

impl SupervisorSettings {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl AdapterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RelaySettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = GatewaySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.port_range_start, 3001);
        assert_eq!(settings.port_range_end, 3099);
        assert_eq!(settings.supervisor.max_restarts, 3);
        assert_eq!(settings.adapter.max_buffer_size, 10 * 1024 * 1024);
        assert_eq!(settings.relay.max_connections, 1_000);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let settings = GatewaySettings {
            port_range_start: 4000,
            port_range_end: 3000,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::InvalidPortRange {
                start: 4000,
                end: 3000
            })
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: GatewaySettings =
            serde_json::from_str(r#"{"port": 9000, "enableCors": false}"#).unwrap();
        assert_eq!(settings.port, 9000);
        assert!(!settings.enable_cors);
        assert_eq!(settings.host, DEFAULT_HOST);
        assert_eq!(settings.adapter.timeout_secs, 30);
    }
}
