//! JSON configuration loading.
//!
//! The config file carries the gateway settings (all optional, camelCase)
//! and the backend list. Every entry is validated through the core
//! descriptor rules before the gateway sees it, so a bad command or a
//! duplicate name aborts startup instead of surfacing at runtime.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use mcpgw_core::{
    BackendDescriptor, GatewaySettings, HealthCheckConfig, Protocol, SettingsError,
    ValidationError,
};

/// Errors that abort startup while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Backend '{name}': {source}")]
    Backend {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error("Duplicate backend name '{0}'")]
    DuplicateName(String),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// One backend entry as written in the config file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ServerSpec {
    name: String,
    protocol: Protocol,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    restart: bool,
    #[serde(default)]
    health_check: Option<HealthCheckConfig>,
}

impl ServerSpec {
    fn into_descriptor(self) -> Result<BackendDescriptor, ConfigError> {
        let name = self.name.clone();
        BackendDescriptor::new(
            self.name,
            self.protocol,
            self.command,
            self.args,
            self.env,
            self.url,
            self.restart,
            self.health_check,
        )
        .map_err(|source| ConfigError::Backend { name, source })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(flatten)]
    settings: GatewaySettings,
    #[serde(default)]
    servers: Vec<ServerSpec>,
}

/// Parse and validate a configuration document.
pub fn parse_config(raw: &str) -> Result<(GatewaySettings, Vec<BackendDescriptor>), ConfigError> {
    let file: ConfigFile = serde_json::from_str(raw)?;
    file.settings.validate()?;

    let mut seen = HashSet::new();
    let mut descriptors = Vec::with_capacity(file.servers.len());
    for spec in file.servers {
        if !seen.insert(spec.name.clone()) {
            return Err(ConfigError::DuplicateName(spec.name));
        }
        descriptors.push(spec.into_descriptor()?);
    }
    Ok((file.settings, descriptors))
}

/// Load a configuration file from disk.
pub fn load_config(
    path: &Path,
) -> Result<(GatewaySettings, Vec<BackendDescriptor>), ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "port": 9090,
        "enableMetrics": false,
        "servers": [
            {
                "name": "mem",
                "protocol": "stdio",
                "command": "node",
                "args": ["server.js"],
                "env": {"DEBUG": "1"},
                "restart": true
            },
            {
                "name": "echo",
                "protocol": "http",
                "url": "http://127.0.0.1:9101"
            }
        ]
    }"#;

    #[test]
    fn sample_parses_with_defaults() {
        let (settings, descriptors) = parse_config(SAMPLE).unwrap();
        assert_eq!(settings.port, 9090);
        assert!(!settings.enable_metrics);
        assert_eq!(settings.host, "127.0.0.1");
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors[0].capabilities.requires_stdio);
        assert!(descriptors[0].restart);
        assert_eq!(descriptors[1].protocol, Protocol::Http);
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let (settings, descriptors) = parse_config("{}").unwrap();
        assert_eq!(settings.port, 8080);
        assert!(descriptors.is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let raw = r#"{"servers": [
            {"name": "x", "protocol": "http", "url": "http://a"},
            {"name": "x", "protocol": "http", "url": "http://b"}
        ]}"#;
        assert!(matches!(
            parse_config(raw),
            Err(ConfigError::DuplicateName(name)) if name == "x"
        ));
    }

    #[test]
    fn disallowed_command_aborts_load() {
        let raw = r#"{"servers": [
            {"name": "evil", "protocol": "stdio", "command": "rm", "args": ["-rf", "/"]}
        ]}"#;
        assert!(matches!(
            parse_config(raw),
            Err(ConfigError::Backend { .. })
        ));
    }

    #[test]
    fn invalid_port_range_aborts_load() {
        let raw = r#"{"portRangeStart": 4000, "portRangeEnd": 3000}"#;
        assert!(matches!(parse_config(raw), Err(ConfigError::Settings(_))));
    }

    #[test]
    fn load_config_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let (settings, descriptors) = load_config(&path).unwrap();
        assert_eq!(settings.port, 9090);
        assert_eq!(descriptors.len(), 2);
    }
}
