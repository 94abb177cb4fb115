//! Backend descriptors and the validation rules applied to them.
//!
//! A [`BackendDescriptor`] is the immutable configuration record for one
//! backend. Descriptors are produced by the configuration loader, validated
//! once, and handed to the gateway at init; the core never mutates them.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Executable basenames a stdio backend is allowed to launch.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "node", "python", "python3", "npx", "yarn", "pnpm", "deno", "bun",
];

/// Shell metacharacters rejected in commands and arguments.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$'];

/// Transport a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Line-delimited JSON over a child process's stdin/stdout.
    Stdio,
    /// The backend already exposes HTTP at a declared URL.
    Http,
}

/// Classification hint used to adjust validation and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedType {
    Docker,
    Npx,
    Http,
    Custom,
}

impl DetectedType {
    /// Infer the type from a descriptor's shape.
    pub fn infer(protocol: Protocol, command: Option<&str>) -> Self {
        match (protocol, command) {
            (Protocol::Http, _) => Self::Http,
            (Protocol::Stdio, Some(cmd)) => match basename(cmd) {
                "npx" => Self::Npx,
                "docker" => Self::Docker,
                _ => Self::Custom,
            },
            (Protocol::Stdio, None) => Self::Custom,
        }
    }
}

/// Derived capability flags for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// The backend needs a stdio adapter and a loopback port.
    pub requires_stdio: bool,
    /// The backend can answer a health probe.
    pub supports_health_check: bool,
    /// The backend needs environment variables injected at spawn.
    pub requires_environment: bool,
    /// The supervisor may auto-restart the backend after a crash.
    pub can_restart: bool,
}

/// Health probe configuration for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Seconds between probes.
    pub interval_secs: u64,
    /// Seconds before a single probe is abandoned.
    pub timeout_secs: u64,
    /// Consecutive failures before the backend is reported unhealthy.
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            retries: 3,
        }
    }
}

/// Validated configuration record for one backend.
///
/// Built through [`BackendDescriptor::new`], which enforces the command
/// allowlist and argument rules, so a descriptor in hand is always safe to
/// spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    /// Unique identifier; doubles as the URL path prefix.
    pub name: String,
    pub protocol: Protocol,
    pub detected_type: DetectedType,
    /// Executable to spawn; required to launch a stdio child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Target base URL; required when `protocol = http`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub capabilities: Capabilities,
    /// Whether the supervisor should auto-restart this backend on crash.
    #[serde(default)]
    pub restart: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

/// Errors raised while validating a descriptor, a command, or its arguments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Backend name must not be empty")]
    EmptyName,

    #[error("Backend name '{0}' contains path separators")]
    InvalidName(String),

    #[error("Command '{0}' is not on the allowlist")]
    DisallowedCommand(String),

    #[error("Command '{0}' contains dangerous characters")]
    DangerousCommand(String),

    #[error("Argument '{0}' contains shell metacharacters")]
    DangerousArgs(String),

    #[error("Backend '{0}' declares protocol=http but no url")]
    MissingUrl(String),
}

/// Check a command string against the allowlist and metacharacter rules.
///
/// The allowlist is matched against the basename so both `node` and
/// `/usr/local/bin/node` pass.
pub fn validate_command(command: &str) -> Result<(), ValidationError> {
    if command.contains("..") || command.contains(SHELL_METACHARACTERS) {
        return Err(ValidationError::DangerousCommand(command.to_string()));
    }
    let base = basename(command);
    if !ALLOWED_COMMANDS.contains(&base) {
        return Err(ValidationError::DisallowedCommand(command.to_string()));
    }
    Ok(())
}

/// Check every argument for shell metacharacters.
pub fn validate_args(args: &[String]) -> Result<(), ValidationError> {
    for arg in args {
        if arg.contains(SHELL_METACHARACTERS) {
            return Err(ValidationError::DangerousArgs(arg.clone()));
        }
    }
    Ok(())
}

fn basename(command: &str) -> &str {
    Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command)
}

impl BackendDescriptor {
    /// Build and validate a descriptor.
    ///
    /// Capability flags and the detected type are derived here; callers
    /// never set them directly.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        command: Option<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        url: Option<String>,
        restart: bool,
        health_check: Option<HealthCheckConfig>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if name.contains('/') || name.contains('\\') {
            return Err(ValidationError::InvalidName(name));
        }
        if protocol == Protocol::Http && url.is_none() {
            return Err(ValidationError::MissingUrl(name));
        }
        if let Some(cmd) = command.as_deref() {
            validate_command(cmd)?;
            validate_args(&args)?;
        }

        let detected_type = DetectedType::infer(protocol, command.as_deref());
        let capabilities = Capabilities {
            requires_stdio: protocol == Protocol::Stdio,
            supports_health_check: health_check.is_some() || protocol == Protocol::Http,
            requires_environment: !env.is_empty(),
            can_restart: restart && protocol == Protocol::Stdio && command.is_some(),
        };

        Ok(Self {
            name,
            protocol,
            detected_type,
            command,
            args,
            env,
            url,
            capabilities,
            restart,
            health_check,
        })
    }

    /// Shorthand for an HTTP backend.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(
            name,
            Protocol::Http,
            None,
            Vec::new(),
            HashMap::new(),
            Some(url.into()),
            false,
            None,
        )
    }

    /// Shorthand for a stdio backend with a command.
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Self, ValidationError> {
        Self::new(
            name,
            Protocol::Stdio,
            Some(command.into()),
            args,
            HashMap::new(),
            None,
            false,
            None,
        )
    }

    /// Enable auto-restart, rederiving the capability flags.
    #[must_use]
    pub fn with_restart(mut self) -> Self {
        self.restart = true;
        self.capabilities.can_restart =
            self.protocol == Protocol::Stdio && self.command.is_some();
        self
    }

    /// Merge environment variables, rederiving the capability flags.
    #[must_use]
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self.capabilities.requires_environment = !self.env.is_empty();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_accepts_node_and_absolute_paths() {
        assert!(validate_command("node").is_ok());
        assert!(validate_command("/usr/local/bin/node").is_ok());
        assert!(validate_command("python3").is_ok());
    }

    #[test]
    fn allowlist_rejects_rm() {
        assert_eq!(
            validate_command("rm"),
            Err(ValidationError::DisallowedCommand("rm".to_string()))
        );
    }

    #[test]
    fn command_with_traversal_is_dangerous() {
        assert!(matches!(
            validate_command("../node"),
            Err(ValidationError::DangerousCommand(_))
        ));
        assert!(matches!(
            validate_command("node;true"),
            Err(ValidationError::DangerousCommand(_))
        ));
    }

    #[test]
    fn args_with_metacharacters_are_rejected() {
        let args = vec!["-e".to_string(), "x && rm -rf /".to_string()];
        assert!(matches!(
            validate_args(&args),
            Err(ValidationError::DangerousArgs(_))
        ));
        assert!(validate_args(&["-e".to_string(), "1+1".to_string()]).is_ok());
    }

    #[test]
    fn http_descriptor_requires_url() {
        let err = BackendDescriptor::new(
            "api",
            Protocol::Http,
            None,
            Vec::new(),
            HashMap::new(),
            None,
            false,
            None,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingUrl("api".to_string()));
    }

    #[test]
    fn capabilities_are_derived() {
        let d = BackendDescriptor::stdio("mem", "node", vec!["-e".into(), "1".into()])
            .unwrap()
            .with_restart();
        assert!(d.capabilities.requires_stdio);
        assert!(d.capabilities.can_restart);
        assert!(!d.capabilities.requires_environment);

        let h = BackendDescriptor::http("echo", "http://127.0.0.1:9101").unwrap();
        assert!(!h.capabilities.requires_stdio);
        assert!(h.capabilities.supports_health_check);
    }

    #[test]
    fn detected_type_inference() {
        assert_eq!(
            DetectedType::infer(Protocol::Stdio, Some("npx")),
            DetectedType::Npx
        );
        assert_eq!(
            DetectedType::infer(Protocol::Http, None),
            DetectedType::Http
        );
        assert_eq!(
            DetectedType::infer(Protocol::Stdio, Some("node")),
            DetectedType::Custom
        );
    }

    #[test]
    fn empty_name_is_rejected() {
        assert_eq!(
            BackendDescriptor::http("", "http://x").unwrap_err(),
            ValidationError::EmptyName
        );
    }
}
