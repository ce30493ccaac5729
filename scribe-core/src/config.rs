//! Agent configuration: YAML loading, defaults, validation.
//!
//! A config file names the templates to render, the coordination-service
//! endpoints the watch layer and child environment use, optional dampening
//! windows, an optional supervised command, and per-template post-render
//! commands.
//!
//! ```yaml
//! pid_file: /var/run/scribe.pid
//! registry:
//!   address: http://127.0.0.1:8500
//! wait:
//!   min_ms: 2000
//!   max_ms: 10000
//! templates:
//!   - contents: "port = {{ kv(key='app/port') }}"
//!     destination: /etc/app/app.conf
//!     perms: 0o644
//!     command: systemctl reload app
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::signal::Signal;

pub const DEFAULT_RETRY_MS: u64 = 5_000;
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Coordination services
// ---------------------------------------------------------------------------

/// HTTP basic auth for the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// TLS material shared by both coordination services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            verify: true,
            cert: None,
            key: None,
            ca_cert: None,
            server_name: None,
        }
    }
}

/// Connection settings for the service registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Connection settings for the secret store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
}

// ---------------------------------------------------------------------------
// Dampening, dedup, exec
// ---------------------------------------------------------------------------

/// Quiescence window: delay re-renders until updates have settled for `min`,
/// but never longer than `max` after the first update of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl WaitConfig {
    pub fn min(&self) -> Duration {
        Duration::from_millis(self.min_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Cross-instance render deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DedupConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// The supervised child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_reload_signal")]
    pub reload_signal: Signal,
    #[serde(default = "default_kill_signal")]
    pub kill_signal: Signal,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default)]
    pub splay_ms: u64,
}

fn default_reload_signal() -> Signal {
    Signal::Hup
}

fn default_kill_signal() -> Signal {
    Signal::Term
}

fn default_kill_timeout_ms() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}

impl ExecConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn splay(&self) -> Duration {
        Duration::from_millis(self.splay_ms)
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// One template-to-destination binding. Several configurations may share one
/// template body (same contents rendered to several destinations, each with
/// its own post-render command).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template file on disk. Exactly one of `source` / `contents` must be set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Inline template body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,

    pub destination: PathBuf,
    /// File mode bits for the destination (e.g. `0o644`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perms: Option<u32>,
    #[serde(default)]
    pub backup: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_delim: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_delim: Option<String>,

    /// Post-render command, run after the destination's bytes change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_kill_signal")]
    pub kill_signal: Signal,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default)]
    pub splay_ms: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Template-scoped quiescence; overrides the global `wait`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitConfig>,
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

impl TemplateConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn splay(&self) -> Duration {
        Duration::from_millis(self.splay_ms)
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Global quiescence window, applied to templates without their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitConfig>,

    #[serde(default)]
    pub dedup: DedupConfig,

    /// Supervised child process, spawned once all templates have rendered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,

    #[serde(default)]
    pub templates: Vec<TemplateConfig>,

    /// Extra environment for templates, commands, and the child.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Watch-layer retry interval after a fetch error.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
}

fn default_retry_ms() -> u64 {
    DEFAULT_RETRY_MS
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that serde cannot express. An empty
    /// template list is legal: the agent idles until stopped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, tmpl) in self.templates.iter().enumerate() {
            match (&tmpl.source, &tmpl.contents) {
                (None, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "template #{i}: one of 'source' or 'contents' is required"
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Invalid(format!(
                        "template #{i}: 'source' and 'contents' are mutually exclusive"
                    )));
                }
                _ => {}
            }
            if tmpl.destination.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "template #{i}: 'destination' must not be empty"
                )));
            }
            if let Some(wait) = &tmpl.wait {
                validate_wait(wait, &format!("template #{i}"))?;
            }
        }

        if let Some(wait) = &self.wait {
            validate_wait(wait, "global")?;
        }

        if let Some(exec) = &self.exec {
            if exec.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "exec.command must not be empty when 'exec' is set".into(),
                ));
            }
        }

        Ok(())
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }
}

fn validate_wait(wait: &WaitConfig, scope: &str) -> Result<(), ConfigError> {
    if wait.min_ms == 0 {
        return Err(ConfigError::Invalid(format!(
            "{scope} wait: min_ms must be greater than zero"
        )));
    }
    if wait.min_ms > wait.max_ms {
        return Err(ConfigError::Invalid(format!(
            "{scope} wait: min_ms ({}) must not exceed max_ms ({})",
            wait.min_ms, wait.max_ms
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
