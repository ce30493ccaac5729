//! # scribe-core
//!
//! Domain types shared across the scribe workspace:
//! - [`config`] — YAML configuration model with defaults and validation
//! - [`dependency`] — dependency identities, values, and fetch errors
//! - [`brain`] — the in-memory cache of dependency values
//! - [`signal`] — Unix signal names for reload/kill configuration
//! - [`error`] — [`ConfigError`]

pub mod brain;
pub mod config;
pub mod dependency;
pub mod error;
pub mod signal;

pub use brain::Brain;
pub use config::{
    AuthConfig, Config, DedupConfig, ExecConfig, RegistryConfig, SecretsConfig, TemplateConfig,
    TlsConfig, WaitConfig,
};
pub use dependency::{DepKey, DepValue, Dependency, FetchError, FetchErrorKind};
pub use error::ConfigError;
pub use signal::Signal;
