//! Dependency identities and fetch errors.
//!
//! A [`Dependency`] names one unit of upstream data a template can consume:
//! a service registry query, a KV key, or a secret path. The variants are
//! opaque to the runner, which only relies on the stable [`DepKey`] identity,
//! the human display form, and the sharing capability.

use std::fmt;

use serde_json::Value;

/// Stable hash identity of a dependency. Two queries for the same upstream
/// datum always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepKey(pub String);

impl fmt::Display for DepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for DepKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// The last observed value of a dependency, as delivered by the watch layer.
pub type DepValue = Value;

/// A unit of external data a template needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Healthy instances of a named service, optionally filtered by tag.
    Service { name: String, tag: Option<String> },
    /// A single key in the registry's KV store.
    KvKey { key: String },
    /// A secret read from the secret store.
    Secret { path: String },
}

impl Dependency {
    /// Stable hash key for this dependency.
    pub fn key(&self) -> DepKey {
        match self {
            Dependency::Service { name, tag: None } => DepKey(format!("service({name})")),
            Dependency::Service {
                name,
                tag: Some(tag),
            } => DepKey(format!("service({name}.{tag})")),
            Dependency::KvKey { key } => DepKey(format!("kv({key})")),
            Dependency::Secret { path } => DepKey(format!("secret({path})")),
        }
    }

    /// Whether this dependency's value may be distributed to peer agents
    /// through the dedup channel. Secret material never leaves the process.
    pub fn can_share(&self) -> bool {
        !matches!(self, Dependency::Secret { .. })
    }

    /// The neutral value a template sees before data has arrived.
    pub fn zero_value(&self) -> DepValue {
        match self {
            Dependency::Service { .. } => Value::Array(vec![]),
            Dependency::KvKey { .. } => Value::String(String::new()),
            Dependency::Secret { .. } => Value::Object(serde_json::Map::new()),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Fetch errors
// ---------------------------------------------------------------------------

/// Classification of an asynchronous fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// The upstream service could not be reached.
    Unreachable,
    /// The caller is not permitted to read this datum.
    PermissionDenied,
    /// The upstream rejected the query itself.
    BadQuery,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Unreachable => write!(f, "upstream unreachable"),
            FetchErrorKind::PermissionDenied => write!(f, "permission denied"),
            FetchErrorKind::BadQuery => write!(f, "bad query"),
        }
    }
}

/// An asynchronous error reported by the watch layer.
///
/// `fatal` errors ask the runner for a hard exit; the runner surfaces
/// `message` (the original error text) and terminates. Non-fatal errors are
/// logged and retried by the view that produced them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} fetching {dependency}: {message}")]
pub struct FetchError {
    pub dependency: DepKey,
    pub kind: FetchErrorKind,
    pub message: String,
    fatal: bool,
}

impl FetchError {
    pub fn new(dependency: DepKey, kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            dependency,
            kind,
            message: message.into(),
            fatal: false,
        }
    }

    /// Mark this error as exit-worthy.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Whether the runner should hard-exit on this error.
    pub fn should_exit(&self) -> bool {
        self.fatal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
