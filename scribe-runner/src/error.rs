//! Error types for scribe-runner.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use scribe_core::dependency::FetchError;
use scribe_core::error::ConfigError;
use scribe_core::signal::Signal;
use scribe_template::{SinkError, TemplateError};

/// All errors the runner can surface on its error channel or return from a
/// render pass.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An exit-worthy fetch error, surfaced from the watch layer.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// The supervised child terminated.
    #[error("child process died with exit code {0}")]
    ChildDied(i32),

    #[error("command '{command}' failed to start: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' exited with code {code}")]
    CommandExit { command: String, code: i32 },

    #[error("command '{command}' did not finish within {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    #[error("failed to deliver {signal} to pid {pid}: {source}")]
    Signal {
        pid: i32,
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    /// Several per-command or reload failures from one render pass, in
    /// collection order.
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl RunnerError {
    /// Fold collected errors: none stays `None`, a single error is returned
    /// as-is, several become [`RunnerError::Aggregate`].
    pub fn aggregate(mut errs: Vec<RunnerError>) -> Option<RunnerError> {
        match errs.len() {
            0 => None,
            1 => Some(errs.remove(0)),
            _ => Some(RunnerError::Aggregate(AggregateError(errs))),
        }
    }
}

/// An ordered collection of pass-level errors.
#[derive(Debug)]
pub struct AggregateError(pub Vec<RunnerError>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Convenience constructor for [`RunnerError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RunnerError {
    RunnerError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_folds_by_count() {
        assert!(RunnerError::aggregate(vec![]).is_none());

        let single = RunnerError::aggregate(vec![RunnerError::ChildDied(1)]).unwrap();
        assert!(matches!(single, RunnerError::ChildDied(1)));

        let several = RunnerError::aggregate(vec![
            RunnerError::CommandExit {
                command: "echo x".into(),
                code: 1,
            },
            RunnerError::ChildDied(2),
        ])
        .unwrap();
        let text = several.to_string();
        assert!(text.starts_with("2 errors occurred"));
        assert!(text.contains("echo x"));
        assert!(text.contains("exit code 2"));
    }
}
