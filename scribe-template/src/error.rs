//! Error types for scribe-template.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from template parsing and evaluation.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Tera template engine error (parse or render).
    #[error("template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// Filesystem error while reading a template source file.
    #[error("template io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither `source` nor `contents` was provided.
    #[error("template requires either a source path or inline contents")]
    NoBody,

    /// A template with custom delimiters also contains Tera's own expression
    /// delimiters, which the delimiter rewrite would reinterpret.
    #[error("template uses custom delimiters but contains literal '{sequence}'")]
    DelimiterCollision { sequence: String },
}

/// All errors that can arise from sink writes.
#[derive(Debug, Error)]
pub enum SinkError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination path has no parent directory (e.g. `/`).
    #[error("destination {path} is not a writable file path")]
    BadDestination { path: PathBuf },
}

/// Convenience constructor for [`SinkError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.into(),
        source,
    }
}
