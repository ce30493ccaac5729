//! Error types for scribe-watch.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while loading a catalog file.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Underlying I/O failure reading the catalog file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the offending file path.
    #[error("failed to parse catalog at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
