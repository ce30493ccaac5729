//! PID file helper.

use std::path::Path;

use crate::error::{io_err, RunnerError};

/// Write the current process id to `path`.
pub fn store(path: &Path) -> Result<(), RunnerError> {
    tracing::info!(path = %path.display(), "creating pid file");
    std::fs::write(path, std::process::id().to_string()).map_err(|e| io_err(path, e))
}

/// Remove the pid file at `path`. Refuses directories.
pub fn remove(path: &Path) -> Result<(), RunnerError> {
    tracing::debug!(path = %path.display(), "removing pid file");
    let stat = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
    if stat.is_dir() {
        return Err(io_err(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "pid file path is a directory",
            ),
        ));
    }
    std::fs::remove_file(path).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_writes_decimal_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scribe.pid");
        store(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }

    #[test]
    fn remove_deletes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scribe.pid");
        store(&path).unwrap();
        remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn remove_refuses_directories() {
        let dir = TempDir::new().unwrap();
        assert!(remove(dir.path()).is_err());
        assert!(dir.path().exists());
    }

    #[test]
    fn remove_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        assert!(remove(&dir.path().join("absent.pid")).is_err());
    }
}
