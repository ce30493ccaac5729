//! Atomic destination writer.
//!
//! ## Write protocol
//!
//! 1. SHA-256 hash the rendered contents.
//! 2. Hash the destination's current bytes; skip if identical.
//! 3. In dry mode, emit the would-be contents to the dry stream instead.
//! 4. Otherwise snapshot the destination to `<path>.bak` when backup is on.
//! 5. Write to `<path>.scribe.tmp`, apply permission bits.
//! 6. Rename to the final path (atomic on POSIX).

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{io_err, SinkError};

/// Input to [`render`].
#[derive(Debug, Clone)]
pub struct RenderInput<'a> {
    pub contents: &'a str,
    pub path: &'a Path,
    /// File mode bits for the destination. When unset, an existing file keeps
    /// its mode and a new file gets 0o644.
    pub perms: Option<u32>,
    pub backup: bool,
    pub dry: bool,
}

/// Outcome of an individual sink call.
///
/// `would_render` reports that the contents were complete and a write was
/// attempted; `did_render` reports that the destination's bytes actually
/// changed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderResult {
    pub would_render: bool,
    pub did_render: bool,
}

/// Write `contents` to the destination, or to `dry_stream` in dry mode.
pub fn render(
    input: &RenderInput<'_>,
    dry_stream: &mut dyn Write,
) -> Result<RenderResult, SinkError> {
    let existing = read_existing(input.path)?;

    let unchanged = existing
        .as_deref()
        .map(|bytes| sha256(bytes) == sha256(input.contents.as_bytes()))
        .unwrap_or(false);
    if unchanged {
        tracing::debug!("unchanged: {}", input.path.display());
        return Ok(RenderResult {
            would_render: true,
            did_render: false,
        });
    }

    if input.dry {
        tracing::info!("[dry] would render: {}", input.path.display());
        write_dry(input, dry_stream)?;
        return Ok(RenderResult {
            would_render: true,
            did_render: false,
        });
    }

    if input.backup {
        if let Some(bytes) = &existing {
            write_backup(input.path, bytes)?;
        }
    }

    atomic_write(input, existing.is_some())?;

    tracing::info!("rendered: {}", input.path.display());
    Ok(RenderResult {
        would_render: true,
        did_render: true,
    })
}

fn read_existing(path: &Path) -> Result<Option<Vec<u8>>, SinkError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn sha256(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

fn write_dry(input: &RenderInput<'_>, dry_stream: &mut dyn Write) -> Result<(), SinkError> {
    writeln!(dry_stream, "> {}", input.path.display())
        .and_then(|_| dry_stream.write_all(input.contents.as_bytes()))
        .map_err(|e| io_err(input.path, e))
}

fn write_backup(path: &Path, bytes: &[u8]) -> Result<(), SinkError> {
    let backup = PathBuf::from(format!("{}.bak", path.display()));
    std::fs::write(&backup, bytes).map_err(|e| io_err(&backup, e))?;
    tracing::debug!("backed up {} to {}", path.display(), backup.display());
    Ok(())
}

fn atomic_write(input: &RenderInput<'_>, existed: bool) -> Result<(), SinkError> {
    let path = input.path;
    let parent = path
        .parent()
        .ok_or_else(|| SinkError::BadDestination {
            path: path.to_path_buf(),
        })?;
    if !parent.as_os_str().is_empty() && !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let tmp = PathBuf::from(format!("{}.scribe.tmp", path.display()));
    std::fs::write(&tmp, input.contents.as_bytes()).map_err(|e| io_err(&tmp, e))?;

    if let Err(err) = apply_perms(&tmp, path, input.perms, existed) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }

    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, err));
    }
    Ok(())
}

#[cfg(unix)]
fn apply_perms(
    tmp: &Path,
    path: &Path,
    perms: Option<u32>,
    existed: bool,
) -> Result<(), SinkError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = match perms {
        Some(mode) => mode,
        None if existed => {
            let meta = std::fs::metadata(path).map_err(|e| io_err(path, e))?;
            meta.permissions().mode() & 0o7777
        }
        None => 0o644,
    };
    std::fs::set_permissions(tmp, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(tmp, e))
}

#[cfg(not(unix))]
fn apply_perms(
    _tmp: &Path,
    _path: &Path,
    _perms: Option<u32>,
    _existed: bool,
) -> Result<(), SinkError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sink(path: &Path, contents: &str, dry: bool) -> RenderResult {
        let mut stream = Vec::new();
        render(
            &RenderInput {
                contents,
                path,
                perms: None,
                backup: false,
                dry,
            },
            &mut stream,
        )
        .unwrap()
    }

    #[test]
    fn first_write_renders() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        let result = sink(&path, "port = 8080\n", false);
        assert!(result.would_render && result.did_render);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "port = 8080\n");
    }

    #[test]
    fn identical_contents_would_render_but_do_not_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        sink(&path, "same", false);
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        let result = sink(&path, "same", false);
        assert!(result.would_render);
        assert!(!result.did_render);
        assert_eq!(
            std::fs::metadata(&path).unwrap().modified().unwrap(),
            mtime,
            "unchanged contents must not rewrite the file"
        );
    }

    #[test]
    fn changed_contents_rewrite() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        sink(&path, "v1", false);
        let result = sink(&path, "v2", false);
        assert!(result.did_render);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    }

    #[test]
    fn dry_mode_streams_instead_of_writing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        let mut stream = Vec::new();
        let result = render(
            &RenderInput {
                contents: "dry contents",
                path: &path,
                perms: None,
                backup: false,
                dry: true,
            },
            &mut stream,
        )
        .unwrap();

        assert!(result.would_render && !result.did_render);
        assert!(!path.exists(), "dry mode must not create files");
        let streamed = String::from_utf8(stream).unwrap();
        assert!(streamed.contains("app.conf"));
        assert!(streamed.contains("dry contents"));
    }

    #[test]
    fn dry_mode_skips_unchanged_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        sink(&path, "same", false);

        let mut stream = Vec::new();
        let result = render(
            &RenderInput {
                contents: "same",
                path: &path,
                perms: None,
                backup: false,
                dry: true,
            },
            &mut stream,
        )
        .unwrap();
        assert!(!result.did_render);
        assert!(stream.is_empty(), "unchanged contents emit nothing in dry mode");
    }

    #[test]
    fn tmp_file_is_cleaned_up() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        sink(&path, "data", false);
        let tmp_path = PathBuf::from(format!("{}.scribe.tmp", path.display()));
        assert!(!tmp_path.exists());
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etc").join("nested").join("app.conf");
        sink(&path, "data", false);
        assert!(path.exists());
    }

    #[test]
    fn backup_preserves_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        sink(&path, "old", false);

        let mut stream = Vec::new();
        render(
            &RenderInput {
                contents: "new",
                path: &path,
                perms: None,
                backup: true,
                dry: false,
            },
            &mut stream,
        )
        .unwrap();

        let backup = PathBuf::from(format!("{}.bak", path.display()));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn no_backup_on_first_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        let mut stream = Vec::new();
        render(
            &RenderInput {
                contents: "first",
                path: &path,
                perms: None,
                backup: true,
                dry: false,
            },
            &mut stream,
        )
        .unwrap();
        let backup = PathBuf::from(format!("{}.bak", path.display()));
        assert!(!backup.exists());
    }

    #[test]
    #[cfg(unix)]
    fn explicit_perms_are_applied() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("secret.conf");
        let mut stream = Vec::new();
        render(
            &RenderInput {
                contents: "s3cr3t",
                path: &path,
                perms: Some(0o600),
                backup: false,
                dry: false,
            },
            &mut stream,
        )
        .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    #[cfg(unix)]
    fn existing_mode_is_preserved_without_explicit_perms() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.conf");
        let mut stream = Vec::new();
        render(
            &RenderInput {
                contents: "v1",
                path: &path,
                perms: Some(0o640),
                backup: false,
                dry: false,
            },
            &mut stream,
        )
        .unwrap();
        render(
            &RenderInput {
                contents: "v2",
                path: &path,
                perms: None,
                backup: false,
                dry: false,
            },
            &mut stream,
        )
        .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }
}
