//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Write `contents` to `path` through a sibling temp file and a rename, so a
/// crash never leaves a half-written file behind. The temp file is removed
/// again when the write does not go through.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("creating directory", parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = match tokio::fs::write(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error("renaming", path, e)),
        Err(e) => Err(io_error("writing", &tmp, e)),
    };
    if result.is_err()
        && let Err(e) = tokio::fs::remove_file(&tmp).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %tmp.display(), error = %e, "Failed to remove temp file");
    }
    result
}

/// Size of a file in bytes, or 0 if it cannot be read.
pub async fn file_size_or_zero(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_atomic_failure_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be replaced by a file
        let path = dir.path().join("settings.json");
        std::fs::create_dir(&path).unwrap();

        let err = write_atomic(&path, b"data").await.unwrap_err();
        assert!(err.to_string().contains("renaming"));
        assert!(path.is_dir());
        assert!(!dir.path().join("settings.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_size_or_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, vec![0u8; 1500]).unwrap();

        assert_eq!(file_size_or_zero(&path).await, 1500);
        assert_eq!(file_size_or_zero(&dir.path().join("missing.csv")).await, 0);
    }

    #[test]
    fn test_io_error_carries_context() {
        let err = io_error(
            "reading",
            Path::new("/nope"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.to_string().contains("reading /nope"));
    }
}
