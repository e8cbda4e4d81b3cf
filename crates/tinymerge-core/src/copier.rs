use crate::error::{MergeError, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Leaf copy operation used by the tree walk and by rollback.
///
/// Implementations must never overwrite an existing destination.
#[async_trait::async_trait]
pub trait FileCopier: Send + Sync + 'static {
    /// Copy `src` to `dest`, returning the number of bytes written.
    async fn copy_file(&self, src: &Path, dest: &Path) -> Result<u64>;
}

/// Copier backed by the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsCopier;

#[async_trait::async_trait]
impl FileCopier for FsCopier {
    async fn copy_file(&self, src: &Path, dest: &Path) -> Result<u64> {
        copy_file(src, dest).await
    }
}

/// Copy one regular file, creating the parent directories of `dest`.
///
/// `dest` is opened with create-new semantics so an existing file is never
/// truncated. Permission bits are copied from `src`; timestamps are not.
/// If writing fails after `dest` was created, the partial file is removed.
pub async fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    if src == dest {
        return Ok(0);
    }
    if src.as_os_str().is_empty() {
        return Err(MergeError::NotFound {
            op: "copy",
            path: src.to_path_buf(),
        });
    }
    if dest.as_os_str().is_empty() {
        return Err(MergeError::NotFound {
            op: "copy",
            path: dest.to_path_buf(),
        });
    }

    let meta = fs::metadata(src).await.map_err(MergeError::with("stat", src))?;
    if meta.is_dir() {
        return Err(MergeError::IsADirectory {
            path: src.to_path_buf(),
        });
    }

    match fs::symlink_metadata(dest).await {
        Ok(existing) if existing.is_dir() => {
            return Err(MergeError::IsADirectory {
                path: dest.to_path_buf(),
            })
        }
        Ok(_) => {
            return Err(MergeError::AlreadyExists {
                path: dest.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(MergeError::io("stat", dest, e)),
    }

    let mut reader = fs::File::open(src)
        .await
        .map_err(MergeError::with("open", src))?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(MergeError::with("mkdir", parent))?;
    }

    let mut writer = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(MergeError::with("create", dest))?;

    let written = async {
        let n = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(MergeError::with("copy", dest))?;
        writer.flush().await.map_err(MergeError::with("flush", dest))?;
        writer
            .set_permissions(meta.permissions())
            .await
            .map_err(MergeError::with("chmod", dest))?;
        Ok::<u64, MergeError>(n)
    }
    .await;

    match written {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(writer);
            if let Err(rm) = fs::remove_file(dest).await {
                tracing::warn!(
                    path = %dest.display(),
                    error = %rm,
                    "Failed to remove partially written file"
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        let dest = tmp.path().join("out/nested/a.txt");
        std::fs::write(&src, b"hello world").unwrap();

        let n = copy_file(&src, &dest).await.unwrap();

        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_same_path_is_noop() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        std::fs::write(&src, b"A").unwrap();

        assert_eq!(copy_file(&src, &src).await.unwrap(), 0);
        assert_eq!(std::fs::read(&src).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_missing_or_empty_source() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("b.txt");

        let err = copy_file(&tmp.path().join("nope"), &dest).await.unwrap_err();
        assert!(matches!(err, MergeError::NotFound { .. }));

        let err = copy_file(Path::new(""), &dest).await.unwrap_err();
        assert!(matches!(err, MergeError::NotFound { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_directory_source() {
        let tmp = TempDir::new().unwrap();
        let err = copy_file(tmp.path(), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::IsADirectory { .. }));
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        let dest = tmp.path().join("b.txt");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"old").unwrap();

        let err = copy_file(&src, &dest).await.unwrap_err();

        assert!(matches!(err, MergeError::AlreadyExists { .. }));
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copies_permission_bits() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("run.sh");
        let dest = tmp.path().join("out/run.sh");
        std::fs::write(&src, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o750)).unwrap();

        copy_file(&src, &dest).await.unwrap();

        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }
}
