//! Directory-backed media.
//!
//! A POSIX medium is a directory; the "drive" path is the directory
//! itself, so mounting is a label check and the mount root is the device
//! path. The label lives in a `.label` file written at format time.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CodedError, OpResult};

use super::{statvfs_space, FsSpace, MediumFs};

const LABEL_FILE: &str = ".label";

/// Filesystem adapter for directory media.
#[derive(Debug, Default)]
pub struct PosixFs;

impl PosixFs {
    pub fn new() -> Self {
        Self
    }

    fn label_path(device_path: &Path) -> PathBuf {
        device_path.join(LABEL_FILE)
    }
}

#[async_trait]
impl MediumFs for PosixFs {
    async fn mount(
        &self,
        device_path: &Path,
        _mnt_candidate: &Path,
        label: &str,
    ) -> OpResult<PathBuf> {
        let found = self.get_label(device_path).await?;
        if found != label {
            return Err(CodedError::invalid(format!(
                "directory '{}' is labelled '{found}', expected '{label}'",
                device_path.display()
            )));
        }
        debug!(path = %device_path.display(), "posix mount");
        Ok(device_path.to_path_buf())
    }

    async fn umount(&self, _device_path: &Path, _mnt_path: &Path) -> OpResult<()> {
        Ok(())
    }

    async fn format(&self, device_path: &Path, label: &str) -> OpResult<FsSpace> {
        tokio::fs::create_dir_all(device_path)
            .await
            .map_err(|e| CodedError::from_io(e, format!("mkdir '{}'", device_path.display())))?;
        tokio::fs::write(Self::label_path(device_path), label)
            .await
            .map_err(|e| {
                CodedError::from_io(e, format!("write label in '{}'", device_path.display()))
            })?;
        statvfs_space(device_path)
    }

    async fn df(&self, mnt_path: &Path) -> OpResult<FsSpace> {
        statvfs_space(mnt_path)
    }

    async fn mounted(&self, device_path: &Path) -> OpResult<Option<PathBuf>> {
        match tokio::fs::try_exists(Self::label_path(device_path)).await {
            Ok(true) => Ok(Some(device_path.to_path_buf())),
            Ok(false) => Ok(None),
            Err(e) => Err(CodedError::from_io(
                e,
                format!("probe '{}'", device_path.display()),
            )),
        }
    }

    async fn get_label(&self, mnt_path: &Path) -> OpResult<String> {
        let raw = tokio::fs::read_to_string(Self::label_path(mnt_path))
            .await
            .map_err(|e| {
                CodedError::from_io(e, format!("read label of '{}'", mnt_path.display()))
            })?;
        Ok(raw.trim().to_string())
    }

    async fn sync_medium(&self, mnt_path: &Path) -> OpResult<()> {
        let dir = std::fs::File::open(mnt_path)
            .map_err(|e| CodedError::from_io(e, format!("open '{}'", mnt_path.display())))?;
        tokio::task::spawn_blocking(move || dir.sync_all())
            .await
            .map_err(|_| CodedError::io("sync task aborted"))?
            .map_err(|e| CodedError::from_io(e, "fsync directory"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_format_then_mount() {
        let tmp = TempDir::new().unwrap();
        let medium = tmp.path().join("dir0");
        let fs = PosixFs::new();

        let space = fs.format(&medium, "dir0").await.unwrap();
        assert!(space.avail > 0);
        assert_eq!(fs.get_label(&medium).await.unwrap(), "dir0");

        let root = fs.mount(&medium, Path::new("/unused"), "dir0").await.unwrap();
        assert_eq!(root, medium);
    }

    #[tokio::test]
    async fn test_mount_rejects_wrong_label() {
        let tmp = TempDir::new().unwrap();
        let medium = tmp.path().join("dir0");
        let fs = PosixFs::new();
        fs.format(&medium, "dir0").await.unwrap();

        let err = fs
            .mount(&medium, Path::new("/unused"), "other")
            .await
            .unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[tokio::test]
    async fn test_mounted_reflects_format() {
        let tmp = TempDir::new().unwrap();
        let medium = tmp.path().join("dir0");
        let fs = PosixFs::new();

        assert!(fs.mounted(&medium).await.unwrap().is_none());
        fs.format(&medium, "dir0").await.unwrap();
        assert_eq!(fs.mounted(&medium).await.unwrap(), Some(medium.clone()));
    }

    #[tokio::test]
    async fn test_sync_and_df() {
        let tmp = TempDir::new().unwrap();
        let medium = tmp.path().join("dir0");
        let fs = PosixFs::new();
        fs.format(&medium, "dir0").await.unwrap();

        fs.sync_medium(&medium).await.unwrap();
        let space = fs.df(&medium).await.unwrap();
        assert!(space.avail > 0);
        assert!(!space.read_only);
    }

    #[tokio::test]
    async fn test_get_label_missing_is_enoent() {
        let fs = PosixFs::new();
        let err = fs
            .get_label(Path::new("/nonexistent-spool-dir"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), libc::ENOENT);
    }
}
