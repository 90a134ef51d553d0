//! Filesystem adapters for media.
//!
//! A [`MediumFs`] knows how to mount, unmount, format, flush and measure
//! one filesystem type. [`PosixFs`] serves directory media in-process;
//! [`LtfsFs`] drives the external LTFS commands. Adapters are selected by
//! [`FsType`] through [`fs_adapter`].

mod ltfs;
mod posix;

pub use ltfs::LtfsFs;
pub use posix::PosixFs;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::LtfsSettings;
use crate::error::{CodedError, OpResult};
use crate::types::FsType;

/// Free-space report of a mounted medium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsSpace {
    pub used: u64,
    pub avail: u64,
    /// LTFS mounts almost-full tapes read-only; writes must divert.
    pub read_only: bool,
}

/// Operations on a medium's filesystem.
#[async_trait]
pub trait MediumFs: Send + Sync + std::fmt::Debug {
    /// Mounts the medium in `device_path` and returns the effective mount
    /// root (which may differ from `mnt_candidate`).
    async fn mount(
        &self,
        device_path: &Path,
        mnt_candidate: &Path,
        label: &str,
    ) -> OpResult<PathBuf>;

    async fn umount(&self, device_path: &Path, mnt_path: &Path) -> OpResult<()>;

    /// Formats the loaded medium and reports its capacity.
    async fn format(&self, device_path: &Path, label: &str) -> OpResult<FsSpace>;

    /// Queries free space of a mounted medium.
    async fn df(&self, mnt_path: &Path) -> OpResult<FsSpace>;

    /// Returns the mount root when the medium is already mounted.
    async fn mounted(&self, device_path: &Path) -> OpResult<Option<PathBuf>>;

    async fn get_label(&self, mnt_path: &Path) -> OpResult<String>;

    /// Flushes the medium's write cache.
    async fn sync_medium(&self, mnt_path: &Path) -> OpResult<()>;
}

/// Builds the adapter for a filesystem type.
pub fn fs_adapter(kind: FsType, ltfs: &LtfsSettings) -> OpResult<Arc<dyn MediumFs>> {
    match kind {
        FsType::Posix => Ok(Arc::new(PosixFs::new())),
        FsType::Ltfs => Ok(Arc::new(LtfsFs::new(ltfs.clone()))),
        FsType::Rados => Err(CodedError::invalid(
            "no filesystem adapter for rados pools on this host",
        )),
    }
}

/// Reads free space of a path through statvfs.
pub(crate) fn statvfs_space(path: &Path) -> OpResult<FsSpace> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| {
        CodedError::new(
            e as i32,
            format!("statvfs on '{}' failed", path.display()),
        )
    })?;
    let frsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frsize;
    let avail = stat.blocks_available() as u64 * frsize;
    let free = stat.blocks_free() as u64 * frsize;
    Ok(FsSpace {
        used: total.saturating_sub(free),
        avail,
        read_only: stat.flags().contains(nix::sys::statvfs::FsFlags::ST_RDONLY),
    })
}
