//! LTFS-backed tape media, driven through the external LTFS commands.
//!
//! Command lines come from the `[ltfs]` configuration section; `%s`
//! placeholders are substituted positionally (device, label, mount point
//! for mount; device, mount point for umount; device, label for format).

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::LtfsSettings;
use crate::error::{CodedError, OpResult};

use super::{statvfs_space, FsSpace, MediumFs};

/// Filesystem adapter for LTFS cartridges.
#[derive(Debug)]
pub struct LtfsFs {
    settings: LtfsSettings,
}

impl LtfsFs {
    pub fn new(settings: LtfsSettings) -> Self {
        Self { settings }
    }

    /// Substitutes `%s` placeholders positionally.
    fn build_command(template: &str, args: &[&str]) -> OpResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut used = 0;
        while let Some(pos) = rest.find("%s") {
            let arg = args.get(used).ok_or_else(|| {
                CodedError::invalid(format!("too many placeholders in '{template}'"))
            })?;
            out.push_str(&rest[..pos]);
            out.push_str(arg);
            rest = &rest[pos + 2..];
            used += 1;
        }
        out.push_str(rest);
        if used != args.len() {
            return Err(CodedError::invalid(format!(
                "expected {} placeholders in '{template}', found {used}",
                args.len()
            )));
        }
        Ok(out)
    }

    async fn run(command_line: &str) -> OpResult<Output> {
        debug!(command = command_line, "running LTFS command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .output()
            .await
            .map_err(|e| CodedError::from_io(e, format!("spawn '{command_line}'")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodedError::io(format!(
                "'{command_line}' failed with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Parses "Volume capacity is <n> GB" from the format command output.
    fn parse_capacity(stdout: &str) -> Option<u64> {
        let marker = "Volume capacity is ";
        let start = stdout.find(marker)? + marker.len();
        let rest = &stdout[start..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let gb: u64 = digits.parse().ok()?;
        Some(gb * 1024 * 1024 * 1024)
    }
}

#[async_trait]
impl MediumFs for LtfsFs {
    async fn mount(
        &self,
        device_path: &Path,
        mnt_candidate: &Path,
        label: &str,
    ) -> OpResult<PathBuf> {
        tokio::fs::create_dir_all(mnt_candidate).await.map_err(|e| {
            CodedError::from_io(e, format!("mkdir '{}'", mnt_candidate.display()))
        })?;
        let cmd = Self::build_command(
            &self.settings.cmd_mount,
            &[
                &device_path.display().to_string(),
                label,
                &mnt_candidate.display().to_string(),
            ],
        )?;
        Self::run(&cmd).await?;
        Ok(mnt_candidate.to_path_buf())
    }

    async fn umount(&self, device_path: &Path, mnt_path: &Path) -> OpResult<()> {
        let cmd = Self::build_command(
            &self.settings.cmd_umount,
            &[
                &device_path.display().to_string(),
                &mnt_path.display().to_string(),
            ],
        )?;
        Self::run(&cmd).await?;
        Ok(())
    }

    async fn format(&self, device_path: &Path, label: &str) -> OpResult<FsSpace> {
        let cmd = Self::build_command(
            &self.settings.cmd_format,
            &[&device_path.display().to_string(), label],
        )?;
        let output = Self::run(&cmd).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let avail = match Self::parse_capacity(&stdout) {
            Some(bytes) => bytes,
            None => {
                warn!(
                    device = %device_path.display(),
                    "format output carries no volume capacity"
                );
                0
            }
        };
        Ok(FsSpace {
            used: 0,
            avail,
            read_only: false,
        })
    }

    async fn df(&self, mnt_path: &Path) -> OpResult<FsSpace> {
        statvfs_space(mnt_path)
    }

    async fn mounted(&self, device_path: &Path) -> OpResult<Option<PathBuf>> {
        let device = device_path.display().to_string();
        let mounts = tokio::fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| CodedError::from_io(e, "read /proc/mounts"))?;
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(source), Some(target)) = (fields.next(), fields.next()) else {
                continue;
            };
            if source.contains(&device) {
                return Ok(Some(PathBuf::from(target)));
            }
        }
        Ok(None)
    }

    async fn get_label(&self, mnt_path: &Path) -> OpResult<String> {
        let cmd = format!("attr -qg ltfs.volumeName {}", mnt_path.display());
        let output = Self::run(&cmd).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn sync_medium(&self, mnt_path: &Path) -> OpResult<()> {
        // LTFS flushes its write cache on syncfs of the mount point.
        let dir = std::fs::File::open(mnt_path)
            .map_err(|e| CodedError::from_io(e, format!("open '{}'", mnt_path.display())))?;
        tokio::task::spawn_blocking(move || dir.sync_all())
            .await
            .map_err(|_| CodedError::io("sync task aborted"))?
            .map_err(|e| CodedError::from_io(e, "sync LTFS mount"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_substitution() {
        let cmd = LtfsFs::build_command("/usr/bin/ltfs -o devname=%s -o volname=%s %s", &[
            "/dev/st0", "P00001", "/mnt/spool.st0",
        ])
        .unwrap();
        assert_eq!(
            cmd,
            "/usr/bin/ltfs -o devname=/dev/st0 -o volname=P00001 /mnt/spool.st0"
        );
    }

    #[test]
    fn test_build_command_placeholder_mismatch() {
        assert!(LtfsFs::build_command("%s %s %s", &["a", "b"]).is_err());
        assert!(LtfsFs::build_command("%s", &["a", "b"]).is_err());
    }

    #[test]
    fn test_parse_capacity() {
        let stdout = "Formatting...\nVolume capacity is 2408 GB\nDone.\n";
        assert_eq!(
            LtfsFs::parse_capacity(stdout),
            Some(2408 * 1024 * 1024 * 1024)
        );
        assert_eq!(LtfsFs::parse_capacity("no capacity here"), None);
    }

    #[tokio::test]
    async fn test_scripted_mount_command() {
        // The mount command is fully configurable, so a shell one-liner
        // stands in for the real LTFS binary.
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("mounted");
        let settings = LtfsSettings {
            cmd_mount: format!("touch {} # %s %s %s", marker.display()),
            ..LtfsSettings::default()
        };
        let fs = LtfsFs::new(settings);
        let mnt = tmp.path().join("mnt");
        let root = fs
            .mount(Path::new("/dev/st0"), &mnt, "P00001")
            .await
            .unwrap();
        assert_eq!(root, mnt);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_failing_command_is_eio() {
        let settings = LtfsSettings {
            cmd_umount: "false # %s %s".to_string(),
            ..LtfsSettings::default()
        };
        let fs = LtfsFs::new(settings);
        let err = fs
            .umount(Path::new("/dev/st0"), Path::new("/mnt/x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), libc::EIO);
    }
}
