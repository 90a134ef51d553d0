//! Resource model: families, statuses, media and device records.
//!
//! These types mirror the rows of the DSS metadata store. They are plain
//! data; all behavior lives in the [`crate::device`] and [`crate::sched`]
//! modules.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodedError;

/// Resource family: the kind of transport and medium a scheduler manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Tape,
    Dir,
    Rados,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tape => "tape",
            Self::Dir => "dir",
            Self::Rados => "rados",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = CodedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tape" => Ok(Self::Tape),
            "dir" => Ok(Self::Dir),
            "rados" => Ok(Self::Rados),
            other => Err(CodedError::invalid(format!("unknown family '{other}'"))),
        }
    }
}

/// Filesystem type written on a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Posix,
    Ltfs,
    Rados,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Posix => "posix",
            Self::Ltfs => "ltfs",
            Self::Rados => "rados",
        };
        f.write_str(s)
    }
}

impl FromStr for FsType {
    type Err = CodedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posix" => Ok(Self::Posix),
            "ltfs" => Ok(Self::Ltfs),
            "rados" => Ok(Self::Rados),
            other => Err(CodedError::invalid(format!("unknown fs type '{other}'"))),
        }
    }
}

/// Media-changer adapter kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibKind {
    Scsi,
    Rados,
    Dummy,
}

/// How object addresses are built on a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrType {
    Path,
    Hash,
    Opaque,
}

/// Administrative status of a device or medium, set by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmStatus {
    Locked,
    Unlocked,
    Failed,
}

impl AdmStatus {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }
}

/// Operational status of a drive, owned by its device worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Empty,
    Loaded,
    Mounted,
    Failed,
}

impl OpStatus {
    /// FAILED is terminal within a run; only an admin reset clears it.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Loaded => "loaded",
            Self::Mounted => "mounted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Filesystem lifecycle status of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsStatus {
    /// Never formatted.
    Blank,
    /// Formatted, no object written yet.
    Empty,
    /// Holds at least one object.
    Used,
    /// No usable space left.
    Full,
}

/// Identifier of a medium: family plus barcode or directory path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediumId {
    pub family: Family,
    pub name: String,
}

impl MediumId {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.name)
    }
}

/// Usage statistics of a medium, persisted as a JSON blob in the DSS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediumStats {
    pub nb_obj: u64,
    pub logc_spc_used: u64,
    pub phys_spc_used: u64,
    pub phys_spc_free: u64,
    pub nb_load: u64,
    pub nb_errors: u64,
    pub last_load: Option<DateTime<Utc>>,
}

/// Filesystem descriptor of a medium.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub kind: FsType,
    pub status: FsStatus,
    /// Filesystem label; the medium id is used systematically on format.
    pub label: String,
}

/// A medium row: cartridge or directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumInfo {
    pub id: MediumId,
    pub model: Option<String>,
    pub adm_status: AdmStatus,
    pub addr_type: AddrType,
    pub fs: FsInfo,
    pub stats: MediumStats,
    pub tags: Vec<String>,
}

impl MediumInfo {
    /// Whether this medium may receive new writes.
    pub fn is_writable(&self) -> bool {
        self.adm_status.is_unlocked()
            && matches!(self.fs.status, FsStatus::Empty | FsStatus::Used)
    }

    /// Whether the medium carries every requested tag.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}

/// A device row: a drive or directory transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Serial number, unique per host.
    pub id: String,
    pub family: Family,
    pub model: Option<String>,
    pub path: PathBuf,
    pub host: String,
    pub adm_status: AdmStatus,
}

/// Lock table key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Device,
    Media,
    MediaUpdate,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Device => "device",
            Self::Media => "media",
            Self::MediaUpdate => "media_update",
        };
        f.write_str(s)
    }
}

/// Identity of a lock holder: hostname plus pid.
///
/// Locks are advisory and host-scoped; there is no distributed consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub hostname: String,
    pub pid: u32,
}

impl LockOwner {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// The identity of the running process, using the short hostname.
    pub fn local() -> Self {
        Self {
            hostname: local_hostname(),
            pid: std::process::id(),
        }
    }
}

/// Short hostname of this machine (first label only).
pub fn local_hostname() -> String {
    let name = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    match name.split('.').next() {
        Some(short) if !short.is_empty() => short.to_string(),
        _ => name,
    }
}

/// A lock row, unique on (kind, id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub kind: LockKind,
    pub id: String,
    pub owner: LockOwner,
    pub taken_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_round_trip() {
        for family in [Family::Tape, Family::Dir, Family::Rados] {
            assert_eq!(family.as_str().parse::<Family>().unwrap(), family);
        }
    }

    #[test]
    fn test_family_unknown_is_einval() {
        let err = "floppy".parse::<Family>().unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn test_fs_type_round_trip() {
        for fs in [FsType::Posix, FsType::Ltfs, FsType::Rados] {
            assert_eq!(fs.to_string().parse::<FsType>().unwrap(), fs);
        }
    }

    #[test]
    fn test_op_status_failed_is_terminal_marker() {
        assert!(OpStatus::Failed.is_failed());
        assert!(!OpStatus::Mounted.is_failed());
    }

    fn medium(status: FsStatus, adm: AdmStatus) -> MediumInfo {
        MediumInfo {
            id: MediumId::new(Family::Tape, "P00001"),
            model: Some("LTO5".to_string()),
            adm_status: adm,
            addr_type: AddrType::Hash,
            fs: FsInfo {
                kind: FsType::Ltfs,
                status,
                label: "P00001".to_string(),
            },
            stats: MediumStats::default(),
            tags: vec!["prod".to_string()],
        }
    }

    #[test]
    fn test_medium_writability() {
        assert!(medium(FsStatus::Empty, AdmStatus::Unlocked).is_writable());
        assert!(medium(FsStatus::Used, AdmStatus::Unlocked).is_writable());
        assert!(!medium(FsStatus::Full, AdmStatus::Unlocked).is_writable());
        assert!(!medium(FsStatus::Blank, AdmStatus::Unlocked).is_writable());
        assert!(!medium(FsStatus::Used, AdmStatus::Locked).is_writable());
    }

    #[test]
    fn test_medium_tag_filtering() {
        let m = medium(FsStatus::Used, AdmStatus::Unlocked);
        assert!(m.has_tags(&[]));
        assert!(m.has_tags(&["prod".to_string()]));
        assert!(!m.has_tags(&["archive".to_string()]));
    }

    #[test]
    fn test_lock_owner_local_has_pid() {
        let owner = LockOwner::local();
        assert_eq!(owner.pid, std::process::id());
        assert!(!owner.hostname.is_empty());
        assert!(!owner.hostname.contains('.'));
    }

    #[test]
    fn test_lock_kind_display() {
        assert_eq!(LockKind::MediaUpdate.to_string(), "media_update");
    }
}
