//! Configuration structs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::Family;

use super::defaults::*;

/// Where the daemon listens for client connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// Filesystem socket.
    Unix(PathBuf),
    /// TCP endpoint.
    Tcp { host: String, port: u16 },
}

/// Dispatch algorithm selector for a family's I/O scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchAlgo {
    #[default]
    Fifo,
    GroupedRead,
    FairShare,
}

impl DispatchAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::GroupedRead => "grouped_read",
            Self::FairShare => "fair_share",
        }
    }
}

impl FromStr for DispatchAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "grouped_read" => Ok(Self::GroupedRead),
            "fair_share" => Ok(Self::FairShare),
            other => Err(format!("unknown dispatch algorithm '{other}'")),
        }
    }
}

/// `[lrs]` section.
#[derive(Debug, Clone)]
pub struct LrsSettings {
    /// Startup mutual-exclusion file; its directory must exist.
    pub lock_file: PathBuf,
    /// Root of per-drive mount points.
    pub mount_prefix: String,
    /// Families managed by this daemon.
    pub families: Vec<Family>,
    pub listen: ListenAddr,
    pub max_dispatch_delay: Duration,
}

impl Default for LrsSettings {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
            families: vec![Family::Tape],
            listen: ListenAddr::Unix(PathBuf::from(DEFAULT_LISTEN_SOCKET)),
            max_dispatch_delay: DEFAULT_MAX_DISPATCH_DELAY,
        }
    }
}

/// `[io_sched_<family>]` section.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoSchedSettings {
    pub dispatch_algo: DispatchAlgo,
    /// Algorithm subset for the read pipeline.
    pub read_algo: DispatchAlgo,
}

/// `[scsi]` section.
#[derive(Debug, Clone, Copy)]
pub struct ScsiSettings {
    pub retry: RetryPolicy,
    pub query_timeout: Duration,
    pub move_timeout: Duration,
    pub inquiry_timeout: Duration,
    pub max_element_status: u32,
}

impl Default for ScsiSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                count: DEFAULT_SCSI_RETRY_COUNT,
                short_delay: DEFAULT_SCSI_RETRY_SHORT,
                long_delay: DEFAULT_SCSI_RETRY_LONG,
            },
            query_timeout: DEFAULT_SCSI_QUERY_TIMEOUT,
            move_timeout: DEFAULT_SCSI_MOVE_TIMEOUT,
            inquiry_timeout: DEFAULT_SCSI_INQUIRY_TIMEOUT,
            max_element_status: DEFAULT_SCSI_MAX_ELEMENT_STATUS,
        }
    }
}

/// `[sync_<family>]` section: when to flush a medium.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Age threshold of the oldest pending release.
    pub time: Duration,
    /// Pending-release count threshold.
    pub nb_req: usize,
    /// Cumulative written size threshold, in KiB.
    pub wsize_kb: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            time: DEFAULT_SYNC_TIME,
            nb_req: DEFAULT_SYNC_NB_REQ,
            wsize_kb: DEFAULT_SYNC_WSIZE_KB,
        }
    }
}

/// `[ltfs]` section: external command lines driving the tape filesystem.
#[derive(Debug, Clone)]
pub struct LtfsSettings {
    pub cmd_mount: String,
    pub cmd_umount: String,
    pub cmd_format: String,
}

impl Default for LtfsSettings {
    fn default() -> Self {
        Self {
            cmd_mount: DEFAULT_LTFS_CMD_MOUNT.to_string(),
            cmd_umount: DEFAULT_LTFS_CMD_UMOUNT.to_string(),
            cmd_format: DEFAULT_LTFS_CMD_FORMAT.to_string(),
        }
    }
}

/// `[tlc]` section: tape library controller endpoint.
#[derive(Debug, Clone)]
pub struct TlcSettings {
    pub hostname: String,
    pub port: u16,
}

impl Default for TlcSettings {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_TLC_HOSTNAME.to_string(),
            port: DEFAULT_TLC_PORT,
        }
    }
}

/// `[tape_model]` plus `[drive_type "<techno>_drive"]` sections.
///
/// Maps drive model strings to a technology (tape generation). The match
/// is case-sensitive.
#[derive(Debug, Clone, Default)]
pub struct TapeModelSettings {
    pub supported_list: Vec<String>,
    /// technology -> drive model strings
    pub drive_models: HashMap<String, Vec<String>>,
}

impl TapeModelSettings {
    /// Technology of a drive model, or None when the model is unknown.
    pub fn techno_of_model(&self, model: &str) -> Option<&str> {
        for techno in &self.supported_list {
            if let Some(models) = self.drive_models.get(techno) {
                if models.iter().any(|m| m == model) {
                    return Some(techno);
                }
            }
        }
        None
    }
}

/// `[fair_share "<techno>"]` sections: per-kind in-flight reservations,
/// ordered (format, write, read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairShareBounds {
    pub min: [u32; 3],
    pub max: [u32; 3],
}

impl Default for FairShareBounds {
    fn default() -> Self {
        Self {
            min: [0, 0, 0],
            max: [u32::MAX, u32::MAX, u32::MAX],
        }
    }
}

/// The full daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub lrs: LrsSettings,
    pub io_sched: HashMap<Family, IoSchedSettings>,
    pub scsi: ScsiSettings,
    pub sync: HashMap<Family, SyncSettings>,
    pub ltfs: LtfsSettings,
    pub tlc: TlcSettings,
    pub tape_model: TapeModelSettings,
    pub fair_share: HashMap<String, FairShareBounds>,
}

impl Settings {
    /// Sync thresholds for a family, falling back to defaults.
    pub fn sync_for(&self, family: Family) -> SyncSettings {
        self.sync.get(&family).copied().unwrap_or_default()
    }

    /// I/O scheduler settings for a family, falling back to fifo.
    pub fn io_sched_for(&self, family: Family) -> IoSchedSettings {
        self.io_sched.get(&family).copied().unwrap_or_default()
    }
}
