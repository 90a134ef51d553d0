//! Default configuration values.

use std::time::Duration;

/// Default path of the startup mutual-exclusion file.
pub const DEFAULT_LOCK_FILE: &str = "/run/spoold/spoold.lock";

/// Default prefix of per-drive mount points.
pub const DEFAULT_MOUNT_PREFIX: &str = "/mnt/spool.";

/// Default listening socket.
pub const DEFAULT_LISTEN_SOCKET: &str = "/run/spoold/spoold.socket";

/// Default upper bound on how long a placeable request may wait.
pub const DEFAULT_MAX_DISPATCH_DELAY: Duration = Duration::from_secs(1);

/// SCSI retry defaults.
pub const DEFAULT_SCSI_RETRY_COUNT: u32 = 5;
pub const DEFAULT_SCSI_RETRY_SHORT: Duration = Duration::from_secs(1);
pub const DEFAULT_SCSI_RETRY_LONG: Duration = Duration::from_secs(5);

/// SCSI per-operation deadlines.
pub const DEFAULT_SCSI_QUERY_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_SCSI_MOVE_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const DEFAULT_SCSI_INQUIRY_TIMEOUT: Duration = Duration::from_millis(10);

/// Chunk cap for bulk element status reads.
pub const DEFAULT_SCSI_MAX_ELEMENT_STATUS: u32 = 84;

/// Sync batching defaults, applied per family unless overridden.
pub const DEFAULT_SYNC_TIME: Duration = Duration::from_millis(10_000);
pub const DEFAULT_SYNC_NB_REQ: usize = 5;
pub const DEFAULT_SYNC_WSIZE_KB: u64 = 1024 * 1024;

/// Default TLC endpoint.
pub const DEFAULT_TLC_HOSTNAME: &str = "localhost";
pub const DEFAULT_TLC_PORT: u16 = 20123;

/// Default LTFS command lines; `%s` placeholders are device, label, path.
pub const DEFAULT_LTFS_CMD_MOUNT: &str =
    "/usr/bin/ltfs -o devname=%s -o volname=%s %s";
pub const DEFAULT_LTFS_CMD_UMOUNT: &str = "/usr/bin/umount.ltfs %s %s";
pub const DEFAULT_LTFS_CMD_FORMAT: &str = "/usr/bin/mkltfs -d %s -n %s";
