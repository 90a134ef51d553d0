//! The data-access trait for devices, media and locks.

use async_trait::async_trait;

use crate::error::OpResult;
use crate::types::{
    AdmStatus, DeviceInfo, Family, LockKind, LockOwner, LockRecord, MediumId, MediumInfo,
};

use super::OperationLog;

/// Typed queries and updates against the metadata store.
///
/// Implementations must apply each call atomically with respect to the
/// others; callers never batch.
#[async_trait]
pub trait DssGateway: Send + Sync {
    /// Devices of a family, optionally restricted to one host.
    async fn list_devices(&self, family: Family, host: Option<&str>)
        -> OpResult<Vec<DeviceInfo>>;

    async fn get_device(&self, family: Family, serial: &str) -> OpResult<Option<DeviceInfo>>;

    async fn update_device_adm_status(&self, serial: &str, status: AdmStatus) -> OpResult<()>;

    async fn list_media(&self, family: Family) -> OpResult<Vec<MediumInfo>>;

    async fn get_medium(&self, id: &MediumId) -> OpResult<Option<MediumInfo>>;

    /// Persists the full medium row (status, stats, fs descriptor, tags).
    async fn update_medium(&self, medium: &MediumInfo) -> OpResult<()>;

    /// Takes the (kind, id) lock for `owner`. Fails with EEXIST when the
    /// lock is already held, including by the caller.
    async fn lock(&self, kind: LockKind, id: &str, owner: &LockOwner) -> OpResult<()>;

    /// Releases a lock held by `owner`. Fails with EACCES on a holder
    /// mismatch and ENOENT when no such lock exists.
    async fn unlock(&self, kind: LockKind, id: &str, owner: &LockOwner) -> OpResult<()>;

    /// Releases a lock regardless of its holder. Startup reconciliation
    /// only; ENOENT when no such lock exists.
    async fn force_unlock(&self, kind: LockKind, id: &str) -> OpResult<()>;

    async fn list_locks(&self, kind: LockKind) -> OpResult<Vec<LockRecord>>;

    async fn lock_of(&self, kind: LockKind, id: &str) -> OpResult<Option<LockRecord>>;

    /// Records a structured operation log row.
    async fn emit_log(&self, log: OperationLog) -> OpResult<()>;
}
