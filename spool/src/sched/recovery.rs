//! Startup lock reconciliation.
//!
//! A daemon that died without a clean shutdown leaves device and media
//! lock rows behind. Before any scheduler starts, every lock row owned by
//! this hostname but another pid is released atomically with its
//! resource: such an owner is necessarily a dead predecessor, never the
//! running process. Reconciliation is scoped to the families this daemon
//! manages; locks on resources of other families — including those of a
//! sibling daemon on the same host — are never touched. The one
//! exception is a lock whose target id no longer exists in the metadata
//! store at all: it is a dangling row and is released unconditionally.
//!
//! The daemon shell runs this exactly once, before client connections
//! are accepted.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::dss::DssGateway;
use crate::error::OpResult;
use crate::types::{Family, LockKind, LockOwner};

/// What reconciliation did, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Locks released because a dead predecessor on this host held them.
    pub released_own: Vec<(LockKind, String)>,
    /// Locks released because their target no longer exists.
    pub released_orphans: Vec<(LockKind, String)>,
    /// Locks left untouched: foreign hosts, other families, or the
    /// running process itself.
    pub kept: usize,
}

/// Releases the stale locks of this host's dead predecessors within the
/// managed `families`, plus any dangling lock rows.
pub async fn reconcile_locks(
    dss: &dyn DssGateway,
    owner: &LockOwner,
    families: &[Family],
) -> OpResult<RecoveryReport> {
    // Family of every device and medium id the store knows. The full map
    // is needed to tell "another family's resource" (kept) apart from
    // "no resource at all" (dangling).
    let mut device_family: HashMap<String, Family> = HashMap::new();
    let mut media_family: HashMap<String, Family> = HashMap::new();
    for family in [Family::Tape, Family::Dir, Family::Rados] {
        for device in dss.list_devices(family, None).await? {
            device_family.insert(device.id, family);
        }
        for medium in dss.list_media(family).await? {
            media_family.insert(medium.id.name, family);
        }
    }

    let mut report = RecoveryReport::default();
    for kind in [LockKind::Device, LockKind::Media, LockKind::MediaUpdate] {
        for record in dss.list_locks(kind).await? {
            let target_family = match kind {
                LockKind::Device => device_family.get(&record.id),
                LockKind::Media | LockKind::MediaUpdate => media_family.get(&record.id),
            };
            match target_family {
                None => {
                    warn!(
                        kind = %kind, id = %record.id, hostname = %record.owner.hostname,
                        "releasing dangling lock with no live target"
                    );
                    dss.force_unlock(kind, &record.id).await?;
                    report.released_orphans.push((kind, record.id));
                }
                Some(family) if !families.contains(family) => {
                    // Not ours to reconcile, whatever its hostname says.
                    report.kept += 1;
                }
                Some(_) => {
                    let stale_own = record.owner.hostname == owner.hostname
                        && record.owner.pid != owner.pid;
                    if stale_own {
                        info!(
                            kind = %kind, id = %record.id, pid = record.owner.pid,
                            "releasing lock of previous daemon instance"
                        );
                        dss.force_unlock(kind, &record.id).await?;
                        report.released_own.push((kind, record.id));
                    } else {
                        report.kept += 1;
                    }
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dss::MemoryDss;
    use crate::types::{
        AddrType, AdmStatus, FsInfo, FsStatus, FsType, LockRecord, MediumId, MediumInfo,
        MediumStats,
    };
    use chrono::Utc;

    const SELF_PID: u32 = 4242;

    fn self_owner() -> LockOwner {
        LockOwner::new("self", SELF_PID)
    }

    fn family_medium(name: &str, family: Family, fs: FsType) -> MediumInfo {
        MediumInfo {
            id: MediumId::new(family, name),
            model: None,
            adm_status: AdmStatus::Unlocked,
            addr_type: AddrType::Path,
            fs: FsInfo {
                kind: fs,
                status: FsStatus::Used,
                label: name.to_string(),
            },
            stats: MediumStats::default(),
            tags: vec![],
        }
    }

    fn dir_medium(name: &str) -> MediumInfo {
        family_medium(name, Family::Dir, FsType::Posix)
    }

    fn lock(kind: LockKind, id: &str, hostname: &str, pid: u32) -> LockRecord {
        LockRecord {
            kind,
            id: id.to_string(),
            owner: LockOwner::new(hostname, pid),
            taken_at: Utc::now(),
        }
    }

    /// The recovery scenario of a restarted dir daemon: the predecessor's
    /// locks are released, foreign locks on live media survive.
    #[tokio::test]
    async fn test_own_locks_released_foreign_kept() {
        let dss = MemoryDss::new();
        for name in ["dir0", "dir1", "dir2", "dir3"] {
            dss.insert_medium(dir_medium(name));
        }
        dss.insert_lock(lock(LockKind::Media, "dir0", "self", 1000));
        dss.insert_lock(lock(LockKind::MediaUpdate, "dir1", "self", 1000));
        dss.insert_lock(lock(LockKind::Media, "dir2", "other", 2000));
        dss.insert_lock(lock(LockKind::MediaUpdate, "dir3", "other", 2000));

        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();

        assert_eq!(report.released_own.len(), 2);
        assert!(report.released_orphans.is_empty());
        assert_eq!(report.kept, 2);

        assert!(dss.lock_of(LockKind::Media, "dir0").await.unwrap().is_none());
        assert!(dss
            .lock_of(LockKind::MediaUpdate, "dir1")
            .await
            .unwrap()
            .is_none());
        let kept = dss.lock_of(LockKind::Media, "dir2").await.unwrap().unwrap();
        assert_eq!(kept.owner.hostname, "other");
        let kept = dss
            .lock_of(LockKind::MediaUpdate, "dir3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.owner.hostname, "other");
    }

    /// A lock held by the running process itself is alive, not a
    /// predecessor's leftovers.
    #[tokio::test]
    async fn test_own_pid_locks_are_kept() {
        let dss = MemoryDss::new();
        dss.insert_medium(dir_medium("dir0"));
        dss.insert_lock(lock(LockKind::Media, "dir0", "self", SELF_PID));

        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();

        assert!(report.released_own.is_empty());
        assert_eq!(report.kept, 1);
        assert!(dss.lock_of(LockKind::Media, "dir0").await.unwrap().is_some());
    }

    /// Locks on resources of a family this daemon does not manage are
    /// never touched, even when a sibling daemon on the same host holds
    /// them.
    #[tokio::test]
    async fn test_other_family_locks_are_kept() {
        let dss = MemoryDss::new();
        dss.insert_medium(family_medium("P00001", Family::Tape, FsType::Ltfs));
        dss.insert_lock(lock(LockKind::Media, "P00001", "self", 1000));

        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();

        assert!(report.released_own.is_empty());
        assert!(report.released_orphans.is_empty());
        assert_eq!(report.kept, 1);
        assert!(dss
            .lock_of(LockKind::Media, "P00001")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_dangling_locks_released_regardless_of_host() {
        let dss = MemoryDss::new();
        dss.insert_medium(dir_medium("dir0"));
        dss.insert_lock(lock(LockKind::Media, "dir0", "other", 2000));
        dss.insert_lock(lock(LockKind::Media, "ghost", "other", 2000));
        dss.insert_lock(lock(LockKind::Device, "ghost-drive", "other", 2000));

        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();

        assert_eq!(report.released_own.len(), 0);
        assert_eq!(report.released_orphans.len(), 2);
        assert_eq!(report.kept, 1);
        assert!(dss.lock_of(LockKind::Media, "dir0").await.unwrap().is_some());
        assert!(dss.lock_of(LockKind::Media, "ghost").await.unwrap().is_none());
        assert!(dss
            .lock_of(LockKind::Device, "ghost-drive")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_device_locks_of_predecessor_released() {
        let dss = MemoryDss::new();
        dss.insert_device(crate::types::DeviceInfo {
            id: "D0".to_string(),
            family: Family::Dir,
            model: None,
            path: "/srv/drive0".into(),
            host: "self".to_string(),
            adm_status: AdmStatus::Unlocked,
        });
        dss.insert_lock(lock(LockKind::Device, "D0", "self", 1234));

        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();
        assert_eq!(
            report.released_own,
            vec![(LockKind::Device, "D0".to_string())]
        );
        assert!(dss.lock_of(LockKind::Device, "D0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_store_reconciles_cleanly() {
        let dss = MemoryDss::new();
        let report = reconcile_locks(&dss, &self_owner(), &[Family::Dir])
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport::default());
    }
}
