//! The internal device operations: empty, load, mount, umount, unload,
//! format, and the medium flush.
//!
//! Every operation updates the operational status only after the
//! underlying library or filesystem call returned. Failure classification
//! follows the hardware topology: an error on the changer or the drive
//! fails the device, an error on the cartridge fails the medium, and a
//! refused drive-to-drive move is reported as EBUSY so the caller retries
//! later. When the DSS cannot record a FAILED medium, its lock is kept on
//! purpose: the resource stays quarantined until an operator intervenes.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::dss::{OperationKind, OperationLog};
use crate::error::{CodedError, OpResult};
use crate::retry::{scsi_retry_class, with_retry, RetryClass};
use crate::types::{AdmStatus, FsStatus, FsType, MediumInfo, OpStatus};

use super::env::DeviceEnv;
use super::state::Device;

/// A failed device operation, with the failure scoped to its cause.
#[derive(Debug)]
pub struct OpError {
    pub error: CodedError,
    pub failure_on_dev: bool,
    pub failure_on_medium: bool,
    /// The operation may succeed later without any state change.
    pub can_retry: bool,
}

impl OpError {
    pub fn device(error: CodedError) -> Self {
        Self {
            error,
            failure_on_dev: true,
            failure_on_medium: false,
            can_retry: false,
        }
    }

    pub fn medium(error: CodedError) -> Self {
        Self {
            error,
            failure_on_dev: false,
            failure_on_medium: true,
            can_retry: false,
        }
    }

    pub fn both(error: CodedError) -> Self {
        Self {
            error,
            failure_on_dev: true,
            failure_on_medium: true,
            can_retry: false,
        }
    }

    pub fn retry_later(error: CodedError) -> Self {
        Self {
            error,
            failure_on_dev: false,
            failure_on_medium: false,
            can_retry: true,
        }
    }
}

pub(super) type DevResult<T = ()> = Result<T, OpError>;

/// Mount point of a drive: `<mount_prefix><basename(drive_path)>`.
pub fn mount_point(settings: &Settings, dev_path: &Path) -> PathBuf {
    let base = dev_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "drive".to_string());
    PathBuf::from(format!("{}{}", settings.lrs.mount_prefix, base))
}

/// Classifier for library moves: EINVAL must surface immediately so the
/// drive-to-drive case can be reclassified by the caller.
fn move_retry_class(err: &CodedError) -> RetryClass {
    match err.code() {
        libc::EAGAIN | libc::EINTR => RetryClass::Short,
        libc::ETIMEDOUT => RetryClass::Long,
        _ => RetryClass::Fatal,
    }
}

/// Marks a medium FAILED in the DSS and releases its lock.
///
/// When the DSS update itself fails the lock is kept: a medium we cannot
/// flag must not be handed to anyone else.
pub(super) async fn fail_release_medium(env: &DeviceEnv, medium: &MediumInfo) {
    error!(medium = %medium.id, "setting medium to failed");
    let mut failed = medium.clone();
    failed.adm_status = AdmStatus::Failed;
    match env.dss.update_medium(&failed).await {
        Err(err) => {
            error!(
                medium = %medium.id, error = %err,
                "cannot set medium to failed in DSS, keeping its lock"
            );
        }
        Ok(()) => {
            if let Err(err) = env
                .dss
                .unlock(crate::types::LockKind::Media, &medium.id.name, &env.owner)
                .await
            {
                error!(
                    medium = %medium.id, error = %err,
                    "cannot release lock of failed medium"
                );
            }
        }
    }
}

/// Releases the DSS lock of a healthy medium.
pub(super) async fn release_medium_lock(env: &DeviceEnv, medium: &MediumInfo) -> OpResult<()> {
    debug!(medium = %medium.id, "unlock medium");
    env.dss
        .unlock(crate::types::LockKind::Media, &medium.id.name, &env.owner)
        .await
}

/// Releases the DSS lock of the device itself.
pub(super) async fn release_device_lock(env: &DeviceEnv, dev: &Device) -> OpResult<()> {
    debug!(device = %dev.serial, "unlock device");
    env.dss
        .unlock(crate::types::LockKind::Device, &dev.serial, &env.owner)
        .await
}

async fn emit_log(env: &DeviceEnv, log: OperationLog) {
    if !log.should_persist() {
        return;
    }
    if let Err(err) = env.dss.emit_log(log).await {
        warn!(error = %err, "cannot persist operation log");
    }
}

/// Loads `medium` into the drive.
///
/// On success the medium moves into `loaded_medium` and `*medium` becomes
/// None. A refused drive-to-drive move comes back as EBUSY with
/// `can_retry` set and the medium (and its lock) untouched. On a
/// medium-scoped failure the medium is marked FAILED, released and
/// consumed. On a device-only failure the medium stays with the caller
/// unless `release_medium_on_dev_only_failure` asks for its lock to be
/// dropped.
pub(super) async fn dev_load(
    dev: &Device,
    env: &DeviceEnv,
    medium: &mut Option<MediumInfo>,
    release_medium_on_dev_only_failure: bool,
) -> DevResult {
    let target = match medium.as_ref() {
        Some(m) => m.clone(),
        None => {
            return Err(OpError::device(CodedError::invalid(format!(
                "device '{}' asked to load without a medium",
                dev.serial
            ))))
        }
    };
    debug!(medium = %target.id, device = %dev.serial, "load");
    let mut log = OperationLog::new(
        OperationKind::DeviceLoad,
        dev.serial.clone(),
        Some(target.id.name.clone()),
    );

    let drive = match with_retry(env.retry, scsi_retry_class, || {
        env.changer.drive_lookup(&dev.serial)
    })
    .await
    {
        Ok(drive) => drive,
        Err(err) => {
            dev.with_state(|state| state.op_status = OpStatus::Failed);
            if release_medium_on_dev_only_failure {
                if let Err(err2) = release_medium_lock(env, &target).await {
                    error!(error = %err2, "cannot release medium after device load error");
                }
            }
            log = log.with_error(err.code());
            emit_log(env, log).await;
            return Err(OpError::device(err));
        }
    };

    let source = match with_retry(env.retry, scsi_retry_class, || {
        env.changer.media_lookup(&target.id.name)
    })
    .await
    {
        Ok(addr) => addr,
        Err(err) => {
            fail_release_medium(env, &target).await;
            *medium = None;
            log = log.with_error(err.code());
            emit_log(env, log).await;
            return Err(OpError::medium(err));
        }
    };

    match with_retry(env.retry, move_retry_class, || {
        env.changer.media_move(source, drive.addr)
    })
    .await
    {
        Err(err) if err.code() == libc::EINVAL && source.is_drive() && drive.addr.is_drive() => {
            // Some libraries refuse drive-to-drive movements; the library
            // state changed between the scan and this pick. Signal EBUSY
            // so the caller tries again later.
            debug!(medium = %target.id, "drive-to-drive move refused, retrying later");
            return Err(OpError::retry_later(err.with_code(libc::EBUSY)));
        }
        Err(err) => {
            dev.with_state(|state| state.op_status = OpStatus::Failed);
            fail_release_medium(env, &target).await;
            *medium = None;
            log = log.with_error(err.code());
            emit_log(env, log).await;
            return Err(OpError::both(err));
        }
        Ok(()) => {}
    }

    dev.with_state(|state| {
        state.op_status = OpStatus::Loaded;
        let mut loaded = medium.take().expect("load target vanished");
        loaded.stats.nb_load += 1;
        loaded.stats.last_load = Some(Utc::now());
        state.loaded_medium = Some(loaded);
    });
    Ok(())
}

/// Unloads the loaded medium back into the library and releases its lock.
pub(super) async fn dev_unload(dev: &Device, env: &DeviceEnv) -> DevResult {
    let medium = match dev.with_state(|state| state.loaded_medium.clone()) {
        Some(m) => m,
        None => {
            return Err(OpError::device(CodedError::invalid(format!(
                "device '{}' asked to unload while empty",
                dev.serial
            ))))
        }
    };
    debug!(medium = %medium.id, device = %dev.serial, "unload");
    let mut log = OperationLog::new(
        OperationKind::DeviceUnload,
        dev.serial.clone(),
        Some(medium.id.name.clone()),
    );

    let result: OpResult<()> = async {
        let drive = with_retry(env.retry, scsi_retry_class, || {
            env.changer.drive_lookup(&dev.serial)
        })
        .await?;
        with_retry(env.retry, move_retry_class, || {
            env.changer
                .media_move(drive.addr, crate::changer::ElementAddr::Unknown)
        })
        .await
    }
    .await;

    if let Err(err) = result {
        dev.with_state(|state| state.op_status = OpStatus::Failed);
        log = log.with_error(err.code());
        emit_log(env, log).await;
        return Err(OpError::device(err));
    }

    let unloaded = dev.with_state(|state| {
        state.op_status = OpStatus::Empty;
        state.mnt_path = None;
        state.loaded_medium.take()
    });

    if let Some(unloaded) = unloaded {
        if let Err(err) = release_medium_lock(env, &unloaded).await {
            return Err(OpError::device(err));
        }
    }
    Ok(())
}

/// Mounts the loaded medium. The filesystem may already expose it, in
/// which case the existing mount root is adopted.
pub(super) async fn dev_mount(dev: &Device, env: &DeviceEnv) -> OpResult<()> {
    let medium = dev
        .with_state(|state| state.loaded_medium.clone())
        .ok_or_else(|| {
            CodedError::invalid(format!("device '{}' asked to mount while empty", dev.serial))
        })?;
    let fsa = env.fs(medium.fs.kind)?;

    if let Some(root) = fsa.mounted(&dev.path).await? {
        dev.with_state(|state| {
            state.op_status = OpStatus::Mounted;
            state.mnt_path = Some(root);
        });
        return Ok(());
    }

    let root = mount_point(&env.settings, &dev.path);
    let label = if medium.fs.label.is_empty() {
        medium.id.name.clone()
    } else {
        medium.fs.label.clone()
    };
    info!(
        medium = %medium.id, device = %dev.serial, root = %root.display(),
        "mount"
    );
    let root = with_retry(env.retry, scsi_retry_class, || {
        fsa.mount(&dev.path, &root, &label)
    })
    .await?;

    dev.with_state(|state| {
        state.op_status = OpStatus::Mounted;
        state.mnt_path = Some(root);
    });
    Ok(())
}

/// Unmounts the medium but leaves it loaded and locked. The pending sync
/// batch is drained with the umount outcome: a successful umount implies
/// the filesystem flushed its cache.
pub(super) async fn dev_umount(dev: &Device, env: &DeviceEnv) -> DevResult {
    let (medium, mnt) = dev.with_state(|state| {
        (
            state.loaded_medium.clone(),
            state.mnt_path.clone(),
        )
    });
    let (medium, mnt) = match (medium, mnt) {
        (Some(m), Some(p)) => (m, p),
        _ => {
            return Err(OpError::device(CodedError::invalid(format!(
                "device '{}' asked to umount while not mounted",
                dev.serial
            ))))
        }
    };
    info!(medium = %medium.id, device = %dev.serial, mnt = %mnt.display(), "umount");
    let mut log = OperationLog::new(
        OperationKind::Umount,
        dev.serial.clone(),
        Some(medium.id.name.clone()),
    );

    let result = match env.fs(medium.fs.kind) {
        Ok(fsa) => {
            with_retry(env.retry, scsi_retry_class, || {
                fsa.umount(&dev.path, &mnt)
            })
            .await
        }
        Err(err) => Err(err),
    };

    let rc = result.as_ref().err().map(|e| e.code()).unwrap_or(0);
    super::worker::drain_batch(dev, env, rc).await;

    match result {
        Ok(()) => {
            dev.with_state(|state| {
                state.op_status = OpStatus::Loaded;
                state.mnt_path = None;
            });
            Ok(())
        }
        Err(err) => {
            dev.with_state(|state| state.op_status = OpStatus::Failed);
            log = log.with_error(err.code());
            emit_log(env, log).await;
            Err(OpError::device(err))
        }
    }
}

/// Brings the drive to EMPTY, unmounting and unloading as needed.
pub(super) async fn dev_empty(dev: &Device, env: &DeviceEnv) -> DevResult {
    let status = dev.with_state(|state| state.op_status);
    match status {
        OpStatus::Empty => Ok(()),
        OpStatus::Mounted => {
            dev_umount(dev, env).await?;
            dev_unload(dev, env).await
        }
        OpStatus::Loaded => dev_unload(dev, env).await,
        OpStatus::Failed => Err(OpError::device(CodedError::invalid(format!(
            "cannot empty device '{}' in failed state",
            dev.serial
        )))),
    }
}

/// Formats the loaded medium and pushes its fresh state to the DSS.
pub(super) async fn dev_format(
    dev: &Device,
    env: &DeviceEnv,
    fs_kind: FsType,
    unlock: bool,
) -> OpResult<()> {
    let medium = dev
        .with_state(|state| state.loaded_medium.clone())
        .ok_or_else(|| {
            CodedError::invalid(format!(
                "device '{}' asked to format while empty",
                dev.serial
            ))
        })?;
    info!(medium = %medium.id, device = %dev.serial, fs = %fs_kind, "format");
    let mut log = OperationLog::new(
        OperationKind::Format,
        dev.serial.clone(),
        Some(medium.id.name.clone()),
    );

    let fsa = env.fs(fs_kind)?;
    let space = match with_retry(env.retry, scsi_retry_class, || {
        fsa.format(&dev.path, &medium.id.name)
    })
    .await
    {
        Ok(space) => space,
        Err(err) => {
            log = log.with_error(err.code());
            emit_log(env, log).await;
            return Err(err);
        }
    };

    let updated = dev.with_state(|state| {
        let m = state
            .loaded_medium
            .as_mut()
            .expect("formatted medium vanished");
        // The medium id is systematically used as the filesystem label.
        m.fs.label = m.id.name.clone();
        m.fs.kind = fs_kind;
        m.fs.status = FsStatus::Empty;
        m.stats.nb_obj = 0;
        m.stats.logc_spc_used = 0;
        m.stats.phys_spc_used = space.used;
        m.stats.phys_spc_free = space.avail;
        if unlock {
            debug!(medium = %m.id, "clearing admin lock after format");
            m.adm_status = AdmStatus::Unlocked;
        }
        m.clone()
    });

    env.dss.update_medium(&updated).await.map_err(|err| {
        error!(
            medium = %updated.id, error = %err,
            "cannot update medium state after format"
        );
        err
    })
}

/// Updates the medium statistics after a sync and pushes them to the DSS.
///
/// On a sync error the medium goes FAILED; otherwise the free-space probe
/// refreshes the physical counters and zero free space flips the
/// filesystem status to FULL.
pub(super) async fn media_update_after_sync(
    env: &DeviceEnv,
    medium: &mut MediumInfo,
    size_written: u64,
    media_rc: i32,
    mnt: &Path,
    nb_new_obj: u64,
) -> OpResult<()> {
    let mut first_err: Option<CodedError> = None;

    if medium.fs.status == FsStatus::Empty && media_rc == 0 {
        medium.fs.status = FsStatus::Used;
    }

    match env.fs(medium.fs.kind) {
        Err(err) => {
            error!(
                medium = %medium.id, error = %err,
                "invalid filesystem type, setting medium to failed"
            );
            medium.adm_status = AdmStatus::Failed;
            first_err = Some(err);
        }
        Ok(fsa) => match fsa.df(mnt).await {
            Err(err) => {
                error!(
                    medium = %medium.id, error = %err,
                    "cannot probe medium usage, setting medium to failed"
                );
                medium.adm_status = AdmStatus::Failed;
                first_err = Some(err);
            }
            Ok(space) => {
                medium.stats.phys_spc_used = space.used;
                medium.stats.phys_spc_free = space.avail;
                if space.avail == 0 {
                    medium.fs.status = FsStatus::Full;
                }
            }
        },
    }

    if media_rc != 0 {
        error!(medium = %medium.id, rc = media_rc, "setting medium to failed");
        medium.adm_status = AdmStatus::Failed;
    } else {
        medium.stats.nb_obj += nb_new_obj;
        medium.stats.logc_spc_used += size_written;
    }

    if let Err(err) = env.dss.update_medium(medium).await {
        if first_err.is_none() {
            first_err = Some(err);
        }
    }
    match first_err {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_mount_point_uses_basename() {
        let mut settings = Settings::default();
        settings.lrs.mount_prefix = "/mnt/spool.".to_string();
        assert_eq!(
            mount_point(&settings, Path::new("/dev/st0")),
            PathBuf::from("/mnt/spool.st0")
        );
    }

    #[test]
    fn test_move_classifier_surfaces_einval() {
        assert_eq!(
            move_retry_class(&CodedError::invalid("d2d refused")),
            RetryClass::Fatal
        );
        assert_eq!(
            move_retry_class(&CodedError::new(libc::EAGAIN, "x")),
            RetryClass::Short
        );
        assert_eq!(
            move_retry_class(&CodedError::timed_out("x")),
            RetryClass::Long
        );
    }

    #[test]
    fn test_op_error_scoping() {
        let err = OpError::retry_later(CodedError::busy("d2d"));
        assert!(err.can_retry);
        assert!(!err.failure_on_dev);
        assert!(!err.failure_on_medium);

        let err = OpError::both(CodedError::io("move failed"));
        assert!(err.failure_on_dev);
        assert!(err.failure_on_medium);
    }
}
