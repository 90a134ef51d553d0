//! The context value threaded through device workers.
//!
//! Workers own no global state: everything they touch (DSS gateway,
//! changer, filesystem registry, queues, daemon lifecycle flag) comes in
//! through a [`DeviceEnv`] built once at scheduler start.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::changer::MediaChanger;
use crate::config::Settings;
use crate::dss::DssGateway;
use crate::error::OpResult;
use crate::mediafs::{fs_adapter, MediumFs};
use crate::queue::TsQueue;
use crate::retry::RetryPolicy;
use crate::sched::request::{ReqContainer, RespContainer, SubRequest};
use crate::types::{FsType, LockOwner, MediumId};

use super::state::Device;

/// Builds the filesystem adapter for a type; injectable so tests can
/// script failures.
pub type FsRegistry = Arc<dyn Fn(FsType) -> OpResult<Arc<dyn MediumFs>> + Send + Sync>;

/// Shared, mutable registry of the scheduler's devices, keyed by serial.
///
/// The scheduler's device set owns the devices; workers hold this handle
/// only to reach siblings (cancellation of completed peers).
pub type DeviceRegistry = Arc<RwLock<HashMap<String, Arc<Device>>>>;

/// Everything a device worker needs besides its own state.
pub struct DeviceEnv {
    pub dss: Arc<dyn DssGateway>,
    pub changer: Arc<dyn MediaChanger>,
    pub fs_registry: FsRegistry,
    pub settings: Arc<Settings>,
    pub sync: crate::config::SyncSettings,
    pub retry: RetryPolicy,
    pub owner: LockOwner,
    pub registry: DeviceRegistry,
    /// Media with a format in flight, to refuse double formats.
    pub ongoing_formats: Arc<Mutex<HashSet<MediumId>>>,
    pub responses: Arc<TsQueue<RespContainer>>,
    pub retry_queue: Arc<TsQueue<SubRequest>>,
    pub incoming: Arc<TsQueue<Arc<ReqContainer>>>,
    /// Cleared when the daemon enters shutdown; forces sync drains.
    pub daemon_running: Arc<AtomicBool>,
}

impl DeviceEnv {
    /// Filesystem adapter for a type.
    pub fn fs(&self, kind: FsType) -> OpResult<Arc<dyn MediumFs>> {
        (self.fs_registry)(kind)
    }

    /// The production registry: POSIX and LTFS adapters from the
    /// configuration.
    pub fn default_fs_registry(settings: &Arc<Settings>) -> FsRegistry {
        let settings = Arc::clone(settings);
        Arc::new(move |kind| fs_adapter(kind, &settings.ltfs))
    }
}
