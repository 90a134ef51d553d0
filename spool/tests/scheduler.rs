//! End-to-end scheduler tests against the in-memory metadata store, a
//! dummy changer and a scripted filesystem adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use spool::changer::DummyChanger;
use spool::config::{FairShareBounds, Settings};
use spool::device::FsRegistry;
use spool::dss::{DssGateway, MemoryDss};
use spool::error::{CodedError, OpResult};
use spool::mediafs::{FsSpace, MediumFs};
use spool::protocol::{ReleaseMedium, Request, RequestEnvelope, Response, WriteReq};
use spool::queue::TsQueue;
use spool::retry::RetryPolicy;
use spool::sched::request::{ReqContainer, RespContainer};
use spool::sched::FamilyScheduler;
use spool::types::{
    AddrType, AdmStatus, DeviceInfo, Family, FsInfo, FsStatus, FsType, LockKind, LockOwner,
    MediumId, MediumInfo, MediumStats,
};

const HOST: &str = "testhost";

/// Filesystem adapter with scriptable failures and space reports.
#[derive(Debug)]
struct ScriptedFs {
    mount_attempts: AtomicU32,
    mount_failures_left: AtomicU32,
    sync_count: AtomicU32,
    space: Mutex<FsSpace>,
    mounted: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl ScriptedFs {
    fn new(avail: u64) -> Arc<Self> {
        Arc::new(Self {
            mount_attempts: AtomicU32::new(0),
            mount_failures_left: AtomicU32::new(0),
            sync_count: AtomicU32::new(0),
            space: Mutex::new(FsSpace {
                used: 0,
                avail,
                read_only: false,
            }),
            mounted: Mutex::new(HashMap::new()),
        })
    }

    fn registry(self: &Arc<Self>) -> FsRegistry {
        let fs = Arc::clone(self);
        Arc::new(move |_| Ok(Arc::clone(&fs) as Arc<dyn MediumFs>))
    }

    fn fail_next_mounts(&self, count: u32) {
        self.mount_failures_left.store(count, Ordering::SeqCst);
    }

    fn set_avail(&self, avail: u64) {
        self.space.lock().avail = avail;
    }
}

#[async_trait]
impl MediumFs for ScriptedFs {
    async fn mount(
        &self,
        device_path: &Path,
        mnt_candidate: &Path,
        _label: &str,
    ) -> OpResult<PathBuf> {
        self.mount_attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .mount_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(CodedError::io("scripted mount failure"));
        }
        self.mounted
            .lock()
            .insert(device_path.to_path_buf(), mnt_candidate.to_path_buf());
        Ok(mnt_candidate.to_path_buf())
    }

    async fn umount(&self, device_path: &Path, _mnt_path: &Path) -> OpResult<()> {
        self.mounted.lock().remove(device_path);
        Ok(())
    }

    async fn format(&self, _device_path: &Path, _label: &str) -> OpResult<FsSpace> {
        Ok(*self.space.lock())
    }

    async fn df(&self, _mnt_path: &Path) -> OpResult<FsSpace> {
        Ok(*self.space.lock())
    }

    async fn mounted(&self, device_path: &Path) -> OpResult<Option<PathBuf>> {
        Ok(self.mounted.lock().get(device_path).cloned())
    }

    async fn get_label(&self, _mnt_path: &Path) -> OpResult<String> {
        Ok("scripted".to_string())
    }

    async fn sync_medium(&self, _mnt_path: &Path) -> OpResult<()> {
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    responses: Arc<TsQueue<RespContainer>>,
    incoming: Arc<TsQueue<Arc<ReqContainer>>>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(
        family: Family,
        settings: Settings,
        dss: Arc<MemoryDss>,
        fs_registry: FsRegistry,
    ) -> Self {
        let responses = Arc::new(TsQueue::new());
        let scheduler = FamilyScheduler::start(
            family,
            Arc::new(settings),
            Arc::clone(&dss) as Arc<dyn DssGateway>,
            Arc::new(DummyChanger::new()),
            fs_registry,
            Arc::clone(&responses),
            LockOwner::new(HOST, std::process::id()),
            Arc::new(AtomicBool::new(true)),
        )
        .await
        .expect("scheduler start");
        let incoming = scheduler.incoming();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(shutdown.clone()));
        Self {
            responses,
            incoming,
            shutdown,
            task,
        }
    }

    fn send(&self, req_id: u64, body: Request) -> Arc<ReqContainer> {
        let reqc = ReqContainer::new(1, RequestEnvelope { req_id, body });
        self.incoming.push(Arc::clone(&reqc));
        reqc
    }

    async fn wait_response(&self, timeout: Duration) -> Option<RespContainer> {
        tokio::time::timeout(timeout, async {
            loop {
                if let Some(resp) = self.responses.try_pop() {
                    return resp;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .ok()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(15), self.task).await;
    }
}

fn test_settings(family: Family) -> Settings {
    let mut settings = Settings::default();
    settings.lrs.families = vec![family];
    settings.lrs.max_dispatch_delay = Duration::from_millis(20);
    settings.scsi.retry = RetryPolicy {
        count: 5,
        short_delay: Duration::from_millis(1),
        long_delay: Duration::from_millis(2),
    };
    let sync = settings.sync.entry(family).or_default();
    sync.nb_req = 1;
    sync.time = Duration::from_millis(50);
    settings
}

fn device(serial: &str, family: Family, model: Option<&str>) -> DeviceInfo {
    DeviceInfo {
        id: serial.to_string(),
        family,
        model: model.map(str::to_string),
        path: PathBuf::from(format!("/srv/{serial}")),
        host: HOST.to_string(),
        adm_status: AdmStatus::Unlocked,
    }
}

fn medium(name: &str, family: Family, fs: FsType, status: FsStatus) -> MediumInfo {
    MediumInfo {
        id: MediumId::new(family, name),
        model: None,
        adm_status: AdmStatus::Unlocked,
        addr_type: AddrType::Path,
        fs: FsInfo {
            kind: fs,
            status,
            label: name.to_string(),
        },
        stats: MediumStats {
            phys_spc_free: 10 << 30,
            ..MediumStats::default()
        },
        tags: vec![],
    }
}

fn write_alloc(family: Family, size: u64) -> Request {
    Request::WriteAlloc {
        family,
        media: vec![WriteReq { size, tags: vec![] }],
    }
}

fn release(id: MediumId, written: u64, nb_obj: u64, rc: i32) -> Request {
    Request::Release {
        media: vec![ReleaseMedium {
            id,
            size_written: written,
            nb_obj,
            rc,
            to_sync: true,
        }],
    }
}

/// The write path: allocation, client I/O, release, batched sync,
/// acknowledgement. The release is acknowledged only after the medium
/// was flushed and its statistics persisted.
#[tokio::test]
async fn test_write_then_release_cycle() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    // The scheduler owns its device row.
    let dev_lock = dss.lock_of(LockKind::Device, "D0").await.unwrap().unwrap();
    assert_eq!(dev_lock.owner.hostname, HOST);

    harness.send(1, write_alloc(Family::Dir, 4096));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("write allocation answered");
    assert_eq!(resp.envelope.req_id, 1);
    let Response::WriteAlloc { media } = resp.envelope.body else {
        panic!("expected a write allocation response, got {:?}", resp.envelope.body);
    };
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].id.name, "m0");
    assert!(media[0].avail.is_some());
    assert!(!media[0].root_path.is_empty());

    // The allocated medium is locked by this daemon.
    let m_lock = dss.lock_of(LockKind::Media, "m0").await.unwrap().unwrap();
    assert_eq!(m_lock.owner.hostname, HOST);

    harness.send(2, release(MediumId::new(Family::Dir, "m0"), 4096, 2, 0));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("release answered");
    assert_eq!(resp.envelope.req_id, 2);
    let Response::Release { media } = resp.envelope.body else {
        panic!("expected a release response, got {:?}", resp.envelope.body);
    };
    assert_eq!(media, vec![MediumId::new(Family::Dir, "m0")]);

    // The acknowledgement implies the flush happened and the stats
    // landed in the metadata store.
    assert!(fs.sync_count.load(Ordering::SeqCst) >= 1);
    let stored = dss
        .get_medium(&MediumId::new(Family::Dir, "m0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.fs.status, FsStatus::Used);
    assert_eq!(stored.stats.logc_spc_used, 4096);
    assert_eq!(stored.stats.nb_obj, 2);
    assert_eq!(stored.stats.nb_load, 1);

    harness.stop().await;

    // Clean shutdown released both locks.
    assert!(dss.lock_of(LockKind::Media, "m0").await.unwrap().is_none());
    assert!(dss.lock_of(LockKind::Device, "D0").await.unwrap().is_none());
}

/// Zero free space after a sync flips the medium to FULL.
#[tokio::test]
async fn test_full_propagation_after_sync() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(1, write_alloc(Family::Dir, 4096));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("write allocation answered");

    // The client filled the medium to the brim.
    fs.set_avail(0);
    harness.send(2, release(MediumId::new(Family::Dir, "m0"), 4096, 1, 0));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("release answered");

    let stored = dss
        .get_medium(&MediumId::new(Family::Dir, "m0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.fs.status, FsStatus::Full);
    assert_eq!(stored.stats.phys_spc_free, 0);

    harness.stop().await;
}

/// A release carrying a client error drains the batch without a physical
/// sync and fails the medium.
#[tokio::test]
async fn test_release_with_client_error_fails_medium() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(1, write_alloc(Family::Dir, 4096));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("write allocation answered");
    let syncs_before = fs.sync_count.load(Ordering::SeqCst);

    harness.send(2, release(MediumId::new(Family::Dir, "m0"), 4096, 1, -libc::EIO));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("release answered");
    assert!(resp.envelope.body.is_error());

    // No physical sync on a poisoned batch; the medium is failed and no
    // logical usage was accounted.
    assert_eq!(fs.sync_count.load(Ordering::SeqCst), syncs_before);
    let stored = dss
        .get_medium(&MediumId::new(Family::Dir, "m0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.adm_status, AdmStatus::Failed);
    assert_eq!(stored.stats.logc_spc_used, 0);

    harness.stop().await;
}

/// A mount command failing twice then succeeding must not surface to the
/// client: the retry loop absorbs exactly two failures.
#[tokio::test]
async fn test_mount_retry_until_success() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Used));
    let fs = ScriptedFs::new(10 << 30);
    fs.fail_next_mounts(2);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(
        1,
        Request::ReadAlloc {
            n_required: 1,
            media: vec![MediumId::new(Family::Dir, "m0")],
        },
    );
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("read allocation answered");
    let Response::ReadAlloc { media } = resp.envelope.body else {
        panic!("expected a read allocation response, got {:?}", resp.envelope.body);
    };
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].id.name, "m0");
    assert_eq!(fs.mount_attempts.load(Ordering::SeqCst), 3);

    harness.stop().await;
}

fn fair_share_settings(max: [u32; 3]) -> Settings {
    let mut settings = test_settings(Family::Tape);
    let io = settings.io_sched.entry(Family::Tape).or_default();
    io.dispatch_algo = spool::config::DispatchAlgo::FairShare;
    settings.tape_model.supported_list = vec!["LTO5".to_string()];
    settings
        .tape_model
        .drive_models
        .insert("LTO5".to_string(), vec!["ULTRIUM-TD5".to_string()]);
    settings.fair_share.insert(
        "LTO5".to_string(),
        FairShareBounds { min: [0, 0, 0], max },
    );
    settings
}

fn tape_medium(name: &str, status: FsStatus) -> MediumInfo {
    let mut m = medium(name, Family::Tape, FsType::Ltfs, status);
    m.model = Some("LTO5".to_string());
    m
}

/// Fair share with a zero read maximum: the write goes through, the read
/// is refused admission but the medium keeps its lock. A scheduler with
/// a raised maximum then serves the read.
#[tokio::test]
async fn test_fair_share_denied_read_keeps_lock() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Tape, Some("ULTRIUM-TD5")));
    dss.insert_medium(tape_medium("P00001", FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);

    // Write allowed, read bounded to zero.
    let harness = Harness::start(
        Family::Tape,
        fair_share_settings([0, 1, 0]),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(1, write_alloc(Family::Tape, 4096));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("write allocation answered");
    assert!(matches!(resp.envelope.body, Response::WriteAlloc { .. }));
    harness.send(2, release(MediumId::new(Family::Tape, "P00001"), 4096, 1, 0));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("release answered");

    // The medium stays in the drive, locked by this daemon.
    let lock_before = dss
        .lock_of(LockKind::Media, "P00001")
        .await
        .unwrap()
        .expect("medium lock held");

    harness.send(
        3,
        Request::ReadAlloc {
            n_required: 1,
            media: vec![MediumId::new(Family::Tape, "P00001")],
        },
    );
    // The read maximum is zero: no answer, and the lock is untouched.
    assert!(harness.wait_response(Duration::from_millis(300)).await.is_none());
    let lock_after = dss
        .lock_of(LockKind::Media, "P00001")
        .await
        .unwrap()
        .expect("medium lock still held");
    assert_eq!(lock_before.owner, lock_after.owner);

    harness.stop().await;

    // Raised read maximum: the same read is served.
    let harness = Harness::start(
        Family::Tape,
        fair_share_settings([1, 1, 1]),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;
    harness.send(
        4,
        Request::ReadAlloc {
            n_required: 1,
            media: vec![MediumId::new(Family::Tape, "P00001")],
        },
    );
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("read allocation answered after raising the maximum");
    assert!(matches!(resp.envelope.body, Response::ReadAlloc { .. }));

    harness.stop().await;
}

/// Formatting a blank medium reports the medium id, writes the label and
/// clears the admin lock when asked to.
#[tokio::test]
async fn test_format_flow_with_unlock() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    let mut m = medium("m0", Family::Dir, FsType::Posix, FsStatus::Blank);
    m.adm_status = AdmStatus::Locked;
    dss.insert_medium(m);
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(
        1,
        Request::Format {
            medium: MediumId::new(Family::Dir, "m0"),
            fs: FsType::Posix,
            unlock: true,
        },
    );
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("format answered");
    let Response::Format { medium } = resp.envelope.body else {
        panic!("expected a format response, got {:?}", resp.envelope.body);
    };
    assert_eq!(medium.name, "m0");

    let stored = dss
        .get_medium(&MediumId::new(Family::Dir, "m0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.fs.status, FsStatus::Empty);
    assert_eq!(stored.fs.label, "m0");
    assert_eq!(stored.adm_status, AdmStatus::Unlocked);
    assert_eq!(stored.stats.nb_obj, 0);

    harness.stop().await;
}

/// Formatting a cartridge no present drive generation can write fails
/// with ENODEV.
#[tokio::test]
async fn test_format_without_capable_drive() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Tape, Some("ULTRIUM-TD5")));
    let mut m = tape_medium("L60001", FsStatus::Blank);
    m.model = Some("LTO6".to_string());
    dss.insert_medium(m);
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Tape,
        fair_share_settings([1, 1, 1]),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(
        1,
        Request::Format {
            medium: MediumId::new(Family::Tape, "L60001"),
            fs: FsType::Ltfs,
            unlock: false,
        },
    );
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("format answered");
    match resp.envelope.body {
        Response::Error { code, .. } => assert_eq!(code, libc::ENODEV),
        other => panic!("expected ENODEV, got {other:?}"),
    }

    harness.stop().await;
}

/// A waiter queued behind the only suitable medium is cancelled by
/// shutdown, while the in-flight allocation still drains through its
/// release.
#[tokio::test]
async fn test_shutdown_cancels_waiters_and_drains() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(1, write_alloc(Family::Dir, 4096));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("first write allocation answered");
    assert!(matches!(resp.envelope.body, Response::WriteAlloc { .. }));

    // The only medium is busy: this one waits in the queue.
    harness.send(2, write_alloc(Family::Dir, 4096));
    assert!(harness.wait_response(Duration::from_millis(200)).await.is_none());

    harness.shutdown.cancel();

    // The waiter is refused with a terminal error.
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("waiter answered during shutdown");
    assert_eq!(resp.envelope.req_id, 2);
    match &resp.envelope.body {
        Response::Error { code, .. } => assert_eq!(*code, libc::ECANCELED),
        other => panic!("expected ECANCELED, got {other:?}"),
    }

    // The in-flight allocation still gets its release through.
    harness.send(3, release(MediumId::new(Family::Dir, "m0"), 4096, 1, 0));
    let resp = harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("release answered during shutdown");
    assert_eq!(resp.envelope.req_id, 3);
    assert!(matches!(resp.envelope.body, Response::Release { .. }));

    let _ = tokio::time::timeout(Duration::from_secs(12), harness.task)
        .await
        .expect("scheduler drained within its deadline");
}

/// A second allocation reuses the mounted medium without another load.
#[tokio::test]
async fn test_second_write_reuses_mounted_medium() {
    let dss = Arc::new(MemoryDss::new());
    dss.insert_device(device("D0", Family::Dir, None));
    dss.insert_medium(medium("m0", Family::Dir, FsType::Posix, FsStatus::Empty));
    let fs = ScriptedFs::new(10 << 30);
    let harness = Harness::start(
        Family::Dir,
        test_settings(Family::Dir),
        Arc::clone(&dss),
        fs.registry(),
    )
    .await;

    harness.send(1, write_alloc(Family::Dir, 1024));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("first allocation answered");
    harness.send(2, release(MediumId::new(Family::Dir, "m0"), 1024, 1, 0));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("first release answered");

    harness.send(3, write_alloc(Family::Dir, 1024));
    harness
        .wait_response(Duration::from_secs(5))
        .await
        .expect("second allocation answered");

    // One mount serves both allocations.
    assert_eq!(fs.mount_attempts.load(Ordering::SeqCst), 1);
    let stored = dss
        .get_medium(&MediumId::new(Family::Dir, "m0"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.stats.nb_load, 1);

    harness.stop().await;
}
