//! Daemon lifecycle: bind, lockfile, pidfile, signal handling and the
//! bounded shutdown sequencer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::changer::open_changer;
use crate::config::Settings;
use crate::device::DeviceEnv;
use crate::dss::{DssGateway, MemoryDss};
use crate::error::CodedError;
use crate::queue::TsQueue;
use crate::sched::{reconcile_locks, FamilyScheduler, SHUTDOWN_TIMEOUT};
use crate::types::LockOwner;

use super::lockfile::StartupLock;
use super::router::{Listener, Router};

/// Grace granted to schedulers past their own drain deadline.
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// How the daemon was started.
#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Interactive mode: stay in the foreground, no pidfile required.
    pub interactive: bool,
    /// Where to write the pid, from `DAEMON_PID_FILEPATH`.
    pub pidfile: Option<PathBuf>,
}

/// Fatal daemon conditions, each mapping to a documented exit code.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another daemon instance is already running: {0}")]
    AlreadyRunning(String),

    #[error("misconfiguration: {0}")]
    Config(String),

    #[error("no device is available to schedule")]
    NoDevice,

    #[error("startup failed: {0}")]
    Startup(CodedError),

    #[error("shutdown exceeded its deadline")]
    UncleanShutdown,
}

impl DaemonError {
    /// Process exit code for this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyRunning(_) => libc::EEXIST,
            Self::Config(_) | Self::Startup(_) => 1,
            Self::NoDevice => libc::ENXIO,
            Self::UncleanShutdown => libc::EIO,
        }
    }
}

/// The spool daemon: one scheduler per configured family behind one
/// listener.
pub struct Daemon {
    settings: Arc<Settings>,
    dss: Arc<dyn DssGateway>,
    opts: DaemonOptions,
}

impl Daemon {
    pub fn new(settings: Settings, opts: DaemonOptions) -> Self {
        Self {
            settings: Arc::new(settings),
            dss: Arc::new(MemoryDss::new()),
            opts,
        }
    }

    /// Replaces the metadata gateway; deployments with an external DSS
    /// plug it in here.
    pub fn with_gateway(mut self, dss: Arc<dyn DssGateway>) -> Self {
        self.dss = dss;
        self
    }

    /// Runs the daemon until a stop signal, then shuts down within the
    /// hard deadline.
    pub async fn run(self) -> Result<(), DaemonError> {
        let lock = StartupLock::acquire(&self.settings.lrs.lock_file).map_err(|err| {
            if err.code() == libc::EEXIST {
                DaemonError::AlreadyRunning(err.message().to_string())
            } else {
                DaemonError::Config(err.to_string())
            }
        })?;

        if let Some(pidfile) = &self.opts.pidfile {
            if let Err(err) = std::fs::write(pidfile, format!("{}\n", std::process::id())) {
                lock.release();
                return Err(DaemonError::Config(format!(
                    "cannot write pidfile '{}': {err}",
                    pidfile.display()
                )));
            }
        }

        let result = self.serve().await;

        if let Some(pidfile) = &self.opts.pidfile {
            let _ = std::fs::remove_file(pidfile);
        }
        lock.release();
        result
    }

    async fn serve(&self) -> Result<(), DaemonError> {
        let owner = LockOwner::local();
        let daemon_running = Arc::new(AtomicBool::new(true));
        let responses = Arc::new(TsQueue::new());
        let shutdown = CancellationToken::new();

        // Lock recovery runs exactly once, before any scheduler acquires
        // devices and before the listener binds: no client is served from
        // an unreconciled state, and no freshly taken lock can be
        // mistaken for a predecessor's.
        let report = reconcile_locks(self.dss.as_ref(), &owner, &self.settings.lrs.families)
            .await
            .map_err(DaemonError::Startup)?;
        if !report.released_own.is_empty() || !report.released_orphans.is_empty() {
            info!(
                own = report.released_own.len(),
                orphans = report.released_orphans.len(),
                "lock table reconciled"
            );
        }

        let mut schedulers = Vec::new();
        let mut queues = HashMap::new();
        let mut total_devices = 0;
        for &family in &self.settings.lrs.families {
            let changer =
                open_changer(family, &self.settings).map_err(DaemonError::Startup)?;
            let scheduler = FamilyScheduler::start(
                family,
                Arc::clone(&self.settings),
                Arc::clone(&self.dss),
                changer,
                DeviceEnv::default_fs_registry(&self.settings),
                Arc::clone(&responses),
                owner.clone(),
                Arc::clone(&daemon_running),
            )
            .await
            .map_err(DaemonError::Startup)?;
            total_devices += scheduler.device_count();
            queues.insert(family, scheduler.incoming());
            schedulers.push(scheduler);
        }
        if total_devices == 0 {
            return Err(DaemonError::NoDevice);
        }

        let listener = Listener::bind(&self.settings.lrs.listen)
            .await
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        let router = Router::new(queues, Arc::clone(&responses));
        let accept_task =
            tokio::spawn(Arc::clone(&router).serve(listener, shutdown.child_token()));
        let pump_task =
            tokio::spawn(Arc::clone(&router).pump_responses(shutdown.child_token()));
        let scheduler_tasks: Vec<_> = schedulers
            .into_iter()
            .map(|s| tokio::spawn(s.run(shutdown.child_token())))
            .collect();

        info!(version = crate::VERSION, "daemon ready");
        wait_for_stop_signal().await;
        info!("stop signal received, shutting down");

        // Workers drain acknowledged work; new allocations are refused.
        daemon_running.store(false, Ordering::Release);
        shutdown.cancel();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT + JOIN_GRACE;
        let mut clean = true;
        for task in scheduler_tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                clean = false;
            }
        }
        accept_task.abort();
        if tokio::time::timeout_at(deadline, pump_task).await.is_err() {
            clean = false;
        }

        if clean {
            info!("daemon stopped");
            Ok(())
        } else {
            error!("shutdown exceeded its deadline");
            Err(DaemonError::UncleanShutdown)
        }
    }
}

/// Parks until SIGTERM or SIGINT.
async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(error = %err, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(int) => int,
        Err(err) => {
            warn!(error = %err, "cannot install SIGINT handler");
            term.recv().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}
