//! The scheduler's set of device workers.
//!
//! The set owns the devices and their worker tasks; workers and dispatch
//! reach devices through the shared registry handle, never owning them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{CodedError, OpResult};
use crate::types::{AdmStatus, DeviceInfo, Family, LockKind};

use super::env::{DeviceEnv, DeviceRegistry};
use super::state::Device;
use super::worker::DeviceWorker;

/// Set of device workers managed by one family scheduler.
pub struct DeviceSet {
    registry: DeviceRegistry,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl DeviceSet {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self {
            registry,
            tasks: Vec::new(),
        }
    }

    /// Loads every unlocked device of `family` assigned to this host and
    /// spawns their workers. Returns how many devices came up.
    pub async fn load_from_dss(&mut self, env: &Arc<DeviceEnv>, family: Family) -> OpResult<usize> {
        let rows = env
            .dss
            .list_devices(family, Some(&env.owner.hostname))
            .await?;
        let mut started = 0;
        for info in rows {
            if info.adm_status != AdmStatus::Unlocked {
                info!(
                    device = %info.id, status = ?info.adm_status,
                    "skipping device not in unlocked state"
                );
                continue;
            }
            match self.add(env, info).await {
                Ok(()) => started += 1,
                Err(err) => warn!(error = %err, "cannot start device"),
            }
        }
        Ok(started)
    }

    /// Locks a device row and spawns its worker.
    pub async fn add(&mut self, env: &Arc<DeviceEnv>, info: DeviceInfo) -> OpResult<()> {
        env.dss
            .lock(LockKind::Device, &info.id, &env.owner)
            .await
            .map_err(|err| {
                CodedError::new(
                    err.code(),
                    format!("device '{}' is owned elsewhere: {}", info.id, err.message()),
                )
            })?;

        let technology = match (&info.family, &info.model) {
            (Family::Tape, Some(model)) => {
                let techno = env.settings.tape_model.techno_of_model(model);
                if techno.is_none() {
                    warn!(
                        device = %info.id, model = %model,
                        "drive model has no technology mapping"
                    );
                }
                techno.map(str::to_string)
            }
            _ => None,
        };

        let serial = info.id.clone();
        info!(device = %serial, path = %info.path.display(), "starting device worker");
        let device = Device::new(info, technology);
        self.registry
            .write()
            .insert(serial.clone(), Arc::clone(&device));
        let handle = DeviceWorker::spawn(device, Arc::clone(env));
        self.tasks.push((serial, handle));
        Ok(())
    }

    /// Signals one device to stop and waits for its worker.
    pub async fn remove(&mut self, serial: &str, reason: i32) -> OpResult<()> {
        let device = self
            .registry
            .write()
            .remove(serial)
            .ok_or_else(|| CodedError::no_entry(format!("no device '{serial}'")))?;
        device.thread.signal_stop(reason);
        if let Some(pos) = self.tasks.iter().position(|(s, _)| s == serial) {
            let (_, handle) = self.tasks.swap_remove(pos);
            let _ = handle.await;
        }
        Ok(())
    }

    pub fn get(&self, serial: &str) -> Option<Arc<Device>> {
        self.registry.read().get(serial).cloned()
    }

    /// Devices in registration order is not guaranteed by the registry;
    /// dispatch sorts by serial for deterministic scans.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.registry.read().values().cloned().collect();
        devices.sort_by(|a, b| a.serial.cmp(&b.serial));
        devices
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Signals every worker to stop; they drain their pending work first.
    pub fn stop_all(&self, reason: i32) {
        for device in self.registry.read().values() {
            device.thread.signal_stop(reason);
        }
    }

    /// Waits for every worker, bounded by `deadline`. Returns false when
    /// some worker outlived it.
    pub async fn join_all(&mut self, deadline: Instant) -> bool {
        let mut clean = true;
        for (serial, handle) in self.tasks.drain(..) {
            let now = Instant::now();
            let left = deadline.saturating_duration_since(now);
            if left == Duration::ZERO {
                warn!(device = %serial, "shutdown deadline reached, abandoning worker");
                handle.abort();
                clean = false;
                continue;
            }
            match tokio::time::timeout(left, handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(device = %serial, "worker did not stop in time");
                    clean = false;
                }
            }
        }
        clean
    }
}
