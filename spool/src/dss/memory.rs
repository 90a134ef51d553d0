//! In-memory reference implementation of the DSS gateway.
//!
//! Used by the test suite and by `dir`-family deployments running without
//! an external metadata store. The whole store sits behind one mutex; no
//! call awaits while holding it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{CodedError, OpResult};
use crate::types::{
    AdmStatus, DeviceInfo, Family, LockKind, LockOwner, LockRecord, MediumId, MediumInfo,
};

use super::{DssGateway, OperationLog};

#[derive(Default)]
struct Store {
    devices: HashMap<String, DeviceInfo>,
    media: HashMap<MediumId, MediumInfo>,
    locks: HashMap<(LockKind, String), LockRecord>,
    logs: Vec<OperationLog>,
}

/// A metadata store living entirely in process memory.
#[derive(Default)]
pub struct MemoryDss {
    store: Mutex<Store>,
}

impl MemoryDss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a device row. Test and bootstrap helper.
    pub fn insert_device(&self, device: DeviceInfo) {
        self.store.lock().devices.insert(device.id.clone(), device);
    }

    /// Seeds a medium row. Test and bootstrap helper.
    pub fn insert_medium(&self, medium: MediumInfo) {
        self.store.lock().media.insert(medium.id.clone(), medium);
    }

    /// Seeds a lock row verbatim, bypassing holder checks. Test helper.
    pub fn insert_lock(&self, record: LockRecord) {
        self.store
            .lock()
            .locks
            .insert((record.kind, record.id.clone()), record);
    }

    /// Snapshot of the persisted operation logs. Test helper.
    pub fn logs(&self) -> Vec<OperationLog> {
        self.store.lock().logs.clone()
    }
}

#[async_trait]
impl DssGateway for MemoryDss {
    async fn list_devices(
        &self,
        family: Family,
        host: Option<&str>,
    ) -> OpResult<Vec<DeviceInfo>> {
        let store = self.store.lock();
        Ok(store
            .devices
            .values()
            .filter(|d| d.family == family && host.map(|h| d.host == h).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_device(&self, family: Family, serial: &str) -> OpResult<Option<DeviceInfo>> {
        let store = self.store.lock();
        Ok(store
            .devices
            .get(serial)
            .filter(|d| d.family == family)
            .cloned())
    }

    async fn update_device_adm_status(&self, serial: &str, status: AdmStatus) -> OpResult<()> {
        let mut store = self.store.lock();
        let device = store
            .devices
            .get_mut(serial)
            .ok_or_else(|| CodedError::no_entry(format!("no device '{serial}'")))?;
        device.adm_status = status;
        Ok(())
    }

    async fn list_media(&self, family: Family) -> OpResult<Vec<MediumInfo>> {
        let store = self.store.lock();
        Ok(store
            .media
            .values()
            .filter(|m| m.id.family == family)
            .cloned()
            .collect())
    }

    async fn get_medium(&self, id: &MediumId) -> OpResult<Option<MediumInfo>> {
        Ok(self.store.lock().media.get(id).cloned())
    }

    async fn update_medium(&self, medium: &MediumInfo) -> OpResult<()> {
        let mut store = self.store.lock();
        if !store.media.contains_key(&medium.id) {
            return Err(CodedError::no_entry(format!("no medium '{}'", medium.id)));
        }
        store.media.insert(medium.id.clone(), medium.clone());
        Ok(())
    }

    async fn lock(&self, kind: LockKind, id: &str, owner: &LockOwner) -> OpResult<()> {
        let mut store = self.store.lock();
        let key = (kind, id.to_string());
        if let Some(existing) = store.locks.get(&key) {
            return Err(CodedError::exists(format!(
                "{kind} lock on '{id}' already held by {}:{}",
                existing.owner.hostname, existing.owner.pid
            )));
        }
        store.locks.insert(
            key,
            LockRecord {
                kind,
                id: id.to_string(),
                owner: owner.clone(),
                taken_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn unlock(&self, kind: LockKind, id: &str, owner: &LockOwner) -> OpResult<()> {
        let mut store = self.store.lock();
        let key = (kind, id.to_string());
        match store.locks.get(&key) {
            None => Err(CodedError::no_entry(format!("no {kind} lock on '{id}'"))),
            Some(existing) if existing.owner != *owner => Err(CodedError::new(
                libc::EACCES,
                format!(
                    "{kind} lock on '{id}' held by {}:{}, not by {}:{}",
                    existing.owner.hostname, existing.owner.pid, owner.hostname, owner.pid
                ),
            )),
            Some(_) => {
                store.locks.remove(&key);
                Ok(())
            }
        }
    }

    async fn force_unlock(&self, kind: LockKind, id: &str) -> OpResult<()> {
        let mut store = self.store.lock();
        store
            .locks
            .remove(&(kind, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| CodedError::no_entry(format!("no {kind} lock on '{id}'")))
    }

    async fn list_locks(&self, kind: LockKind) -> OpResult<Vec<LockRecord>> {
        let store = self.store.lock();
        Ok(store
            .locks
            .values()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect())
    }

    async fn lock_of(&self, kind: LockKind, id: &str) -> OpResult<Option<LockRecord>> {
        Ok(self
            .store
            .lock()
            .locks
            .get(&(kind, id.to_string()))
            .cloned())
    }

    async fn emit_log(&self, log: OperationLog) -> OpResult<()> {
        self.store.lock().logs.push(log);
        Ok(())
    }
}
