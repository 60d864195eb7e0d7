//! In-memory [`Store`] used by tests and the simulator.
//!
//! All sessions cloned from one `MemoryStore` share the same data. The store
//! keeps count of open sessions so tests can check that every session a
//! monitor opened was also closed, and it can be told to fail every call to
//! simulate a broken database connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::trace;

use super::{Store, StoreError};
use crate::clock::truncate_millis;
use crate::record::{
    ApplicationRecord, Controller, ControllerStats, EntityCount, EntityPath, Life, MachineRecord,
    Model, ModelInfo,
};

type ModelKey = (EntityPath, String);
type ChildKey = (EntityPath, String, String);

#[derive(Debug, Default)]
struct Data {
    controllers: BTreeMap<EntityPath, Controller>,
    models: BTreeMap<ModelKey, Model>,
    machines: BTreeMap<ChildKey, MachineRecord>,
    applications: BTreeMap<ChildKey, ApplicationRecord>,
}

#[derive(Debug, Default)]
struct Shared {
    data: Mutex<Data>,
    failure: Mutex<Option<String>>,
    open_sessions: AtomicUsize,
    lease_calls: AtomicU64,
}

#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            closed: AtomicBool::new(false),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of sessions that have been opened and not yet closed,
    /// including this one.
    pub fn open_sessions(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }

    /// Number of lease compare-and-swap calls made through any session.
    pub fn lease_calls(&self) -> u64 {
        self.shared.lease_calls.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with a backend error, or restores
    /// normal operation when `None`.
    pub async fn set_failure(&self, message: Option<&str>) {
        *self.shared.failure.lock().await = message.map(str::to_string);
    }

    pub async fn insert_controller(&self, controller: Controller) {
        let mut data = self.shared.data.lock().await;
        data.controllers
            .insert(controller.path.clone(), controller);
    }

    /// Removes a controller and everything recorded for it.
    pub async fn remove_controller(&self, path: &EntityPath) {
        let mut data = self.shared.data.lock().await;
        data.controllers.remove(path);
        data.models.retain(|(ctl, _), _| ctl != path);
        data.machines.retain(|(ctl, _, _), _| ctl != path);
        data.applications.retain(|(ctl, _, _), _| ctl != path);
    }

    pub async fn get_controller(&self, path: &EntityPath) -> Option<Controller> {
        self.shared.data.lock().await.controllers.get(path).cloned()
    }

    pub async fn get_model(&self, controller: &EntityPath, uuid: &str) -> Option<Model> {
        let key = (controller.clone(), uuid.to_string());
        self.shared.data.lock().await.models.get(&key).cloned()
    }

    pub async fn machines(&self, controller: &EntityPath) -> Vec<MachineRecord> {
        let data = self.shared.data.lock().await;
        data.machines
            .iter()
            .filter(|((ctl, _, _), _)| ctl == controller)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn applications(&self, controller: &EntityPath) -> Vec<ApplicationRecord> {
        let data = self.shared.data.lock().await;
        data.applications
            .iter()
            .filter(|((ctl, _, _), _)| ctl == controller)
            .map(|(_, a)| a.clone())
            .collect()
    }

    async fn check(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("session closed".to_string()));
        }
        if let Some(msg) = self.shared.failure.lock().await.as_ref() {
            return Err(StoreError::Backend(msg.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn clone_session(&self) -> Arc<dyn Store> {
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryStore {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn controller(&self, path: &EntityPath) -> Result<Controller, StoreError> {
        self.check().await?;
        self.get_controller(path).await.ok_or(StoreError::NotFound)
    }

    async fn all_controllers(&self) -> Result<Vec<Controller>, StoreError> {
        self.check().await?;
        let data = self.shared.data.lock().await;
        Ok(data.controllers.values().cloned().collect())
    }

    async fn acquire_monitor_lease(
        &self,
        path: &EntityPath,
        old_expiry: Option<DateTime<Utc>>,
        old_owner: &str,
        new_expiry: Option<DateTime<Utc>>,
        new_owner: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check().await?;
        self.shared.lease_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = self.shared.data.lock().await;
        let ctl = data
            .controllers
            .get_mut(path)
            .ok_or(StoreError::NotFound)?;
        if ctl.lease_owner != old_owner || ctl.lease_expiry != old_expiry.map(truncate_millis) {
            trace!(
                controller = %path,
                owner = %ctl.lease_owner,
                expected_owner = old_owner,
                "lease compare-and-swap mismatch"
            );
            return Err(StoreError::LeaseUnavailable {
                owner: ctl.lease_owner.clone(),
                expiry: ctl.lease_expiry,
            });
        }
        if new_owner.is_empty() {
            ctl.lease_owner.clear();
            ctl.lease_expiry = None;
            return Ok(None);
        }
        ctl.lease_owner = new_owner.to_string();
        ctl.lease_expiry = new_expiry.map(truncate_millis);
        Ok(ctl.lease_expiry)
    }

    async fn set_controller_stats(
        &self,
        path: &EntityPath,
        stats: &ControllerStats,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let ctl = data
            .controllers
            .get_mut(path)
            .ok_or(StoreError::NotFound)?;
        ctl.stats = *stats;
        Ok(())
    }

    async fn set_controller_available(&self, path: &EntityPath) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        if let Some(ctl) = data.controllers.get_mut(path) {
            ctl.unavailable_since = None;
        }
        Ok(())
    }

    async fn set_controller_unavailable_at(
        &self,
        path: &EntityPath,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        if let Some(ctl) = data.controllers.get_mut(path) {
            if ctl.unavailable_since.is_none() {
                ctl.unavailable_since = Some(truncate_millis(at));
            }
        }
        Ok(())
    }

    async fn set_controller_version(
        &self,
        path: &EntityPath,
        version: &str,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let ctl = data
            .controllers
            .get_mut(path)
            .ok_or(StoreError::NotFound)?;
        ctl.version = Some(version.to_string());
        Ok(())
    }

    async fn model(&self, controller: &EntityPath, uuid: &str) -> Result<Model, StoreError> {
        self.check().await?;
        self.get_model(controller, uuid)
            .await
            .ok_or(StoreError::NotFound)
    }

    async fn insert_model(&self, model: Model) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let key = (model.controller.clone(), model.uuid.clone());
        if data.models.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        data.models.insert(key, model);
        Ok(())
    }

    async fn delete_model(&self, controller: &EntityPath, uuid: &str) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        data.models.remove(&(controller.clone(), uuid.to_string()));
        Ok(())
    }

    async fn model_uuids(&self, controller: &EntityPath) -> Result<Vec<String>, StoreError> {
        self.check().await?;
        let data = self.shared.data.lock().await;
        Ok(data
            .models
            .keys()
            .filter(|(ctl, _)| ctl == controller)
            .map(|(_, uuid)| uuid.clone())
            .collect())
    }

    async fn set_model_info(
        &self,
        controller: &EntityPath,
        uuid: &str,
        info: &ModelInfo,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        if let Some(model) = data.models.get_mut(&(controller.clone(), uuid.to_string())) {
            model.info = Some(info.clone());
        }
        Ok(())
    }

    async fn update_model_counts(
        &self,
        controller: &EntityPath,
        uuid: &str,
        counts: &BTreeMap<EntityCount, i64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let model = data
            .models
            .get_mut(&(controller.clone(), uuid.to_string()))
            .ok_or(StoreError::NotFound)?;
        let now = truncate_millis(now);
        for (kind, n) in counts {
            model.counts.entry(*kind).or_default().update(*n, now);
        }
        Ok(())
    }

    async fn update_machine_info(&self, machine: &MachineRecord) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let key = (
            machine.controller.clone(),
            machine.info.model_uuid.clone(),
            machine.info.id.clone(),
        );
        if machine.info.life == Life::Dead {
            data.machines.remove(&key);
        } else if data
            .models
            .contains_key(&(key.0.clone(), key.1.clone()))
        {
            data.machines.insert(key, machine.clone());
        }
        Ok(())
    }

    async fn update_application_info(&self, app: &ApplicationRecord) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        let key = (
            app.controller.clone(),
            app.info.model_uuid.clone(),
            app.info.name.clone(),
        );
        if app.info.life == Life::Dead {
            data.applications.remove(&key);
        } else if data
            .models
            .contains_key(&(key.0.clone(), key.1.clone()))
        {
            data.applications.insert(key, app.clone());
        }
        Ok(())
    }

    async fn remove_controller_machines(&self, controller: &EntityPath) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        data.machines.retain(|(ctl, _, _), _| ctl != controller);
        Ok(())
    }

    async fn remove_controller_applications(
        &self,
        controller: &EntityPath,
    ) -> Result<(), StoreError> {
        self.check().await?;
        let mut data = self.shared.data.lock().await;
        data.applications.retain(|(ctl, _, _), _| ctl != controller);
        Ok(())
    }
}
