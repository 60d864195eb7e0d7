//! Persistent store interface.
//!
//! The monitor only ever talks to storage through [`Store`]. Each dialing
//! task works on its own session obtained from [`Store::clone_session`], so
//! closing one session never disturbs an operation running on another.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{
    ApplicationRecord, Controller, ControllerStats, EntityCount, EntityPath, MachineRecord, Model,
    ModelInfo,
};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error(
        "controller has lease taken out by {owner:?} expiring at {}",
        format_expiry(.expiry)
    )]
    LeaseUnavailable {
        owner: String,
        expiry: Option<DateTime<Utc>>,
    },
    #[error("store error: {0}")]
    Backend(String),
}

fn format_expiry(expiry: &Option<DateTime<Utc>>) -> String {
    match expiry {
        Some(t) => t.to_rfc3339(),
        None => "never".to_string(),
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Returns an independent session onto the same data.
    fn clone_session(&self) -> Arc<dyn Store>;

    /// Closes this session. Later calls on it fail.
    fn close(&self);

    async fn controller(&self, path: &EntityPath) -> Result<Controller, StoreError>;

    async fn all_controllers(&self) -> Result<Vec<Controller>, StoreError>;

    /// Atomically replaces the controller's lease fields if they currently
    /// hold exactly `(old_expiry, old_owner)`.
    ///
    /// An empty `new_owner` releases the lease, clearing both fields, and
    /// returns `None`. Otherwise the stored expiry is returned. Fails with
    /// `NotFound` when the controller does not exist and with
    /// `LeaseUnavailable` when the stored lease differs from the expected one.
    async fn acquire_monitor_lease(
        &self,
        path: &EntityPath,
        old_expiry: Option<DateTime<Utc>>,
        old_owner: &str,
        new_expiry: Option<DateTime<Utc>>,
        new_owner: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Fails with `NotFound` when the controller does not exist.
    async fn set_controller_stats(
        &self,
        path: &EntityPath,
        stats: &ControllerStats,
    ) -> Result<(), StoreError>;

    /// Clears the unavailable-since time. A missing controller is not an error.
    async fn set_controller_available(&self, path: &EntityPath) -> Result<(), StoreError>;

    /// Records that the controller has been unreachable since `at`, unless an
    /// earlier time is already recorded. A missing controller is not an error.
    async fn set_controller_unavailable_at(
        &self,
        path: &EntityPath,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_controller_version(
        &self,
        path: &EntityPath,
        version: &str,
    ) -> Result<(), StoreError>;

    async fn model(&self, controller: &EntityPath, uuid: &str) -> Result<Model, StoreError>;

    async fn insert_model(&self, model: Model) -> Result<(), StoreError>;

    /// Deletes the model if present.
    async fn delete_model(&self, controller: &EntityPath, uuid: &str) -> Result<(), StoreError>;

    async fn model_uuids(&self, controller: &EntityPath) -> Result<Vec<String>, StoreError>;

    /// Sets the info of an existing model. A missing model is not an error.
    async fn set_model_info(
        &self,
        controller: &EntityPath,
        uuid: &str,
        info: &ModelInfo,
    ) -> Result<(), StoreError>;

    /// Folds the current values into the model's count history at `now`.
    /// Kinds not mentioned are left alone. Fails with `NotFound` when the
    /// model does not exist.
    async fn update_model_counts(
        &self,
        controller: &EntityPath,
        uuid: &str,
        counts: &BTreeMap<EntityCount, i64>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Upserts a machine record, or removes it when its life is dead.
    async fn update_machine_info(&self, machine: &MachineRecord) -> Result<(), StoreError>;

    /// Upserts an application record, or removes it when its life is dead.
    async fn update_application_info(&self, app: &ApplicationRecord) -> Result<(), StoreError>;

    async fn remove_controller_machines(&self, controller: &EntityPath) -> Result<(), StoreError>;

    async fn remove_controller_applications(
        &self,
        controller: &EntityPath,
    ) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn Store>;
