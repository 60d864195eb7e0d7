//! Controller API client interface.

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::delta::Delta;
use crate::record::Controller;

pub use sim::{SimController, SimDialer};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The controller could not be reached. Retried by the caller.
    #[error("cannot connect to API: {0}")]
    ConnectionFailed(String),
    #[error("not found")]
    NotFound,
    #[error("watcher was stopped")]
    Stopped,
    #[error("{0}")]
    Other(String),
}

/// Opens connections to controllers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, controller: &Controller) -> Result<Arc<dyn ControllerApi>, ApiError>;
}

/// A live connection to one controller.
#[async_trait]
pub trait ControllerApi: Send + Sync + 'static {
    /// Version reported by the controller when the connection was made.
    fn server_version(&self) -> Option<String>;

    /// Opens a stream of every change to every model on the controller. The
    /// first batch describes the complete current state.
    async fn watch_all_models(&self) -> Result<Arc<dyn AllWatcher>, ApiError>;

    async fn model_exists(&self, uuid: &str) -> Result<bool, ApiError>;

    /// Closes the connection. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait AllWatcher: Send + Sync + 'static {
    /// Blocks until at least one delta is available. Returns
    /// `ApiError::Stopped` once [`AllWatcher::stop`] has been called.
    async fn next(&self) -> Result<Vec<Delta>, ApiError>;

    async fn stop(&self) -> Result<(), ApiError>;
}
