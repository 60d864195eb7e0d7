//! Supervised workers.
//!
//! A worker is a spawned task with its own [`Shutdown`] signal. The handle
//! can ask it to stop (`kill`), observe that it has finished (`dead`) and
//! fetch its final status (`wait`). Any number of clones may wait; all of
//! them see the same status.

use std::future::Future;

use tokio::sync::watch;
use tracing::Instrument;

use crate::error::MonitorError;
use crate::shutdown::Shutdown;

type Status = Option<Result<(), MonitorError>>;

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    name: String,
    shutdown: Shutdown,
    status: watch::Receiver<Status>,
}

impl WorkerHandle {
    /// Spawns `run` on the runtime. The closure receives the worker's
    /// shutdown signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, span: tracing::Span, run: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = Result<(), MonitorError>> + Send + 'static,
    {
        let shutdown = Shutdown::new();
        let (tx, status) = watch::channel(None);
        let fut = run(shutdown.clone());
        tokio::spawn(
            async move {
                let result = fut.await;
                tx.send_replace(Some(result));
            }
            .instrument(span),
        );
        Self {
            name: name.into(),
            shutdown,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests cooperative shutdown. Does not wait.
    pub fn kill(&self) {
        self.shutdown.trigger();
    }

    pub fn is_dead(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Resolves once the worker has finished.
    pub async fn dead(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(Option::is_some).await;
    }

    /// Waits for the worker to finish and returns its status. A worker that
    /// stopped because it was killed reports `Ok`.
    pub async fn wait(&self) -> Result<(), MonitorError> {
        let mut status = self.status.clone();
        let result = match status.wait_for(Option::is_some).await {
            Ok(status) => status.clone(),
            Err(_) => None,
        };
        match result {
            Some(Err(e)) if e.is_dying() => Ok(()),
            Some(result) => result,
            None => Err(MonitorError::WorkerLost(self.name.clone())),
        }
    }
}
