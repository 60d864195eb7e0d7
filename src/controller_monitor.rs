//! Monitoring of a single controller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span};

use crate::api::Dialer;
use crate::clock::SharedClock;
use crate::error::MonitorError;
use crate::lease::LeaseUpdater;
use crate::metrics::Metrics;
use crate::record::EntityPath;
use crate::settings::MonitorParams;
use crate::shutdown::Shutdown;
use crate::store::SharedStore;
use crate::watcher::ControllerWatcher;
use crate::worker::WorkerHandle;

/// Collaborators and settings shared by every monitor an agent runs.
#[derive(Clone)]
pub struct MonitorEnv {
    pub store: SharedStore,
    pub dialer: Arc<dyn Dialer>,
    pub clock: SharedClock,
    /// Lease owner id of this agent.
    pub owner: String,
    pub params: MonitorParams,
    pub metrics: Option<Metrics>,
}

impl MonitorEnv {
    /// Same environment on a different store session.
    pub fn with_store(&self, store: SharedStore) -> Self {
        Self {
            store,
            ..self.clone()
        }
    }
}

/// Runs a lease updater and a watcher for one controller whose lease has
/// already been acquired.
///
/// The two tasks share one shutdown signal. When either ends, the other is
/// told to stop; the monitor's status is the first error that is not a
/// plain shutdown.
pub struct ControllerMonitor;

impl ControllerMonitor {
    pub fn start(
        env: &MonitorEnv,
        path: EntityPath,
        lease_expiry: Option<DateTime<Utc>>,
    ) -> WorkerHandle {
        let span = info_span!("controller_monitor", controller = %path);
        let env = env.clone();
        WorkerHandle::spawn(path.to_string(), span, move |shutdown| {
            run(env, path, lease_expiry, shutdown)
        })
    }
}

async fn run(
    env: MonitorEnv,
    path: EntityPath,
    lease_expiry: Option<DateTime<Utc>>,
    shutdown: Shutdown,
) -> Result<(), MonitorError> {
    let _running = env.metrics.as_ref().map(Metrics::monitor_running);
    let updater = LeaseUpdater::new(
        Arc::clone(&env.store),
        Arc::clone(&env.clock),
        path.clone(),
        env.owner.clone(),
        lease_expiry,
        env.params,
    );
    let watcher = ControllerWatcher::new(
        Arc::clone(&env.store),
        Arc::clone(&env.dialer),
        Arc::clone(&env.clock),
        path.clone(),
        env.params,
        env.metrics.clone(),
    );

    let mut tasks = JoinSet::new();
    tasks.spawn(updater.run(shutdown.clone()).in_current_span());
    tasks.spawn(watcher.run(shutdown.clone()).in_current_span());

    let mut status: Option<MonitorError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .unwrap_or_else(|e| Err(MonitorError::WorkerLost(format!("{path}: {e}"))));
        shutdown.trigger();
        if let Err(e) = result {
            debug!(error = %e, "controller monitor task finished");
            match &status {
                None => status = Some(e),
                Some(prev) if prev.is_dying() && !e.is_dying() => status = Some(e),
                Some(_) => {}
            }
        }
    }
    match status {
        Some(e) => Err(e),
        None => Err(MonitorError::Dying),
    }
}
