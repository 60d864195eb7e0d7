//! Per-controller delta watcher.
//!
//! [`ControllerWatcher`] dials the controller, opens its delta stream and
//! folds every batch into a [`WatcherState`]. At the end of each batch the
//! changed aggregates are written back to the store with bounded fan-out,
//! and only once every write has finished is the next batch requested.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, TryStreamExt};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::api::{AllWatcher, ApiError, ControllerApi, Dialer};
use crate::clock::SharedClock;
use crate::delta::{ApplicationInfo, Delta, Entity, EntityId, EntityKind, MachineInfo};
use crate::error::MonitorError;
use crate::lease::controller_error;
use crate::metrics::Metrics;
use crate::record::{
    ApplicationRecord, ControllerStats, EntityCount, EntityPath, Life, MachineRecord, ModelInfo,
};
use crate::settings::MonitorParams;
use crate::shutdown::Shutdown;
use crate::store::{SharedStore, StoreError};

/// What the watcher knows about one model during a watch session.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    /// Latest snapshot from the stream. `None` until the model itself has
    /// been reported.
    pub info: Option<ModelInfo>,
    pub counts: BTreeMap<EntityCount, i64>,
    info_changed: bool,
    counts_changed: bool,
}

impl ModelEntry {
    fn new() -> Self {
        Self {
            info: None,
            counts: [
                (EntityCount::Units, 0),
                (EntityCount::Machines, 0),
                (EntityCount::Applications, 0),
            ]
            .into_iter()
            .collect(),
            // A fresh entry is written out even if nothing else touches it.
            info_changed: true,
            counts_changed: true,
        }
    }

    fn adjust(&mut self, kind: EntityCount, diff: i64) {
        if diff != 0 {
            *self.counts.entry(kind).or_default() += diff;
            self.counts_changed = true;
        }
    }

    fn set_info(&mut self, info: ModelInfo) {
        self.info = Some(info);
        self.info_changed = true;
    }
}

/// A store update produced by one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Stats(ControllerStats),
    /// Set or remove a model. `None` means the model was never reported and
    /// must be confirmed gone before it is deleted.
    ModelInfo {
        uuid: String,
        info: Option<ModelInfo>,
    },
    ModelCounts {
        uuid: String,
        counts: BTreeMap<EntityCount, i64>,
    },
    Machine(MachineInfo),
    Application(ApplicationInfo),
}

/// Working set for one watch session.
///
/// Counters move only when an entity's presence actually flips, so
/// duplicate adds and repeated removals from a redelivering stream are
/// harmless.
#[derive(Debug)]
pub struct WatcherState {
    present: HashSet<EntityId>,
    stats: ControllerStats,
    stats_changed: bool,
    models: BTreeMap<String, ModelEntry>,
    machines: BTreeMap<EntityId, MachineInfo>,
    applications: BTreeMap<EntityId, ApplicationInfo>,
}

impl Default for WatcherState {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherState {
    pub fn new() -> Self {
        Self {
            present: HashSet::new(),
            stats: ControllerStats::default(),
            stats_changed: false,
            models: BTreeMap::new(),
            machines: BTreeMap::new(),
            applications: BTreeMap::new(),
        }
    }

    /// Registers a model already known to the store. Unless the stream
    /// reports it, it will be removed at the end of the first batch.
    pub fn seed_model(&mut self, uuid: &str) {
        self.model(uuid);
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn model_entry(&self, uuid: &str) -> Option<&ModelEntry> {
        self.models.get(uuid)
    }

    /// Number of entities currently marked present.
    pub fn present_count(&self) -> usize {
        self.present.len()
    }

    pub fn apply(&mut self, delta: Delta) {
        trace!(
            removed = delta.removed,
            id = %delta.entity.id(),
            "got delta"
        );
        let diff = self.track_presence(&delta);
        let removed = delta.removed;
        match delta.entity {
            Entity::Model(update) => {
                self.stats.model_count += diff;
                let mut info = update.info();
                if removed {
                    info.life = Life::Dead;
                }
                self.model(&update.model_uuid).set_info(info);
            }
            Entity::Unit(unit) => {
                self.stats.unit_count += diff;
                self.model(&unit.model_uuid)
                    .adjust(EntityCount::Units, diff);
            }
            Entity::Application(mut app) => {
                self.stats.application_count += diff;
                self.model(&app.model_uuid)
                    .adjust(EntityCount::Applications, diff);
                if removed {
                    app.life = Life::Dead;
                }
                let id = EntityId {
                    kind: EntityKind::Application,
                    model_uuid: app.model_uuid.clone(),
                    id: app.name.clone(),
                };
                self.applications.insert(id, app);
            }
            Entity::Machine(mut machine) => {
                self.stats.machine_count += diff;
                self.model(&machine.model_uuid)
                    .adjust(EntityCount::Machines, diff);
                if removed {
                    machine.life = Life::Dead;
                }
                let id = EntityId {
                    kind: EntityKind::Machine,
                    model_uuid: machine.model_uuid.clone(),
                    id: machine.id.clone(),
                };
                self.machines.insert(id, machine);
            }
        }
    }

    /// Collects the writes for everything changed since the last call and
    /// clears the change flags. Repeated snapshots of one machine or
    /// application within the batch collapse to the latest one.
    pub fn take_writes(&mut self) -> Vec<Write> {
        let mut writes = Vec::new();
        if std::mem::take(&mut self.stats_changed) {
            writes.push(Write::Stats(self.stats));
        }
        for (uuid, entry) in self.models.iter_mut() {
            if std::mem::take(&mut entry.info_changed) {
                writes.push(Write::ModelInfo {
                    uuid: uuid.clone(),
                    info: entry.info.clone(),
                });
            }
            if std::mem::take(&mut entry.counts_changed) {
                writes.push(Write::ModelCounts {
                    uuid: uuid.clone(),
                    counts: entry.counts.clone(),
                });
            }
        }
        writes.extend(
            std::mem::take(&mut self.machines)
                .into_values()
                .map(Write::Machine),
        );
        writes.extend(
            std::mem::take(&mut self.applications)
                .into_values()
                .map(Write::Application),
        );
        writes
    }

    fn model(&mut self, uuid: &str) -> &mut ModelEntry {
        self.models
            .entry(uuid.to_string())
            .or_insert_with(ModelEntry::new)
    }

    /// Returns the change to apply to the entity's counters: +1 when it
    /// appears, -1 when it disappears, 0 otherwise.
    fn track_presence(&mut self, delta: &Delta) -> i64 {
        let id = delta.entity.id();
        let diff = if delta.removed {
            if self.present.remove(&id) { -1 } else { 0 }
        } else if self.present.insert(id) {
            1
        } else {
            0
        };
        if diff != 0 {
            self.stats_changed = true;
        }
        diff
    }
}

/// Maps dial-time failures: a controller missing from the store or unknown
/// to the API means it has been removed.
fn dial_store_error(err: StoreError) -> MonitorError {
    controller_error(err)
}

fn dial_api_error(err: ApiError) -> MonitorError {
    match err {
        ApiError::NotFound => MonitorError::ControllerRemoved,
        other => other.into(),
    }
}

/// Watches one controller until shutdown or a terminal error.
pub struct ControllerWatcher {
    store: SharedStore,
    dialer: Arc<dyn Dialer>,
    clock: SharedClock,
    path: EntityPath,
    params: MonitorParams,
    metrics: Option<Metrics>,
}

impl ControllerWatcher {
    pub fn new(
        store: SharedStore,
        dialer: Arc<dyn Dialer>,
        clock: SharedClock,
        path: EntityPath,
        params: MonitorParams,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            store,
            dialer,
            clock,
            path,
            params,
            metrics,
        }
    }

    /// Runs the dial, connect, watch cycle.
    ///
    /// Unreachable controllers are marked unavailable and retried after
    /// `api_connect_retry`. Returns `Dying` on shutdown, a monitoring-stopped
    /// error when the controller is removed, and any other error when the
    /// store misbehaves.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), MonitorError> {
        loop {
            debug!(controller = %self.path, "dialing controller");
            let dial_start = self.clock.now();
            match self.dial(&shutdown).await {
                Ok(conn) => {
                    if let Err(e) = self.connected(conn.as_ref()).await {
                        conn.close();
                        return Err(e);
                    }
                    let err = self.watch(&conn, &shutdown).await;
                    // Evict the connection so the next attempt re-dials.
                    conn.close();
                    match err.cause() {
                        MonitorError::Api(_) | MonitorError::ApiConnection(_) => {
                            info!(controller = %self.path, error = %err, "watch died");
                        }
                        _ => return Err(err),
                    }
                }
                Err(e) if e.is_dying() => return Err(e),
                Err(e) if matches!(e.cause(), MonitorError::ApiConnection(_)) => {
                    self.record_error();
                    self.store
                        .set_controller_unavailable_at(&self.path, dial_start)
                        .await
                        .map_err(|e| MonitorError::from(e).note("cannot set controller availability"))?;
                    error!(controller = %self.path, error = %e, "cannot connect");
                }
                Err(e) => {
                    return Err(e.note(format!("cannot dial API for controller {}", self.path)));
                }
            }
            tokio::select! {
                _ = shutdown.wait() => return Err(MonitorError::Dying),
                _ = self.clock.sleep(self.params.api_connect_retry) => {}
            }
        }
    }

    /// Dials the controller on a task of its own so shutdown can abandon a
    /// dial that does not return. The task works on its own store session,
    /// and a connection it completes after being abandoned is closed.
    async fn dial(&self, shutdown: &Shutdown) -> Result<Arc<dyn ControllerApi>, MonitorError> {
        let session = self.store.clone_session();
        let dialer = Arc::clone(&self.dialer);
        let path = self.path.clone();
        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(
            async move {
                let result = match session.controller(&path).await {
                    Ok(ctl) => dialer.dial(&ctl).await.map_err(dial_api_error),
                    Err(e) => Err(dial_store_error(e)),
                };
                session.close();
                if let Err(Ok(conn)) = tx.send(result) {
                    debug!(controller = %path, "closing connection from abandoned dial");
                    conn.close();
                }
            }
            .in_current_span(),
        );
        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(MonitorError::WorkerLost(format!("dial {}", self.path))),
            },
            _ = shutdown.wait() => {
                rx.close();
                if let Ok(Ok(conn)) = rx.try_recv() {
                    conn.close();
                }
                Err(MonitorError::Dying)
            }
        }
    }

    /// Bookkeeping for a fresh connection. Machine and application records
    /// are cleared; the first batch repopulates the ones that still exist.
    async fn connected(&self, conn: &dyn ControllerApi) -> Result<(), MonitorError> {
        self.store
            .set_controller_available(&self.path)
            .await
            .map_err(|e| MonitorError::from(e).note("cannot set controller availability"))?;
        if let Some(version) = conn.server_version() {
            self.store
                .set_controller_version(&self.path, &version)
                .await
                .map_err(|e| controller_error(e).note("cannot set controller version"))?;
        }
        self.store
            .remove_controller_machines(&self.path)
            .await
            .map_err(|e| MonitorError::from(e).note("cannot remove controller machines"))?;
        self.store
            .remove_controller_applications(&self.path)
            .await
            .map_err(|e| MonitorError::from(e).note("cannot remove controller applications"))?;
        Ok(())
    }

    /// Streams deltas until something fails. Always returns an error.
    async fn watch(&self, conn: &Arc<dyn ControllerApi>, shutdown: &Shutdown) -> MonitorError {
        let watcher = match conn.watch_all_models().await {
            Ok(w) => w,
            Err(e) => {
                self.record_error();
                return MonitorError::from(e).note("cannot watch all models");
            }
        };
        let err = self.watch_batches(conn.as_ref(), &watcher, shutdown).await;
        if let Err(e) = watcher.stop().await {
            debug!(controller = %self.path, error = %e, "cannot stop watcher");
        }
        err
    }

    async fn watch_batches(
        &self,
        conn: &dyn ControllerApi,
        watcher: &Arc<dyn AllWatcher>,
        shutdown: &Shutdown,
    ) -> MonitorError {
        let mut state = WatcherState::new();
        match self.store.model_uuids(&self.path).await {
            Ok(uuids) => {
                for uuid in &uuids {
                    state.seed_model(uuid);
                }
            }
            Err(e) => return MonitorError::from(e).note("cannot get existing model UUIDs"),
        }

        loop {
            if shutdown.is_triggered() {
                return MonitorError::Dying;
            }
            let next = {
                let watcher = Arc::clone(watcher);
                tokio::spawn(async move { watcher.next().await }.in_current_span())
            };
            let deltas = tokio::select! {
                result = next => match result {
                    Ok(Ok(deltas)) => deltas,
                    Ok(Err(e)) => {
                        self.record_error();
                        return MonitorError::from(e).note("watcher error waiting for next event");
                    }
                    Err(e) => return MonitorError::WorkerLost(format!("watcher next: {e}")),
                },
                // The pending `next` is woken by the caller stopping the watcher.
                _ = shutdown.wait() => return MonitorError::Dying,
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_deltas(&self.path.to_string(), deltas.len());
            }
            let count = deltas.len();
            for delta in deltas {
                state.apply(delta);
            }
            debug!(controller = %self.path, deltas = count, "all deltas processed");

            let writes = state.take_writes();
            tokio::select! {
                result = self.commit(conn, writes) => {
                    if let Err(e) = result {
                        return e;
                    }
                }
                _ = shutdown.wait() => return MonitorError::Dying,
            }
        }
    }

    /// Applies one batch of writes with at most `max_concurrent_updates`
    /// store operations in flight.
    async fn commit(&self, conn: &dyn ControllerApi, writes: Vec<Write>) -> Result<(), MonitorError> {
        stream::iter(writes.into_iter().map(Ok))
            .try_for_each_concurrent(self.params.max_concurrent_updates, |write| {
                self.write(conn, write)
            })
            .await
    }

    async fn write(&self, conn: &dyn ControllerApi, write: Write) -> Result<(), MonitorError> {
        match write {
            Write::Stats(stats) => self
                .store
                .set_controller_stats(&self.path, &stats)
                .await
                .map_err(|e| controller_error(e).note("cannot set controller stats")),
            Write::ModelInfo { uuid, info } => {
                let Some(info) = info else {
                    // Not reported since the watch started. The first batch
                    // should be exhaustive, but confirm before deleting.
                    if conn.model_exists(&uuid).await? {
                        warn!(
                            controller = %self.path,
                            uuid = %uuid,
                            "model exists but did not appear in first watcher delta"
                        );
                        return Ok(());
                    }
                    return self.delete_model(&uuid).await;
                };
                if info.life == Life::Dead {
                    return self.delete_model(&uuid).await;
                }
                self.store
                    .set_model_info(&self.path, &uuid, &info)
                    .await
                    .map_err(|e| MonitorError::from(e).note("cannot update model info"))
            }
            Write::ModelCounts { uuid, counts } => {
                match self
                    .store
                    .update_model_counts(&self.path, &uuid, &counts, self.clock.now())
                    .await
                {
                    // Some models, such as the controller model, have no record.
                    Ok(()) | Err(StoreError::NotFound) => Ok(()),
                    Err(e) => Err(MonitorError::from(e).note("cannot update model counts")),
                }
            }
            Write::Machine(info) => {
                let record = MachineRecord {
                    controller: self.path.clone(),
                    info,
                };
                self.store
                    .update_machine_info(&record)
                    .await
                    .map_err(|e| MonitorError::from(e).note("cannot update machine info"))
            }
            Write::Application(info) => {
                let record = ApplicationRecord {
                    controller: self.path.clone(),
                    info,
                };
                self.store
                    .update_application_info(&record)
                    .await
                    .map_err(|e| MonitorError::from(e).note("cannot update application info"))
            }
        }
    }

    async fn delete_model(&self, uuid: &str) -> Result<(), MonitorError> {
        debug!(controller = %self.path, uuid, "deleting model");
        self.store
            .delete_model(&self.path, uuid)
            .await
            .map_err(|e| MonitorError::from(e).note("cannot delete model"))
    }

    fn record_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_monitor_error(&self.path.to_string());
        }
    }
}
