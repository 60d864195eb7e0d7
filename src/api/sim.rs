//! Simulated controllers for tests and the `fleetmon-sim` binary.
//!
//! A [`SimController`] keeps the current set of entities and an append-only
//! log of the deltas that produced them. Watchers replay the full state as
//! their first batch and then follow the log. Connections are counted so
//! callers can check that no controller ever had two monitors attached.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, watch};
use tracing::{debug, trace};

use super::{AllWatcher, ApiError, ControllerApi, Dialer};
use crate::delta::{Delta, Entity, EntityId, EntityKind};
use crate::record::{Controller, EntityPath};

#[derive(Debug, Default)]
struct SimState {
    entities: BTreeMap<EntityId, Entity>,
    log: Vec<Delta>,
    /// Models `model_exists` reports even though no delta mentions them.
    hidden_models: HashSet<String>,
    dial_error: Option<ApiError>,
}

#[derive(Debug)]
struct SimInner {
    state: Mutex<SimState>,
    /// Bumped on every log append and every connection break.
    changed: watch::Sender<u64>,
    /// Incremented to sever every open connection.
    epoch: AtomicU64,
    version: Option<String>,
    live_connections: AtomicUsize,
    peak_connections: AtomicUsize,
    dials: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SimController {
    inner: Arc<SimInner>,
}

impl SimController {
    pub fn new(version: Option<&str>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                changed,
                epoch: AtomicU64::new(0),
                version: version.map(str::to_string),
                live_connections: AtomicUsize::new(0),
                peak_connections: AtomicUsize::new(0),
                dials: AtomicU64::new(0),
            }),
        }
    }

    /// Applies a change to the controller and publishes it to watchers.
    pub async fn apply(&self, delta: Delta) {
        let mut state = self.inner.state.lock().await;
        let id = delta.entity.id();
        if delta.removed {
            state.entities.remove(&id);
        } else {
            state.entities.insert(id, delta.entity.clone());
        }
        state.log.push(delta);
        drop(state);
        self.inner.changed.send_modify(|v| *v += 1);
    }

    pub async fn apply_all(&self, deltas: impl IntoIterator<Item = Delta>) {
        for delta in deltas {
            self.apply(delta).await;
        }
    }

    /// Publishes a delta without changing the controller's state, as a
    /// stream that redelivers would.
    pub async fn redeliver(&self, delta: Delta) {
        self.inner.state.lock().await.log.push(delta);
        self.inner.changed.send_modify(|v| *v += 1);
    }

    /// Makes `model_exists` report the model even though the stream never
    /// mentions it.
    pub async fn hide_model(&self, uuid: &str) {
        self.inner
            .state
            .lock()
            .await
            .hidden_models
            .insert(uuid.to_string());
    }

    /// Sets the error returned by subsequent dials, or clears it.
    pub async fn set_dial_error(&self, err: Option<ApiError>) {
        self.inner.state.lock().await.dial_error = err;
    }

    /// Severs every open connection. Pending and future `next` calls on
    /// existing watchers fail with a connection error.
    pub fn break_connections(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.send_modify(|v| *v += 1);
    }

    pub async fn entities(&self, kind: EntityKind) -> Vec<Entity> {
        let state = self.inner.state.lock().await;
        state
            .entities
            .iter()
            .filter(|(id, _)| id.kind == kind)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn live_connections(&self) -> usize {
        self.inner.live_connections.load(Ordering::SeqCst)
    }

    /// Highest number of connections ever open at the same time.
    pub fn peak_connections(&self) -> usize {
        self.inner.peak_connections.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<Arc<dyn ControllerApi>, ApiError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.state.lock().await.dial_error.clone() {
            return Err(err);
        }
        let live = self.inner.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_connections.fetch_max(live, Ordering::SeqCst);
        Ok(Arc::new(SimConnection {
            inner: Arc::clone(&self.inner),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct SimConnection {
    inner: Arc<SimInner>,
    epoch: u64,
    closed: AtomicBool,
}

impl SimConnection {
    fn check(&self) -> Result<(), ApiError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ApiError::ConnectionFailed("connection is shut down".into()));
        }
        if self.inner.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(ApiError::ConnectionFailed("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerApi for SimConnection {
    fn server_version(&self) -> Option<String> {
        self.inner.version.clone()
    }

    async fn watch_all_models(&self) -> Result<Arc<dyn AllWatcher>, ApiError> {
        self.check()?;
        Ok(Arc::new(SimWatcher {
            inner: Arc::clone(&self.inner),
            epoch: self.epoch,
            position: Mutex::new(None),
            stopped: watch::channel(false).0,
        }))
    }

    async fn model_exists(&self, uuid: &str) -> Result<bool, ApiError> {
        self.check()?;
        let state = self.inner.state.lock().await;
        let id = EntityId {
            kind: EntityKind::Model,
            model_uuid: uuid.to_string(),
            id: String::new(),
        };
        Ok(state.entities.contains_key(&id) || state.hidden_models.contains(uuid))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.live_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
struct SimWatcher {
    inner: Arc<SimInner>,
    epoch: u64,
    /// Log position already delivered; `None` before the first batch.
    position: Mutex<Option<usize>>,
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl AllWatcher for SimWatcher {
    async fn next(&self) -> Result<Vec<Delta>, ApiError> {
        let mut position = self.position.lock().await;
        let mut changed = self.inner.changed.subscribe();
        let mut stopped = self.stopped.subscribe();
        loop {
            if *stopped.borrow_and_update() {
                return Err(ApiError::Stopped);
            }
            if self.inner.epoch.load(Ordering::SeqCst) != self.epoch {
                return Err(ApiError::ConnectionFailed("connection reset".into()));
            }
            changed.borrow_and_update();
            {
                let state = self.inner.state.lock().await;
                match *position {
                    None => {
                        *position = Some(state.log.len());
                        let batch: Vec<Delta> =
                            state.entities.values().cloned().map(Delta::changed).collect();
                        trace!(deltas = batch.len(), "initial batch");
                        return Ok(batch);
                    }
                    Some(pos) if pos < state.log.len() => {
                        *position = Some(state.log.len());
                        return Ok(state.log[pos..].to_vec());
                    }
                    Some(_) => {}
                }
            }
            tokio::select! {
                res = changed.changed() => {
                    if res.is_err() {
                        return Err(ApiError::ConnectionFailed("controller shut down".into()));
                    }
                }
                _ = stopped.changed() => {}
            }
        }
    }

    async fn stop(&self) -> Result<(), ApiError> {
        self.stopped.send_replace(true);
        Ok(())
    }
}

/// Dials [`SimController`]s registered by path.
#[derive(Debug, Default)]
pub struct SimDialer {
    controllers: Mutex<HashMap<EntityPath, SimController>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    dials_started: AtomicU64,
}

impl SimDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn add(&self, path: EntityPath, controller: SimController) {
        self.controllers.lock().await.insert(path, controller);
    }

    pub async fn remove(&self, path: &EntityPath) -> Option<SimController> {
        self.controllers.lock().await.remove(path)
    }

    pub async fn get(&self, path: &EntityPath) -> Option<SimController> {
        self.controllers.lock().await.get(path).cloned()
    }

    /// Makes dials block until [`SimDialer::release_dials`] lets them through.
    pub async fn hold_dials(&self) {
        *self.gate.lock().await = Some(Arc::new(Semaphore::new(0)));
    }

    pub async fn release_dials(&self, n: usize) {
        if let Some(gate) = self.gate.lock().await.as_ref() {
            gate.add_permits(n);
        }
    }

    /// Number of dials that have entered the dialer, held or not.
    pub fn dials_started(&self) -> u64 {
        self.dials_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for SimDialer {
    async fn dial(&self, controller: &Controller) -> Result<Arc<dyn ControllerApi>, ApiError> {
        self.dials_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().await.clone();
        if let Some(gate) = gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(ApiError::ConnectionFailed("dialer closed".into())),
            }
        }
        let sim = self.get(&controller.path).await.ok_or(ApiError::NotFound)?;
        debug!(controller = %controller.path, "sim dial");
        sim.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{ModelUpdate, UnitInfo};
    use std::time::Duration;

    fn model(uuid: &str) -> Entity {
        Entity::Model(ModelUpdate {
            model_uuid: uuid.into(),
            name: format!("model-{uuid}"),
            ..Default::default()
        })
    }

    fn unit(uuid: &str, name: &str) -> Entity {
        Entity::Unit(UnitInfo {
            model_uuid: uuid.into(),
            name: name.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn first_batch_is_current_state_then_log_follows() {
        let sim = SimController::new(Some("3.1.0"));
        sim.apply(Delta::changed(model("m1"))).await;
        sim.apply(Delta::changed(unit("m1", "u/0"))).await;
        sim.apply(Delta::removed(unit("m1", "u/0"))).await;

        let conn = sim.connect().await.unwrap();
        assert_eq!(conn.server_version().as_deref(), Some("3.1.0"));
        let w = conn.watch_all_models().await.unwrap();
        let first = w.next().await.unwrap();
        assert_eq!(first, vec![Delta::changed(model("m1"))]);

        sim.redeliver(Delta::removed(unit("m1", "u/0"))).await;
        let second = w.next().await.unwrap();
        assert_eq!(second, vec![Delta::removed(unit("m1", "u/0"))]);
    }

    #[tokio::test]
    async fn stop_wakes_blocked_next() {
        let sim = SimController::new(None);
        let conn = sim.connect().await.unwrap();
        let w = conn.watch_all_models().await.unwrap();
        w.next().await.unwrap();

        let w2 = Arc::clone(&w);
        let pending = tokio::spawn(async move { w2.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        w.stop().await.unwrap();
        let res = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("next did not wake")
            .unwrap();
        assert_eq!(res, Err(ApiError::Stopped));
    }

    #[tokio::test]
    async fn broken_connection_fails_watchers() {
        let sim = SimController::new(None);
        let conn = sim.connect().await.unwrap();
        let w = conn.watch_all_models().await.unwrap();
        w.next().await.unwrap();
        sim.break_connections();
        assert!(matches!(w.next().await, Err(ApiError::ConnectionFailed(_))));
        assert!(matches!(
            conn.model_exists("m1").await,
            Err(ApiError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn connections_are_counted_until_closed_or_dropped() {
        let sim = SimController::new(None);
        let a = sim.connect().await.unwrap();
        let b = sim.connect().await.unwrap();
        assert_eq!(sim.live_connections(), 2);
        assert_eq!(sim.peak_connections(), 2);
        a.close();
        a.close();
        assert_eq!(sim.live_connections(), 1);
        drop(b);
        assert_eq!(sim.live_connections(), 0);
        assert_eq!(sim.peak_connections(), 2);
    }

    #[tokio::test]
    async fn hidden_models_exist_without_deltas() {
        let sim = SimController::new(None);
        sim.hide_model("m9").await;
        let conn = sim.connect().await.unwrap();
        assert!(conn.model_exists("m9").await.unwrap());
        assert!(!conn.model_exists("m1").await.unwrap());
    }
}
