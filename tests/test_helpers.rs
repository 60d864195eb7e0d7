#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetmon::api::{SimController, SimDialer};
use fleetmon::clock::VirtualClock;
use fleetmon::controller_monitor::MonitorEnv;
use fleetmon::delta::{ApplicationInfo, Delta, Entity, MachineInfo, ModelUpdate, UnitInfo};
use fleetmon::record::{Controller, EntityPath, Model};
use fleetmon::settings::MonitorParams;
use fleetmon::store::{MemoryStore, Store};

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_600_000_000, 0).expect("valid timestamp")
}

pub fn secs(n: i64) -> chrono::TimeDelta {
    chrono::TimeDelta::seconds(n)
}

/// Asserts a lease expiry within a few milliseconds of `expected`; timer
/// wakeups may land on the next millisecond tick.
pub fn assert_expiry_near(actual: Option<DateTime<Utc>>, expected: DateTime<Utc>) {
    let actual = actual.expect("lease expiry");
    let skew = (actual - expected).num_milliseconds();
    assert!((0..5).contains(&skew), "expiry {actual}, expected {expected}");
}

pub fn ctl_path(name: &str) -> EntityPath {
    EntityPath::new("bob", name)
}

/// Shared store, simulated fleet and virtual clock for one test.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub dialer: Arc<SimDialer>,
    pub clock: Arc<VirtualClock>,
}

impl Fixture {
    /// Must be called inside a paused tokio runtime.
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new_arc(),
            dialer: SimDialer::new_arc(),
            clock: VirtualClock::new_arc(epoch()),
        }
    }

    pub async fn add_controller(&self, name: &str) -> (EntityPath, SimController) {
        let path = ctl_path(name);
        self.store
            .insert_controller(Controller::new(path.clone(), format!("{name}-uuid")))
            .await;
        let sim = SimController::new(Some("3.1.0"));
        self.dialer.add(path.clone(), sim.clone()).await;
        (path, sim)
    }

    /// Adds a model to both the store and the simulated controller.
    pub async fn add_model(&self, path: &EntityPath, sim: &SimController, uuid: &str) {
        self.store
            .insert_model(Model::new(path.clone(), uuid, format!("model-{uuid}")))
            .await
            .expect("insert model");
        sim.apply(Delta::changed(model(uuid))).await;
    }

    /// Polls the controller record until `check` holds and returns it.
    pub async fn wait_controller(
        &self,
        path: &EntityPath,
        what: &str,
        check: impl Fn(&Controller) -> bool,
    ) -> Controller {
        for _ in 0..2000 {
            if let Some(ctl) = self.store.get_controller(path).await {
                if check(&ctl) {
                    return ctl;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller {path} never matched: {what}");
    }

    pub async fn controller(&self, path: &EntityPath) -> Controller {
        self.store
            .get_controller(path)
            .await
            .expect("controller exists")
    }

    pub fn env(&self, owner: &str) -> MonitorEnv {
        MonitorEnv {
            store: self.store.clone(),
            dialer: self.dialer.clone(),
            clock: self.clock.clone(),
            owner: owner.to_string(),
            params: MonitorParams::default(),
            metrics: None,
        }
    }
}

pub fn model(uuid: &str) -> Entity {
    Entity::Model(ModelUpdate {
        model_uuid: uuid.into(),
        name: format!("model-{uuid}"),
        ..Default::default()
    })
}

pub fn unit(uuid: &str, name: &str) -> Entity {
    Entity::Unit(UnitInfo {
        model_uuid: uuid.into(),
        name: name.into(),
        application: name.split('/').next().unwrap_or_default().into(),
        ..Default::default()
    })
}

pub fn machine(uuid: &str, id: &str) -> Entity {
    Entity::Machine(MachineInfo {
        model_uuid: uuid.into(),
        id: id.into(),
        series: "jammy".into(),
        ..Default::default()
    })
}

pub fn application(uuid: &str, name: &str) -> Entity {
    Entity::Application(ApplicationInfo {
        model_uuid: uuid.into(),
        name: name.into(),
        ..Default::default()
    })
}

/// Polls `check` in small virtual-time steps until it holds. Panics after
/// ten seconds of virtual time.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}

/// Lets every runnable task finish its current work. Timers further out
/// than 100ms of virtual time do not fire.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
