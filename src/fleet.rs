//! Fleet-wide supervision.
//!
//! [`FleetSupervisor`] periodically lists every controller, takes the lease
//! on any that nobody else holds, and runs a [`ControllerMonitor`] for each
//! lease it wins. [`Agent`] keeps a supervisor running, replacing it with a
//! fresh one on a fresh store session after a fatal error.

use std::collections::HashMap;

use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::clock::add_duration;
use crate::controller_monitor::{ControllerMonitor, MonitorEnv};
use crate::error::{MonitorError, quiet_exit};
use crate::lease::acquire_lease;
use crate::record::EntityPath;
use crate::shutdown::Shutdown;
use crate::worker::WorkerHandle;

type MonitorExit = (EntityPath, Result<(), MonitorError>);

pub struct FleetSupervisor {
    env: MonitorEnv,
    monitoring: HashMap<EntityPath, WorkerHandle>,
    exits: JoinSet<MonitorExit>,
}

impl FleetSupervisor {
    pub fn start(env: MonitorEnv) -> WorkerHandle {
        let span = info_span!("fleet_supervisor", owner = %env.owner);
        WorkerHandle::spawn("fleet supervisor", span, move |shutdown| {
            let supervisor = FleetSupervisor {
                env,
                monitoring: HashMap::new(),
                exits: JoinSet::new(),
            };
            supervisor.run(shutdown)
        })
    }

    async fn run(mut self, shutdown: Shutdown) -> Result<(), MonitorError> {
        let result = self.supervise(&shutdown).await;
        match &result {
            Err(e) if e.is_dying() => info!("fleet supervisor exiting"),
            Err(e) => error!(error = %e, "fleet supervisor exiting"),
            Ok(()) => {}
        }
        // Monitors may still be using the store; they must all be gone
        // before the supervisor reports that it has stopped.
        for handle in self.monitoring.values() {
            handle.kill();
        }
        while let Some(joined) = self.exits.join_next().await {
            if let Ok((path, _)) = joined {
                self.monitor_removed(&path);
            }
        }
        result
    }

    async fn supervise(&mut self, shutdown: &Shutdown) -> Result<(), MonitorError> {
        loop {
            self.start_monitors()
                .await
                .map_err(|e| e.note("cannot start monitors"))?;
            let next_pass = add_duration(
                self.env.clock.now(),
                self.env.params.lease_acquire_interval,
            );
            loop {
                tokio::select! {
                    Some(joined) = self.exits.join_next() => {
                        let (path, result) = joined
                            .map_err(|e| MonitorError::WorkerLost(e.to_string()))?;
                        self.monitor_removed(&path);
                        quiet_exit(result)
                            .map_err(|e| e.note(format!("monitor for {path} failed")))?;
                    }
                    _ = self.env.clock.sleep_until(next_pass) => break,
                    _ = shutdown.wait() => return Err(MonitorError::Dying),
                }
            }
        }
    }

    /// Starts a monitor for every controller that is not yet monitored here
    /// and whose lease can be taken.
    async fn start_monitors(&mut self) -> Result<(), MonitorError> {
        let controllers = self
            .env
            .store
            .all_controllers()
            .await
            .map_err(|e| MonitorError::from(e).note("cannot get controllers"))?;
        for ctl in controllers {
            if self.monitoring.contains_key(&ctl.path) {
                debug!(controller = %ctl.path, "not starting: already monitoring");
                continue;
            }
            if ctl.leased_by_other(&self.env.owner, self.env.clock.now()) {
                continue;
            }
            let expiry = match acquire_lease(
                self.env.store.as_ref(),
                self.env.clock.as_ref(),
                self.env.params.lease_expiry,
                &ctl.path,
                ctl.lease_expiry,
                &ctl.lease_owner,
                &self.env.owner,
            )
            .await
            {
                Ok(expiry) => expiry,
                Err(e) if e.is_monitoring_stopped() => {
                    info!(controller = %ctl.path, error = %e, "not starting: cannot acquire lease");
                    continue;
                }
                Err(e) => return Err(e.note("cannot acquire lease")),
            };
            info!(controller = %ctl.path, "acquired new lease");
            if let Some(metrics) = &self.env.metrics {
                metrics.inc_monitor_leases(&ctl.path.to_string());
            }

            let handle = ControllerMonitor::start(&self.env, ctl.path.clone(), expiry);
            let waiter = handle.clone();
            let path = ctl.path.clone();
            self.exits.spawn(
                async move {
                    let result = waiter.wait().await;
                    match &result {
                        Ok(()) => info!(controller = %path, "monitor died"),
                        Err(e) => info!(controller = %path, error = %e, "monitor died"),
                    }
                    (path, result)
                }
                .in_current_span(),
            );
            self.monitoring.insert(ctl.path, handle);
        }
        Ok(())
    }

    fn monitor_removed(&mut self, path: &EntityPath) {
        if self.monitoring.remove(path).is_some() {
            if let Some(metrics) = &self.env.metrics {
                metrics.dec_monitor_leases(&path.to_string());
            }
        }
    }
}

/// Keeps a fleet supervisor running for the life of the process.
pub struct Agent;

impl Agent {
    pub fn start(env: MonitorEnv) -> WorkerHandle {
        let span = info_span!("agent", owner = %env.owner);
        WorkerHandle::spawn("agent", span, move |shutdown| run_agent(env, shutdown))
    }
}

async fn run_agent(env: MonitorEnv, shutdown: Shutdown) -> Result<(), MonitorError> {
    loop {
        let session = env.store.clone_session();
        let supervisor = FleetSupervisor::start(env.with_store(session.clone()));
        tokio::select! {
            _ = supervisor.dead() => {
                let result = supervisor.wait().await;
                session.close();
                match result {
                    Err(e) => error!(error = %e, "restarting fleet supervisor after error"),
                    Ok(()) => warn!("fleet supervisor stopped unexpectedly; restarting"),
                }
            }
            _ = shutdown.wait() => {
                supervisor.kill();
                if let Err(e) = supervisor.wait().await {
                    warn!(error = %e, "fleet supervisor error during shutdown");
                }
                session.close();
                return Err(MonitorError::Dying);
            }
        }
        tokio::select! {
            _ = env.clock.sleep(env.params.restart_delay) => {}
            _ = shutdown.wait() => return Err(MonitorError::Dying),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SimDialer;
    use crate::clock::VirtualClock;
    use crate::record::Controller;
    use crate::settings::MonitorParams;
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeDelta};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn skips_controllers_leased_by_others() {
        let epoch = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let store = MemoryStore::new_arc();
        let mut ctl = Controller::new(EntityPath::new("bob", "ctl"), "uuid");
        ctl.lease_owner = "other".into();
        ctl.lease_expiry = Some(epoch + TimeDelta::seconds(60));
        store.insert_controller(ctl).await;

        let env = MonitorEnv {
            store: store.clone(),
            dialer: SimDialer::new_arc(),
            clock: VirtualClock::new_arc(epoch),
            owner: "a1".into(),
            params: MonitorParams::default(),
            metrics: None,
        };
        let sup = FleetSupervisor::start(env);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.lease_calls(), 0, "unexpired foreign lease is left alone");
        sup.kill();
        sup.wait().await.unwrap();
    }
}
