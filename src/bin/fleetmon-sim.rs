use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleetmon::api::{ApiError, SimController, SimDialer};
use fleetmon::clock::WallClock;
use fleetmon::controller_monitor::MonitorEnv;
use fleetmon::delta::{ApplicationInfo, Delta, Entity, MachineInfo, ModelUpdate, UnitInfo};
use fleetmon::fleet::Agent;
use fleetmon::record::{Controller, EntityPath, Life, Model};
use fleetmon::settings::{AppConfig, MonitorParams};
use fleetmon::store::{MemoryStore, Store};
use fleetmon::worker::WorkerHandle;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(version, about = "Run several monitor agents against a simulated controller fleet")]
struct Args {
    /// Path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Number of simulated controllers
    #[arg(long, default_value = "8")]
    controllers: usize,
    /// Number of competing agents
    #[arg(long, default_value = "3")]
    agents: usize,
    /// Duration to run the simulation, in seconds
    #[arg(long, default_value = "60")]
    duration_secs: u64,
    /// Interval between random fleet changes, in milliseconds
    #[arg(long, default_value = "200")]
    churn_ms: u64,
    /// Lease duration, in milliseconds
    #[arg(long, default_value = "4000")]
    lease_ms: u64,
    /// Interval between lease acquisition passes, in milliseconds
    #[arg(long, default_value = "1000")]
    acquire_interval_ms: u64,
    /// Delay before reconnecting to an unreachable controller, in milliseconds
    #[arg(long, default_value = "500")]
    retry_ms: u64,
    /// Restart a random agent every this many seconds (0 disables)
    #[arg(long, default_value = "15")]
    restart_agent_secs: u64,
    /// Interval for stats output in seconds
    #[arg(long, default_value = "10")]
    stats_interval_secs: u64,
    /// RNG seed for reproducible churn
    #[arg(long)]
    seed: Option<u64>,
}

struct SimFleet {
    store: Arc<MemoryStore>,
    controllers: Vec<(EntityPath, SimController)>,
    models: HashMap<usize, Vec<String>>,
    next_id: u64,
}

impl SimFleet {
    async fn churn(&mut self, rng: &mut StdRng) -> anyhow::Result<()> {
        let idx = rng.random_range(0..self.controllers.len());
        let (path, sim) = self.controllers[idx].clone();
        self.next_id += 1;
        let id = self.next_id;
        let models = self.models.entry(idx).or_default();

        let roll: f64 = rng.random();
        if models.is_empty() || roll < 0.1 {
            let uuid = format!("model-{id}");
            self.store
                .insert_model(Model::new(path.clone(), uuid.clone(), format!("m{id}")))
                .await?;
            sim.apply(Delta::changed(Entity::Model(ModelUpdate {
                model_uuid: uuid.clone(),
                name: format!("m{id}"),
                ..Default::default()
            })))
            .await;
            models.push(uuid);
            return Ok(());
        }
        let uuid = models[rng.random_range(0..models.len())].clone();
        if roll < 0.15 {
            models.retain(|m| m != &uuid);
            sim.apply(Delta::removed(Entity::Model(ModelUpdate {
                model_uuid: uuid,
                life: Life::Dead,
                ..Default::default()
            })))
            .await;
        } else if roll < 0.17 {
            warn!(controller = %path, "breaking connections");
            sim.break_connections();
        } else if roll < 0.18 {
            sim.set_dial_error(Some(ApiError::ConnectionFailed("simulated outage".into())))
                .await;
            sim.break_connections();
        } else if roll < 0.25 {
            sim.set_dial_error(None).await;
        } else if roll < 0.45 {
            sim.apply(Delta::changed(Entity::Application(ApplicationInfo {
                model_uuid: uuid,
                name: format!("app-{}", id % 5),
                ..Default::default()
            })))
            .await;
        } else if roll < 0.65 {
            sim.apply(Delta::changed(Entity::Machine(MachineInfo {
                model_uuid: uuid,
                id: (id % 7).to_string(),
                series: "jammy".into(),
                ..Default::default()
            })))
            .await;
        } else if roll < 0.85 {
            sim.apply(Delta::changed(Entity::Unit(UnitInfo {
                model_uuid: uuid,
                name: format!("app-{}/{}", id % 5, id % 3),
                application: format!("app-{}", id % 5),
                ..Default::default()
            })))
            .await;
        } else {
            let unit = Entity::Unit(UnitInfo {
                model_uuid: uuid,
                name: format!("app-{}/{}", id % 5, id % 3),
                ..Default::default()
            });
            // Removed twice to exercise redelivery.
            sim.apply(Delta::removed(unit.clone())).await;
            sim.redeliver(Delta::removed(unit)).await;
        }
        Ok(())
    }

    async fn report(&self) {
        for (path, sim) in &self.controllers {
            if let Some(ctl) = self.store.get_controller(path).await {
                info!(
                    controller = %path,
                    owner = %ctl.lease_owner,
                    models = ctl.stats.model_count,
                    units = ctl.stats.unit_count,
                    machines = ctl.stats.machine_count,
                    applications = ctl.stats.application_count,
                    unavailable = ctl.unavailable_since.is_some(),
                    peak_connections = sim.peak_connections(),
                    "controller"
                );
            }
        }
    }
}

fn start_agent(env: &MonitorEnv, n: usize) -> WorkerHandle {
    let mut env = env.clone();
    env.owner = format!("{}-{n}", env.owner);
    Agent::start(env)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    fleetmon::trace::init(cfg.logging.format)?;

    let metrics = fleetmon::metrics::init()?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    if let Some(addr) = cfg.metrics.addr {
        let rx = shutdown_tx.subscribe();
        let m = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = fleetmon::metrics::run_metrics_server(addr, m, rx).await {
                warn!(error = %e, "metrics server failed");
            }
        });
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let store = MemoryStore::new_arc();
    let dialer = SimDialer::new_arc();
    let mut controllers = Vec::with_capacity(args.controllers);
    for i in 0..args.controllers {
        let path = EntityPath::new("sim", format!("ctl-{i}"));
        store
            .insert_controller(Controller::new(path.clone(), uuid::Uuid::new_v4().to_string()))
            .await;
        let sim = SimController::new(Some("3.5.0"));
        dialer.add(path.clone(), sim.clone()).await;
        controllers.push((path, sim));
    }
    let mut fleet = SimFleet {
        store: store.clone(),
        controllers,
        models: HashMap::new(),
        next_id: 0,
    };

    let params = MonitorParams {
        lease_expiry: Duration::from_millis(args.lease_ms),
        lease_acquire_interval: Duration::from_millis(args.acquire_interval_ms),
        api_connect_retry: Duration::from_millis(args.retry_ms),
        ..cfg.monitor.params()
    };
    params.validate()?;
    let env = MonitorEnv {
        store: store.clone(),
        dialer: dialer.clone(),
        clock: Arc::new(WallClock),
        owner: cfg.monitor.owner_id().to_string(),
        params,
        metrics: Some(metrics.clone()),
    };
    let mut agents: Vec<WorkerHandle> = (0..args.agents).map(|n| start_agent(&env, n)).collect();
    let mut next_agent = agents.len();
    info!(
        controllers = args.controllers,
        agents = args.agents,
        "simulation started"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    let mut churn = tokio::time::interval(Duration::from_millis(args.churn_ms.max(1)));
    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval_secs.max(1)));
    let mut restart =
        tokio::time::interval(Duration::from_secs(args.restart_agent_secs.max(1)));
    restart.tick().await;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = churn.tick() => fleet.churn(&mut rng).await?,
            _ = stats.tick() => fleet.report().await,
            _ = restart.tick(), if args.restart_agent_secs > 0 && !agents.is_empty() => {
                let victim = rng.random_range(0..agents.len());
                let old = agents.swap_remove(victim);
                info!(agent = old.name(), "restarting agent");
                old.kill();
                if let Err(e) = old.wait().await {
                    warn!(error = %e, "agent exited with error");
                }
                agents.push(start_agent(&env, next_agent));
                next_agent += 1;
            }
        }
    }

    for agent in &agents {
        agent.kill();
    }
    for agent in &agents {
        if let Err(e) = agent.wait().await {
            warn!(error = %e, "agent exited with error");
        }
    }
    let _ = shutdown_tx.send(());
    fleet.report().await;

    let mut failed = false;
    for (path, sim) in &fleet.controllers {
        if sim.peak_connections() > 1 {
            warn!(controller = %path, peak = sim.peak_connections(), "controller was watched twice");
            failed = true;
        }
        if let Some(ctl) = store.get_controller(path).await {
            if !ctl.lease_owner.is_empty() {
                warn!(controller = %path, owner = %ctl.lease_owner, "lease still held after shutdown");
                failed = true;
            }
        }
    }
    if store.open_sessions() != 1 {
        warn!(sessions = store.open_sessions(), "store sessions leaked");
        failed = true;
    }
    if failed {
        anyhow::bail!("simulation found invariant violations");
    }
    info!("simulation finished cleanly");
    Ok(())
}
