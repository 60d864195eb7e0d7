use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// How long a monitor lease lasts before it must be renewed.
pub const DEFAULT_LEASE_EXPIRY: Duration = Duration::from_secs(60);
/// How often the fleet supervisor looks for controllers to monitor.
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL: Duration = Duration::from_secs(30);
/// Delay between failed attempts to reach a controller.
pub const DEFAULT_API_CONNECT_RETRY: Duration = Duration::from_secs(5);
/// Bound on concurrent store writes while committing one batch.
pub const DEFAULT_MAX_CONCURRENT_UPDATES: usize = 10;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    /// Lease owner id. Must be unique per running agent; a random one is
    /// generated once per config when unset.
    pub owner_id: String,
    pub lease_expiry_ms: u64,
    pub lease_acquire_interval_ms: u64,
    pub api_connect_retry_ms: u64,
    pub max_concurrent_updates: usize,
    pub restart_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("fleetmon-{}", uuid::Uuid::new_v4()),
            lease_expiry_ms: DEFAULT_LEASE_EXPIRY.as_millis() as u64,
            lease_acquire_interval_ms: DEFAULT_LEASE_ACQUIRE_INTERVAL.as_millis() as u64,
            api_connect_retry_ms: DEFAULT_API_CONNECT_RETRY.as_millis() as u64,
            max_concurrent_updates: DEFAULT_MAX_CONCURRENT_UPDATES,
            restart_delay_ms: DEFAULT_RESTART_DELAY.as_millis() as u64,
        }
    }
}

impl MonitorConfig {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn params(&self) -> MonitorParams {
        MonitorParams {
            lease_expiry: Duration::from_millis(self.lease_expiry_ms),
            lease_acquire_interval: Duration::from_millis(self.lease_acquire_interval_ms),
            api_connect_retry: Duration::from_millis(self.api_connect_retry_ms),
            max_concurrent_updates: self.max_concurrent_updates.max(1),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }
}

/// Timing and concurrency parameters used by the monitor at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorParams {
    pub lease_expiry: Duration,
    pub lease_acquire_interval: Duration,
    pub api_connect_retry: Duration,
    pub max_concurrent_updates: usize,
    pub restart_delay: Duration,
}

impl Default for MonitorParams {
    fn default() -> Self {
        MonitorConfig::default().params()
    }
}

impl MonitorParams {
    /// Rejects settings that would make a timed loop spin without waiting.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("lease_expiry_ms", self.lease_expiry),
            ("lease_acquire_interval_ms", self.lease_acquire_interval),
            ("api_connect_retry_ms", self.api_connect_retry),
        ] {
            if value.is_zero() {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        // Renewal happens a quarter of the lease before expiry.
        if self.renew_margin().is_zero() {
            anyhow::bail!("lease_expiry_ms must be at least 4");
        }
        Ok(())
    }

    /// How long before expiry a held lease is renewed.
    pub fn renew_margin(&self) -> Duration {
        self.lease_expiry / 4
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// Address for the `/metrics` endpoint. No endpoint when unset.
    pub addr: Option<SocketAddr>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                if cfg.monitor.owner_id.is_empty() {
                    anyhow::bail!("monitor.owner_id must not be empty");
                }
                cfg.monitor.params().validate()?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
