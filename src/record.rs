//! Records persisted in the store: controllers, models and the
//! machine/application snapshots mirrored from each controller.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delta::{ApplicationInfo, MachineInfo};

/// Two-part name of a controller, rendered as `user/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityPath {
    pub user: String,
    pub name: String,
}

impl EntityPath {
    pub fn new(user: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.name)
    }
}

/// Aggregate counts of what a controller currently hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub model_count: i64,
    pub application_count: i64,
    pub unit_count: i64,
    pub machine_count: i64,
}

/// A controller record.
///
/// `lease_owner` is empty and `lease_expiry` is `None` while no agent holds
/// the monitor lease. `unavailable_since` is `None` while the controller is
/// reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub path: EntityPath,
    pub uuid: String,
    pub host_ports: Vec<String>,
    #[serde(default)]
    pub lease_owner: String,
    #[serde(default)]
    pub lease_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unavailable_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub stats: ControllerStats,
}

impl Controller {
    pub fn new(path: EntityPath, uuid: impl Into<String>) -> Self {
        Self {
            path,
            uuid: uuid.into(),
            host_ports: Vec::new(),
            lease_owner: String::new(),
            lease_expiry: None,
            unavailable_since: None,
            version: None,
            stats: ControllerStats::default(),
        }
    }

    /// Whether someone other than `owner` holds an unexpired lease.
    pub fn leased_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner != owner && self.lease_expiry.is_some_and(|expiry| now < expiry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn as_str(&self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub status: String,
    pub message: String,
    pub since: Option<DateTime<Utc>>,
}

/// Latest model snapshot as reported by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub life: Life,
    pub status: ModelStatus,
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Kinds of entity counted per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCount {
    Units,
    Machines,
    Applications,
}

/// Running statistics for a count that changes over time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    /// When `current` was last set.
    pub time: Option<DateTime<Utc>>,
    pub current: i64,
    pub max: i64,
    /// Sum of every increase ever applied.
    pub total: i64,
    /// Integral of `current` over time, in milliseconds.
    pub total_time: i64,
}

impl Count {
    pub fn update(&mut self, n: i64, now: DateTime<Utc>) {
        if n > self.max {
            self.max = n;
        }
        if n > self.current {
            self.total += n - self.current;
        }
        if let Some(prev) = self.time {
            let elapsed = (now - prev).num_milliseconds().max(0);
            self.total_time += self.current * elapsed;
        }
        self.current = n;
        self.time = Some(now);
    }
}

/// A model record owned by one controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub controller: EntityPath,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub info: Option<ModelInfo>,
    #[serde(default)]
    pub counts: BTreeMap<EntityCount, Count>,
}

impl Model {
    pub fn new(controller: EntityPath, uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            controller,
            uuid: uuid.into(),
            name: name.into(),
            info: None,
            counts: BTreeMap::new(),
        }
    }

    pub fn count(&self, kind: EntityCount) -> i64 {
        self.counts.get(&kind).map(|c| c.current).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub controller: EntityPath,
    pub info: MachineInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub controller: EntityPath,
    pub info: ApplicationInfo,
}
