//! Change notifications delivered by a controller's delta stream.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{Life, ModelInfo, ModelStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Model,
    Unit,
    Application,
    Machine,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Model => "model",
            EntityKind::Unit => "unit",
            EntityKind::Application => "application",
            EntityKind::Machine => "machine",
        })
    }
}

/// Identifies one entity within a controller. Models use an empty `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub kind: EntityKind,
    pub model_uuid: String,
    pub id: String,
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{} {}", self.kind, self.model_uuid)
        } else {
            write!(f, "{} {}:{}", self.kind, self.model_uuid, self.id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub model_uuid: String,
    pub name: String,
    pub life: Life,
    pub status: ModelStatus,
    pub config: BTreeMap<String, serde_json::Value>,
}

impl ModelUpdate {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            life: self.life,
            status: self.status.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub model_uuid: String,
    pub name: String,
    pub application: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub model_uuid: String,
    pub name: String,
    pub life: Life,
    pub exposed: bool,
    pub charm_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub model_uuid: String,
    pub id: String,
    pub life: Life,
    pub series: String,
    pub agent_status: String,
}

/// Snapshot payload of a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Model(ModelUpdate),
    Unit(UnitInfo),
    Application(ApplicationInfo),
    Machine(MachineInfo),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Model(_) => EntityKind::Model,
            Entity::Unit(_) => EntityKind::Unit,
            Entity::Application(_) => EntityKind::Application,
            Entity::Machine(_) => EntityKind::Machine,
        }
    }

    pub fn model_uuid(&self) -> &str {
        match self {
            Entity::Model(m) => &m.model_uuid,
            Entity::Unit(u) => &u.model_uuid,
            Entity::Application(a) => &a.model_uuid,
            Entity::Machine(m) => &m.model_uuid,
        }
    }

    pub fn id(&self) -> EntityId {
        let id = match self {
            Entity::Model(_) => String::new(),
            Entity::Unit(u) => u.name.clone(),
            Entity::Application(a) => a.name.clone(),
            Entity::Machine(m) => m.id.clone(),
        };
        EntityId {
            kind: self.kind(),
            model_uuid: self.model_uuid().to_string(),
            id,
        }
    }
}

/// One change notification: the entity now exists with the given snapshot,
/// or it has been removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub removed: bool,
    pub entity: Entity,
}

impl Delta {
    pub fn changed(entity: Entity) -> Self {
        Self {
            removed: false,
            entity,
        }
    }

    pub fn removed(entity: Entity) -> Self {
        Self {
            removed: true,
            entity,
        }
    }
}
