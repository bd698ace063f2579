//! Sales pipeline and its ordered stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{PipelineId, StageId, TenantId, Version};

/// A stage within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    /// Position within the pipeline, lowest first.
    pub order: i32,
    /// Win probability in percent attached to opportunities at this stage.
    pub probability: i32,
    pub is_won: bool,
    pub is_lost: bool,
}

impl Stage {
    pub fn new(name: impl Into<String>, order: i32, probability: i32) -> Self {
        Self {
            id: StageId::new(),
            name: name.into(),
            order,
            probability,
            is_won: false,
            is_lost: false,
        }
    }
}

/// A sales pipeline: an ordered set of stages opportunities move through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub tenant_id: TenantId,
    pub name: String,
    pub stages: Vec<Stage>,
    pub is_default: bool,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(tenant_id: TenantId, name: impl Into<String>, stages: Vec<Stage>) -> Self {
        let now = Utc::now();
        Self {
            id: PipelineId::new(),
            tenant_id,
            name: name.into(),
            stages,
            is_default: false,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the stage new opportunities enter at, the one with the
    /// lowest order that is neither won nor lost.
    pub fn entry_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .filter(|s| !s.is_won && !s.is_lost)
            .min_by_key(|s| s.order)
    }

    /// Looks up a stage by ID.
    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }
}
