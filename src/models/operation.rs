//! Operation aggregate: the persisted, top-level unit of distributed work.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created and dispatched, no agent has accepted yet
    Queued,
    /// An agent accepted the work and is executing
    Running,
    /// All tasks finished successfully
    Completed,
    /// At least one task failed, or acceptance timed out
    Failed,
}

impl OperationStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the operation is actively being worked on
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid operation status: {s}")),
        }
    }
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self::Queued
    }
}

/// Kind of platform resource an operation touches.
///
/// The orchestration core treats the type opaquely; it only matters for
/// set identity of resource links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Machine,
    Network,
    Disk,
    Other(String),
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Machine => write!(f, "machine"),
            Self::Network => write!(f, "network"),
            Self::Disk => write!(f, "disk"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

impl std::str::FromStr for ResourceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "machine" => Self::Machine,
            "network" => Self::Network,
            "disk" => Self::Disk,
            other => Self::Other(other.to_string()),
        })
    }
}

/// A `(resource id, resource type)` pair linked to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: Uuid,
    pub resource_type: ResourceType,
}

impl Resource {
    pub fn new(resource_id: Uuid, resource_type: ResourceType) -> Self {
        Self {
            resource_id,
            resource_type,
        }
    }

    pub fn machine(resource_id: Uuid) -> Self {
        Self::new(resource_id, ResourceType::Machine)
    }
}

/// Aggregate root for one logical unit of distributed work.
///
/// `id` doubles as the correlation key on the bus. Resource and project
/// links are sets; the dispatcher only ever extends them, never removes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub status: OperationStatus,
    /// Name of the agent that accepted the work, once known.
    pub agent_name: Option<String>,
    pub tenant_id: Uuid,
    pub resources: BTreeSet<Resource>,
    pub projects: BTreeSet<Uuid>,
    /// Terminal detail, e.g. the error description of a failed task.
    pub status_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// Create a fresh `Queued` operation with the given links.
    pub fn new(
        id: Uuid,
        tenant_id: Uuid,
        resources: BTreeSet<Resource>,
        projects: BTreeSet<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: OperationStatus::Queued,
            agent_name: None,
            tenant_id,
            resources,
            projects,
            status_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
