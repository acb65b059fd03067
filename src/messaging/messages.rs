//! # Message Contracts
//!
//! Wire messages flowing between producers, the saga workflow engine and
//! remote agents. Field names are correlation-significant and must stay
//! stable across versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One dispatched unit of work, addressed to exactly one destination
/// (an agent queue or the broadcast topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub operation_id: Uuid,
    /// Task that caused this one; equals `task_id` for the root task.
    pub initiating_task_id: Uuid,
    /// Unique per dispatch.
    pub task_id: Uuid,
    /// Stable, explicitly registered discriminator for the command.
    pub command_type_tag: String,
    /// Serialized application command.
    pub command_payload: Value,
    /// Root task ids dispatched together with this one, itself included.
    /// The saga announces the whole set before acting on any sibling's
    /// status, so a completion processed early cannot drain the pending
    /// set while siblings are still in flight. Empty for child tasks;
    /// agents ignore the field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sibling_task_ids: Vec<Uuid>,
}

impl TaskEnvelope {
    /// Whether this envelope starts its own task chain.
    pub fn is_root_task(&self) -> bool {
        self.initiating_task_id == self.task_id
    }
}

/// Producer-facing initiator: start a brand-new operation saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOperation {
    pub operation_id: Uuid,
    pub command_type_tag: String,
    pub command_payload: Value,
}

/// Wraps the very first task of a brand-new operation on its way to the
/// saga workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOperationCommand {
    pub task: TaskEnvelope,
}

/// Reply from an agent that has taken delivery of a task.
///
/// Delivered at-least-once; duplicate events carry identical content and
/// the saga treats repeats as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTaskAcceptedEvent {
    pub agent_name: String,
    pub operation_id: Uuid,
    pub initiating_task_id: Uuid,
    pub task_id: Uuid,
}

/// Free-form progress report from a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationTaskProgressEvent {
    pub operation_id: Uuid,
    pub task_id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Failed { error: ErrorData },
}

/// Error payload carried by failed task status events. Voluntary handler
/// failures and exhausted-retry poison messages converge to this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Status report for one task, emitted by an agent handler, a child step
/// saga, or the failure convergence handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationTaskStatusEvent {
    pub operation_id: Uuid,
    pub initiating_task_id: Uuid,
    pub task_id: Uuid,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

impl OperationTaskStatusEvent {
    pub fn completed(
        operation_id: Uuid,
        initiating_task_id: Uuid,
        task_id: Uuid,
        response: Option<Value>,
    ) -> Self {
        Self {
            operation_id,
            initiating_task_id,
            task_id,
            outcome: TaskOutcome::Completed { response },
        }
    }

    pub fn failed(
        operation_id: Uuid,
        initiating_task_id: Uuid,
        task_id: Uuid,
        error: ErrorData,
    ) -> Self {
        Self {
            operation_id,
            initiating_task_id,
            task_id,
            outcome: TaskOutcome::Failed { error },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failed { .. })
    }
}

/// Every message the transport carries, internally tagged for a stable
/// wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    StartOperation(StartOperation),
    CreateOperation(CreateOperationCommand),
    Task(TaskEnvelope),
    TaskAccepted(OperationTaskAcceptedEvent),
    TaskProgress(OperationTaskProgressEvent),
    TaskStatus(OperationTaskStatusEvent),
}

impl BusMessage {
    /// Operation the message correlates to.
    pub fn operation_id(&self) -> Uuid {
        match self {
            Self::StartOperation(m) => m.operation_id,
            Self::CreateOperation(m) => m.task.operation_id,
            Self::Task(m) => m.operation_id,
            Self::TaskAccepted(m) => m.operation_id,
            Self::TaskProgress(m) => m.operation_id,
            Self::TaskStatus(m) => m.operation_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartOperation(_) => "start_operation",
            Self::CreateOperation(_) => "create_operation",
            Self::Task(_) => "task",
            Self::TaskAccepted(_) => "task_accepted",
            Self::TaskProgress(_) => "task_progress",
            Self::TaskStatus(_) => "task_status",
        }
    }
}

/// Lifecycle notifications the saga engine publishes for the operation
/// store writer and any in-process observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationEvent {
    Accepted {
        operation_id: Uuid,
        agent_name: String,
    },
    Completed {
        operation_id: Uuid,
    },
    Failed {
        operation_id: Uuid,
        error: ErrorData,
    },
}
