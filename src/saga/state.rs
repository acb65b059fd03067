//! Saga instance state.
//!
//! A saga is the correlated state machine tracking one operation (or one
//! step of one) across asynchronous messages. State is ephemeral: it is
//! created by an initiator message, mutated under the per-instance lock,
//! and deleted once a terminal phase is reached. A deleted saga is never
//! resurrected by late or duplicate messages.

use std::collections::HashSet;
use std::fmt;

use uuid::Uuid;

use crate::saga::step::StepCursor;

/// Correlation key of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SagaKey {
    /// The saga tracking a whole operation.
    Operation(Uuid),
    /// A step saga, keyed by the operation and the task it executes.
    Step {
        operation_id: Uuid,
        task_id: Uuid,
    },
}

impl SagaKey {
    pub fn operation_id(&self) -> Uuid {
        match self {
            Self::Operation(id) => *id,
            Self::Step { operation_id, .. } => *operation_id,
        }
    }
}

impl fmt::Display for SagaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(id) => write!(f, "operation/{id}"),
            Self::Step {
                operation_id,
                task_id,
            } => write!(f, "step/{operation_id}/{task_id}"),
        }
    }
}

/// Saga lifecycle phases. `New` exists only between instance creation and
/// the initiator finishing; the terminal phases mirror the operation's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    New,
    Queued,
    Running,
    Completed,
    Failed,
}

impl SagaPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable state of one saga instance, guarded by a per-instance lock so
/// at most one handler executes against it at a time.
#[derive(Debug)]
pub struct SagaState {
    pub key: SagaKey,
    pub phase: SagaPhase,
    /// Agent that first accepted work for this operation.
    pub agent_name: Option<String>,
    /// Root tasks announced to this saga, including siblings whose own
    /// envelopes are still in flight.
    pub known_tasks: HashSet<Uuid>,
    /// Root tasks that have not yet reported a terminal status.
    pub pending_tasks: HashSet<Uuid>,
    /// Root tasks whose envelope was successfully handed to an agent
    /// queue or topic. A task only joins this set after the send, so a
    /// redelivered envelope retries the send instead of being dropped.
    pub routed_tasks: HashSet<Uuid>,
    /// Present only on step sagas: the chain being executed.
    pub step: Option<StepCursor>,
}

impl SagaState {
    pub fn new(key: SagaKey) -> Self {
        Self {
            key,
            phase: SagaPhase::New,
            agent_name: None,
            known_tasks: HashSet::new(),
            pending_tasks: HashSet::new(),
            routed_tasks: HashSet::new(),
            step: None,
        }
    }

    /// Announce a root task; returns false when it was already known
    /// (duplicate delivery or an already announced sibling).
    pub fn register_task(&mut self, task_id: Uuid) -> bool {
        if !self.known_tasks.insert(task_id) {
            return false;
        }
        self.pending_tasks.insert(task_id);
        true
    }
}
