//! Composable step sagas.
//!
//! A step saga executes one task of an operation as a chain of child
//! tasks: it is initiated by its own parent command, dispatches exactly
//! one child task at a time, and correlates on that child's status event.
//! Child failure is forwarded verbatim to the caller; child success
//! advances the chain or completes the step. Multi-step workflows are
//! chains of single-purpose sagas instead of one monolithic state
//! machine, and they nest: a step command may itself initiate another
//! step saga.

use serde_json::Value;
use uuid::Uuid;

use crate::messaging::DecodedCommand;
use crate::models::Resource;

/// One pre-encoded child command of a step chain.
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub type_tag: String,
    pub payload: Value,
    /// Resources to link/bind for the child task.
    pub resources: Vec<Resource>,
}

/// Defines the chain of child commands a parent command expands into.
///
/// Implementations are registered with the engine per parent command tag;
/// the chain is computed once when the step saga is initiated.
pub trait StepWorkflow: Send + Sync {
    /// Tag of the parent command that initiates this workflow.
    fn parent_tag(&self) -> &'static str;

    /// The ordered child commands for one parent command instance.
    fn steps(&self, parent: &DecodedCommand) -> Vec<StepCommand>;
}

/// Progress of one step saga through its chain.
#[derive(Debug)]
pub struct StepCursor {
    /// Task the step saga itself executes (children reference it as
    /// their initiating task).
    pub own_task_id: Uuid,
    /// Initiating task of the parent scope the final status is reported
    /// to.
    pub report_to_task_id: Uuid,
    pub steps: Vec<StepCommand>,
    /// Index of the next step to dispatch.
    pub next_index: usize,
}

impl StepCursor {
    pub fn new(own_task_id: Uuid, report_to_task_id: Uuid, steps: Vec<StepCommand>) -> Self {
        Self {
            own_task_id,
            report_to_task_id,
            steps,
            next_index: 0,
        }
    }

    /// Take the next step to dispatch, advancing the cursor.
    pub fn advance(&mut self) -> Option<StepCommand> {
        let step = self.steps.get(self.next_index).cloned()?;
        self.next_index += 1;
        Some(step)
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_index >= self.steps.len()
    }
}
