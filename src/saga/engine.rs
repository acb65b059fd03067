//! # Saga Workflow Engine
//!
//! Consumes the controller queue and advances per-operation state
//! machines as initiator commands, acceptance, progress and status events
//! arrive. The engine is the only writer of operation status transitions:
//! `Queued → Running → {Completed | Failed}`, terminal states are
//! monotonic, and saga state is deleted once a terminal phase is reached.
//!
//! Ordering: the engine routes task envelopes to agents itself, so a
//! task's registration in the saga always precedes any status event an
//! agent can produce for it. No ordering is assumed between events of
//! different tasks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::correlation::correlate;
use super::state::{SagaKey, SagaPhase, SagaState};
use super::step::{StepCursor, StepWorkflow};
use crate::agents::{agent_queue, RouteDecision, TaskRouter};
use crate::config::{OrchestratorConfig, AGENT_BROADCAST_TOPIC};
use crate::dispatcher::OperationDispatcher;
use crate::messaging::{
    BusMessage, CommandRegistry, ErrorData, MessageHandler, MessageTransport, OperationEvent,
    OperationTaskAcceptedEvent, OperationTaskProgressEvent, OperationTaskStatusEvent, TaskEnvelope,
    TaskOutcome,
};
use crate::models::{OperationLogEntry, OperationStatus};
use crate::store::OperationStore;

/// Capacity of the in-process operation event channel.
const EVENT_CAPACITY: usize = 1024;

/// What to do with the saga instance after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    /// Terminal: delete the saga state (it is never resurrected).
    Complete,
}

/// Per-operation saga state machines correlated by operation/task ids.
pub struct SagaWorkflowEngine {
    store: Arc<dyn OperationStore>,
    transport: Arc<dyn MessageTransport>,
    registry: CommandRegistry,
    router: TaskRouter,
    dispatcher: Arc<OperationDispatcher>,
    workflows: DashMap<String, Arc<dyn StepWorkflow>>,
    sagas: Arc<DashMap<SagaKey, Arc<Mutex<SagaState>>>>,
    events: broadcast::Sender<OperationEvent>,
    acceptance_timeout: Option<Duration>,
    fail_on_unresolved_agent: bool,
}

impl SagaWorkflowEngine {
    pub fn new(
        store: Arc<dyn OperationStore>,
        transport: Arc<dyn MessageTransport>,
        registry: CommandRegistry,
        router: TaskRouter,
        dispatcher: Arc<OperationDispatcher>,
        config: &OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            transport,
            registry,
            router,
            dispatcher,
            workflows: DashMap::new(),
            sagas: Arc::new(DashMap::new()),
            events,
            acceptance_timeout: config.acceptance_timeout(),
            fail_on_unresolved_agent: config.fail_on_unresolved_agent,
        }
    }

    /// Register a step workflow for its parent command tag. Tasks with
    /// that tag run as a local step saga instead of going to an agent.
    pub fn register_workflow(&self, workflow: Arc<dyn StepWorkflow>) {
        self.workflows
            .insert(workflow.parent_tag().to_string(), workflow);
    }

    /// Subscribe to operation lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Number of live saga instances (test/diagnostic helper).
    pub fn live_sagas(&self) -> usize {
        self.sagas.len()
    }

    /// Route one bus message to its saga instance and run the matching
    /// transition under the per-instance lock (single writer per saga).
    #[instrument(skip(self, message), fields(kind = message.kind(), operation_id = %message.operation_id()))]
    pub async fn process(&self, message: BusMessage) -> anyhow::Result<()> {
        let correlation = correlate(&message);

        let instance = match self.sagas.get(&correlation.key).map(|e| e.value().clone()) {
            Some(instance) => instance,
            None => {
                if !correlation.initiator {
                    debug!(key = %correlation.key, "No live saga for message, dropping");
                    return Ok(());
                }
                match self.verify_live(&message, correlation.key).await? {
                    false => return Ok(()),
                    true => self
                        .sagas
                        .entry(correlation.key)
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(SagaState::new(correlation.key)))
                        })
                        .clone(),
                }
            }
        };

        let mut saga = instance.lock().await;
        let key = saga.key;
        let disposition = match message {
            BusMessage::CreateOperation(m) => {
                self.handle_task_envelope(&mut saga, &instance, m.task).await?
            }
            BusMessage::Task(m) => self.handle_task_envelope(&mut saga, &instance, m).await?,
            BusMessage::StartOperation(m) => {
                if !saga.routed_tasks.is_empty() {
                    debug!("Duplicate start for already initiated operation, dropping");
                    Disposition::Keep
                } else {
                    // A redelivery after a failed send reuses the task id
                    // announced by the earlier attempt.
                    let task_id = saga
                        .known_tasks
                        .iter()
                        .next()
                        .copied()
                        .unwrap_or_else(Uuid::new_v4);
                    let envelope = TaskEnvelope {
                        operation_id: m.operation_id,
                        initiating_task_id: task_id,
                        task_id,
                        command_type_tag: m.command_type_tag,
                        command_payload: m.command_payload,
                        sibling_task_ids: vec![task_id],
                    };
                    self.handle_task_envelope(&mut saga, &instance, envelope)
                        .await?
                }
            }
            BusMessage::TaskAccepted(m) => self.handle_accepted(&mut saga, m).await?,
            BusMessage::TaskProgress(m) => self.handle_progress(&mut saga, m).await?,
            BusMessage::TaskStatus(m) => {
                if matches!(key, SagaKey::Step { .. }) {
                    self.handle_step_status(&mut saga, m).await?
                } else {
                    self.handle_root_status(&mut saga, m).await?
                }
            }
        };
        drop(saga);

        if disposition == Disposition::Complete {
            self.sagas.remove(&key);
            debug!(key = %key, "Saga reached terminal phase, state deleted");
        }
        Ok(())
    }

    /// Initiator messages only act on operations that exist and are not
    /// terminal. A missing row is transient (the dispatcher commits
    /// before sending), except for `StartOperation`, whose producer is
    /// responsible for creating the operation first.
    async fn verify_live(&self, message: &BusMessage, key: SagaKey) -> anyhow::Result<bool> {
        let operation_id = key.operation_id();
        match self.store.get(operation_id).await? {
            Some(operation) if operation.is_terminal() => {
                debug!("Initiator for terminal operation, dropping");
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                if matches!(message, BusMessage::StartOperation(_)) {
                    warn!(%operation_id, "StartOperation for unknown operation, dropping");
                    Ok(false)
                } else {
                    anyhow::bail!("operation {operation_id} not yet visible in store")
                }
            }
        }
    }

    /// Register and route one task envelope: to a local step saga when
    /// its tag has a registered workflow, otherwise point-to-point to the
    /// owning agent or broadcast to all agents.
    ///
    /// The whole sibling set is announced before routing, so a sibling's
    /// status processed on another worker always finds the full pending
    /// set. The task joins `routed_tasks` only after a successful send;
    /// a redelivery after a transient send failure retries the send.
    async fn handle_task_envelope(
        &self,
        saga: &mut SagaState,
        instance: &Arc<Mutex<SagaState>>,
        envelope: TaskEnvelope,
    ) -> anyhow::Result<Disposition> {
        if saga.phase.is_terminal() {
            return Ok(Disposition::Keep);
        }

        if envelope.is_root_task() {
            for sibling in &envelope.sibling_task_ids {
                saga.register_task(*sibling);
            }
            saga.register_task(envelope.task_id);
            if saga.routed_tasks.contains(&envelope.task_id) {
                // Duplicate delivery of an already routed task.
                return Ok(Disposition::Keep);
            }
        }

        let decoded = self
            .registry
            .decode(&envelope.command_type_tag, &envelope.command_payload)?;

        if let Some(workflow) = self
            .workflows
            .get(&envelope.command_type_tag)
            .map(|e| e.value().clone())
        {
            self.initiate_step_saga(&envelope, workflow.as_ref(), &decoded)
                .await?;
        } else {
            match self.router.route(&decoded.resources).await {
                RouteDecision::Agent(agent) => {
                    self.transport
                        .send(&agent_queue(&agent), BusMessage::Task(envelope.clone()))
                        .await?;
                    debug!(task_id = %envelope.task_id, agent, "Task sent to agent queue");
                }
                RouteDecision::Broadcast => {
                    self.transport
                        .publish(AGENT_BROADCAST_TOPIC, BusMessage::Task(envelope.clone()))
                        .await?;
                    debug!(task_id = %envelope.task_id, "Task broadcast to all agents");
                }
                RouteDecision::Unresolved(resource) => {
                    if self.fail_on_unresolved_agent {
                        let reason = format!(
                            "no agent resolved for resource {} ({})",
                            resource.resource_id, resource.resource_type
                        );
                        self.fail_operation(saga, None, &reason).await?;
                        return Ok(Disposition::Complete);
                    }
                    warn!(
                        resource_id = %resource.resource_id,
                        "No agent resolved for addressed resource, operation stays queued"
                    );
                }
            }
        }

        if envelope.is_root_task() {
            saga.routed_tasks.insert(envelope.task_id);
        }

        if saga.phase == SagaPhase::New {
            saga.phase = SagaPhase::Queued;
            self.schedule_acceptance_deadline(saga.key, Arc::clone(instance));
        }
        Ok(Disposition::Keep)
    }

    /// Expand a parent command into its step chain and dispatch the
    /// first child task. The step saga then correlates on the child's
    /// status event.
    async fn initiate_step_saga(
        &self,
        envelope: &TaskEnvelope,
        workflow: &dyn StepWorkflow,
        decoded: &crate::messaging::DecodedCommand,
    ) -> anyhow::Result<()> {
        let key = SagaKey::Step {
            operation_id: envelope.operation_id,
            task_id: envelope.task_id,
        };
        if self.sagas.contains_key(&key) {
            return Ok(());
        }

        let mut cursor = StepCursor::new(
            envelope.task_id,
            envelope.initiating_task_id,
            workflow.steps(decoded),
        );

        let Some(first) = cursor.advance() else {
            // Empty chain: nothing to do, report success to the caller.
            self.transport
                .reply(BusMessage::TaskStatus(OperationTaskStatusEvent::completed(
                    envelope.operation_id,
                    envelope.initiating_task_id,
                    envelope.task_id,
                    None,
                )))
                .await?;
            return Ok(());
        };

        self.dispatcher
            .start_task_encoded(
                envelope.operation_id,
                envelope.task_id,
                &first.type_tag,
                first.payload,
                first.resources,
            )
            .await?;

        let mut saga = SagaState::new(key);
        saga.phase = SagaPhase::Running;
        saga.step = Some(cursor);
        self.sagas.insert(key, Arc::new(Mutex::new(saga)));
        info!(key = %key, "Step saga initiated");
        Ok(())
    }

    /// Acceptance: `Queued → Running`, record the accepting agent.
    /// Duplicate deliveries and acceptances of further tasks while
    /// already `Running` are no-ops.
    async fn handle_accepted(
        &self,
        saga: &mut SagaState,
        event: OperationTaskAcceptedEvent,
    ) -> anyhow::Result<Disposition> {
        if saga.phase.is_terminal() || saga.phase == SagaPhase::Running {
            return Ok(Disposition::Keep);
        }

        saga.phase = SagaPhase::Running;
        if saga.agent_name.is_none() {
            saga.agent_name = Some(event.agent_name.clone());
        }
        self.store
            .update_status(
                event.operation_id,
                OperationStatus::Running,
                Some(&event.agent_name),
                None,
            )
            .await?;
        let _ = self.events.send(OperationEvent::Accepted {
            operation_id: event.operation_id,
            agent_name: event.agent_name,
        });
        Ok(Disposition::Keep)
    }

    /// Progress: append-only log entry; never changes status, never
    /// fails the saga.
    async fn handle_progress(
        &self,
        saga: &mut SagaState,
        event: OperationTaskProgressEvent,
    ) -> anyhow::Result<Disposition> {
        if saga.phase.is_terminal() {
            return Ok(Disposition::Keep);
        }
        self.store
            .append_log(OperationLogEntry::new(
                event.operation_id,
                Some(event.task_id),
                event.message,
                event.timestamp,
            ))
            .await?;
        Ok(Disposition::Keep)
    }

    /// Status of a root task: the last completed root task completes the
    /// operation, the first failure fails it immediately.
    async fn handle_root_status(
        &self,
        saga: &mut SagaState,
        event: OperationTaskStatusEvent,
    ) -> anyhow::Result<Disposition> {
        if saga.phase.is_terminal() {
            return Ok(Disposition::Keep);
        }

        match event.outcome {
            TaskOutcome::Completed { .. } => {
                if !saga.known_tasks.contains(&event.task_id) {
                    // The task's registration message may still be in
                    // flight on this queue; error out so the transport
                    // redelivers behind it.
                    anyhow::bail!(
                        "completion for task {} not yet registered with operation {}",
                        event.task_id,
                        event.operation_id
                    );
                }
                saga.pending_tasks.remove(&event.task_id);
                if !saga.pending_tasks.is_empty() {
                    return Ok(Disposition::Keep);
                }
                self.store
                    .update_status(event.operation_id, OperationStatus::Completed, None, None)
                    .await?;
                let _ = self.events.send(OperationEvent::Completed {
                    operation_id: event.operation_id,
                });
                saga.phase = SagaPhase::Completed;
                info!(operation_id = %event.operation_id, "Operation completed");
                Ok(Disposition::Complete)
            }
            TaskOutcome::Failed { error } => {
                self.fail_operation(saga, Some(event.task_id), &error.message)
                    .await?;
                Ok(Disposition::Complete)
            }
        }
    }

    /// Status of a child task, delivered to its step saga: forward
    /// failure to the caller, otherwise advance the chain or complete.
    async fn handle_step_status(
        &self,
        saga: &mut SagaState,
        event: OperationTaskStatusEvent,
    ) -> anyhow::Result<Disposition> {
        if saga.phase.is_terminal() {
            return Ok(Disposition::Keep);
        }
        let Some(cursor) = saga.step.as_mut() else {
            debug!("Status event for saga without step cursor, dropping");
            return Ok(Disposition::Keep);
        };

        match event.outcome {
            TaskOutcome::Failed { error } => {
                self.transport
                    .reply(BusMessage::TaskStatus(OperationTaskStatusEvent::failed(
                        event.operation_id,
                        cursor.report_to_task_id,
                        cursor.own_task_id,
                        error,
                    )))
                    .await?;
                saga.phase = SagaPhase::Failed;
                Ok(Disposition::Complete)
            }
            TaskOutcome::Completed { response } => {
                if let Some(next) = cursor.advance() {
                    self.dispatcher
                        .start_task_encoded(
                            event.operation_id,
                            cursor.own_task_id,
                            &next.type_tag,
                            next.payload,
                            next.resources,
                        )
                        .await?;
                    return Ok(Disposition::Keep);
                }
                self.transport
                    .reply(BusMessage::TaskStatus(OperationTaskStatusEvent::completed(
                        event.operation_id,
                        cursor.report_to_task_id,
                        cursor.own_task_id,
                        response,
                    )))
                    .await?;
                saga.phase = SagaPhase::Completed;
                Ok(Disposition::Complete)
            }
        }
    }

    /// Persist a failure, record it in the progress log and publish the
    /// lifecycle event. One code path for voluntary failures, poison
    /// messages, timeouts and unresolved agents.
    async fn fail_operation(
        &self,
        saga: &mut SagaState,
        task_id: Option<Uuid>,
        reason: &str,
    ) -> anyhow::Result<()> {
        let operation_id = saga.key.operation_id();
        self.store
            .update_status(operation_id, OperationStatus::Failed, None, Some(reason))
            .await?;
        self.store
            .append_log(OperationLogEntry::new(
                operation_id,
                task_id,
                reason,
                chrono::Utc::now(),
            ))
            .await?;
        let _ = self.events.send(OperationEvent::Failed {
            operation_id,
            error: ErrorData::new(reason),
        });
        saga.phase = SagaPhase::Failed;
        info!(%operation_id, reason, "Operation failed");
        Ok(())
    }

    /// When configured, fail the operation if no acceptance arrived
    /// within the deadline.
    fn schedule_acceptance_deadline(&self, key: SagaKey, instance: Arc<Mutex<SagaState>>) {
        let Some(timeout) = self.acceptance_timeout else {
            return;
        };
        if !matches!(key, SagaKey::Operation(_)) {
            return;
        }

        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let sagas = Arc::clone(&self.sagas);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut saga = instance.lock().await;
            if !matches!(saga.phase, SagaPhase::New | SagaPhase::Queued) {
                return;
            }
            let operation_id = key.operation_id();
            let reason = format!(
                "operation was not accepted by any agent within {}s",
                timeout.as_secs_f64()
            );
            if let Err(error) = store
                .update_status(operation_id, OperationStatus::Failed, None, Some(&reason))
                .await
            {
                warn!(%operation_id, %error, "Failed to persist acceptance timeout");
                return;
            }
            let _ = store
                .append_log(OperationLogEntry::new(
                    operation_id,
                    None,
                    reason.clone(),
                    chrono::Utc::now(),
                ))
                .await;
            let _ = events.send(OperationEvent::Failed {
                operation_id,
                error: ErrorData::new(reason),
            });
            saga.phase = SagaPhase::Failed;
            drop(saga);
            sagas.remove(&key);
            info!(%operation_id, "Operation failed by acceptance timeout");
        });
    }
}

#[async_trait]
impl MessageHandler for SagaWorkflowEngine {
    async fn handle(&self, message: BusMessage) -> anyhow::Result<()> {
        self.process(message).await
    }
}
