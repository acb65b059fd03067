//! # Operation/Task Dispatcher
//!
//! Entry point used by producers to start a new operation or attach a
//! task to a running one. A dispatch deduplicates by correlation id,
//! collects and fans out resources, persists the operation row and its
//! links transactionally, and only then hands the task envelopes to the
//! transport.
//!
//! Fan-out rules: a batching (multi-resource) command or a command with
//! no resources produces exactly one task; a single-resource command
//! produces one task per collected resource, each bound to exactly one of
//! them.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::CONTROLLER_QUEUE;
use crate::error::{OrchestratorError, Result};
use crate::messaging::{
    BusMessage, CommandRegistry, CoreCommand, CreateOperationCommand, MessageTransport,
    TaskEnvelope,
};
use crate::models::{Operation, Resource};
use crate::store::{OperationStore, ProjectResolver, StoreError};

/// Outcome of one dispatch call: the (single) operation the work belongs
/// to and the envelopes that were sent on its behalf.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub operation: Operation,
    pub tasks: Vec<TaskEnvelope>,
}

/// Creates operations, fans commands out into tasks and sends them.
///
/// The dispatcher is the only writer of operation rows and link sets;
/// status transitions belong to the saga workflow engine.
pub struct OperationDispatcher {
    store: Arc<dyn OperationStore>,
    projects: Arc<dyn ProjectResolver>,
    transport: Arc<dyn MessageTransport>,
    registry: CommandRegistry,
}

impl OperationDispatcher {
    pub fn new(
        store: Arc<dyn OperationStore>,
        projects: Arc<dyn ProjectResolver>,
        transport: Arc<dyn MessageTransport>,
        registry: CommandRegistry,
    ) -> Self {
        Self {
            store,
            projects,
            transport,
            registry,
        }
    }

    /// Start a brand-new operation (or rejoin an existing one when the
    /// command carries a known correlation id).
    #[instrument(skip(self, command, resources), fields(tag = C::type_tag()))]
    pub async fn start_new<C: CoreCommand>(
        &self,
        command: C,
        resources: Vec<Resource>,
        tenant_id: Uuid,
    ) -> Result<DispatchResult> {
        let operation_id = command.correlation_id().unwrap_or_else(Uuid::new_v4);
        self.dispatch(command, resources, operation_id, None, tenant_id)
            .await
    }

    /// Attach a new task to a running operation. `initiating_task_id` is
    /// the task spawning this work; both ids must be non-nil and the
    /// operation must exist.
    #[instrument(skip(self, command, resources), fields(tag = C::type_tag(), %operation_id))]
    pub async fn start_task<C: CoreCommand>(
        &self,
        operation_id: Uuid,
        initiating_task_id: Uuid,
        command: C,
        resources: Vec<Resource>,
    ) -> Result<DispatchResult> {
        if operation_id.is_nil() {
            return Err(OrchestratorError::InvalidArgument(
                "operation_id must not be empty".to_string(),
            ));
        }
        if initiating_task_id.is_nil() {
            return Err(OrchestratorError::InvalidArgument(
                "initiating_task_id must not be empty".to_string(),
            ));
        }

        let operation = self
            .store
            .get(operation_id)
            .await?
            .ok_or(OrchestratorError::OperationNotFound(operation_id))?;

        self.dispatch(
            command,
            resources,
            operation_id,
            Some(initiating_task_id),
            operation.tenant_id,
        )
        .await
    }

    /// Attach a task whose command is already encoded (used by step
    /// sagas, which work on the erased command view). Persists the link
    /// extension, then sends a single envelope carrying the payload
    /// unchanged.
    #[instrument(skip(self, payload, resources), fields(%operation_id, tag = type_tag))]
    pub async fn start_task_encoded(
        &self,
        operation_id: Uuid,
        initiating_task_id: Uuid,
        type_tag: &str,
        payload: serde_json::Value,
        resources: Vec<Resource>,
    ) -> Result<TaskEnvelope> {
        if operation_id.is_nil() || initiating_task_id.is_nil() {
            return Err(OrchestratorError::InvalidArgument(
                "operation_id and initiating_task_id must not be empty".to_string(),
            ));
        }

        let collected: BTreeSet<Resource> = resources.into_iter().collect();
        let resource_ids: Vec<Uuid> = collected.iter().map(|r| r.resource_id).collect();
        let projects = self.projects.resolve_projects(&resource_ids).await?;

        if self.store.get(operation_id).await?.is_none() {
            return Err(OrchestratorError::OperationNotFound(operation_id));
        }
        self.store
            .merge_links(operation_id, &collected, &projects)
            .await?;

        let envelope = TaskEnvelope {
            operation_id,
            initiating_task_id,
            task_id: Uuid::new_v4(),
            command_type_tag: type_tag.to_string(),
            command_payload: payload,
            sibling_task_ids: Vec::new(),
        };
        self.transport
            .send(CONTROLLER_QUEUE, BusMessage::Task(envelope.clone()))
            .await?;

        debug!(%operation_id, task_id = %envelope.task_id, "Dispatched encoded task");
        Ok(envelope)
    }

    async fn dispatch<C: CoreCommand>(
        &self,
        mut command: C,
        resources: Vec<Resource>,
        operation_id: Uuid,
        initiating_task_id: Option<Uuid>,
        tenant_id: Uuid,
    ) -> Result<DispatchResult> {
        // Union of explicit arguments and command-embedded resources.
        let command_resources = command.resources();
        let is_multi = command_resources.is_multi();
        let collected: BTreeSet<Resource> = resources
            .into_iter()
            .chain(command_resources.to_vec())
            .collect();
        let ordered: Vec<Resource> = collected.iter().cloned().collect();

        let task_count = if is_multi || ordered.is_empty() {
            1
        } else {
            ordered.len()
        };

        // All ids are minted before anything is sent so every envelope of
        // a root dispatch can announce the full sibling set.
        let task_ids: Vec<Uuid> = (0..task_count).map(|_| Uuid::new_v4()).collect();
        let sibling_task_ids = if initiating_task_id.is_none() {
            task_ids.clone()
        } else {
            Vec::new()
        };

        let mut created = false;
        let mut envelopes = Vec::with_capacity(task_count);

        for task_index in 0..task_count {
            // Persist (or extend) the operation before anything is sent.
            let freshly_created = self
                .persist_for_task(operation_id, tenant_id, &collected, initiating_task_id)
                .await?;
            created |= freshly_created;

            // Bind this task's share of the resources back onto the command.
            let bound: Vec<Resource> = if is_multi {
                ordered.clone()
            } else if ordered.is_empty() {
                Vec::new()
            } else {
                vec![ordered[task_index].clone()]
            };
            command.bind_resources(bound);

            let (tag, payload) = self.registry.encode(&command)?;
            let task_id = task_ids[task_index];
            let envelope = TaskEnvelope {
                operation_id,
                initiating_task_id: initiating_task_id.unwrap_or(task_id),
                task_id,
                command_type_tag: tag,
                command_payload: payload,
                sibling_task_ids: sibling_task_ids.clone(),
            };

            // The very first task of a brand-new operation initiates the
            // saga; everything else registers as an additional task.
            let message = if created && task_index == 0 {
                BusMessage::CreateOperation(CreateOperationCommand {
                    task: envelope.clone(),
                })
            } else {
                BusMessage::Task(envelope.clone())
            };
            self.transport.send(CONTROLLER_QUEUE, message).await?;

            debug!(
                %operation_id,
                task_id = %envelope.task_id,
                task_index,
                "Dispatched operation task"
            );
            envelopes.push(envelope);
        }

        let operation = self
            .store
            .get(operation_id)
            .await?
            .ok_or(OrchestratorError::OperationNotFound(operation_id))?;

        info!(
            %operation_id,
            task_count = envelopes.len(),
            created,
            "Operation dispatch complete"
        );

        Ok(DispatchResult {
            operation,
            tasks: envelopes,
        })
    }

    /// One transactional store mutation per task index: create the row on
    /// first contact, otherwise extend the link sets (never remove).
    async fn persist_for_task(
        &self,
        operation_id: Uuid,
        tenant_id: Uuid,
        resources: &BTreeSet<Resource>,
        initiating_task_id: Option<Uuid>,
    ) -> Result<bool> {
        let resource_ids: Vec<Uuid> = resources.iter().map(|r| r.resource_id).collect();
        let projects = self.projects.resolve_projects(&resource_ids).await?;

        match self.store.get(operation_id).await? {
            Some(_) => {
                self.store
                    .merge_links(operation_id, resources, &projects)
                    .await?;
                Ok(false)
            }
            None if initiating_task_id.is_some() => {
                // start_task must never create the operation.
                Err(OrchestratorError::OperationNotFound(operation_id))
            }
            None => {
                let operation =
                    Operation::new(operation_id, tenant_id, resources.clone(), projects.clone());
                match self.store.insert(operation).await {
                    Ok(()) => Ok(true),
                    // Lost a creation race; fall back to extending links.
                    Err(StoreError::AlreadyExists(_)) => {
                        self.store
                            .merge_links(operation_id, resources, &projects)
                            .await?;
                        Ok(false)
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}
