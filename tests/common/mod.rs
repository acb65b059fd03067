//! Shared harness for the orchestration integration tests: a complete
//! in-memory control plane (store, transport, dispatcher, saga engine,
//! failure convergence) plus the sample commands the tests dispatch.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use opflow_core::agents::{StaticAgentResolver, TaskRouter};
use opflow_core::config::{OrchestratorConfig, CONTROLLER_QUEUE};
use opflow_core::dispatcher::OperationDispatcher;
use opflow_core::messaging::{
    BusMessage, CommandRegistry, CommandResources, CoreCommand, ErrorData, InMemoryTransport,
    MessageTransport, OperationTaskAcceptedEvent, OperationTaskProgressEvent,
    OperationTaskStatusEvent,
};
use opflow_core::models::{Operation, OperationStatus, Resource};
use opflow_core::saga::SagaWorkflowEngine;
use opflow_core::store::{InMemoryOperationStore, OperationStore, StaticProjectResolver};
use opflow_core::FailureConvergenceHandler;

/// Single-resource command: one task per resource on fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergeCatletCommand {
    pub correlation_id: Option<Uuid>,
    pub resource: Option<Resource>,
}

impl CoreCommand for ConvergeCatletCommand {
    fn type_tag() -> &'static str {
        "converge_catlet"
    }

    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    fn resources(&self) -> CommandResources {
        CommandResources::Single(self.resource.clone())
    }

    fn bind_resources(&mut self, mut resources: Vec<Resource>) {
        self.resource = if resources.is_empty() {
            None
        } else {
            Some(resources.remove(0))
        };
    }
}

/// Multi-resource (batching) command: one task carrying all resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInventoryCommand {
    pub resources: Vec<Resource>,
}

impl CoreCommand for UpdateInventoryCommand {
    fn type_tag() -> &'static str {
        "update_inventory"
    }

    fn resources(&self) -> CommandResources {
        CommandResources::Multi(self.resources.clone())
    }

    fn bind_resources(&mut self, resources: Vec<Resource>) {
        self.resources = resources;
    }
}

/// Parent command of the two-step deployment workflow used by the step
/// saga tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployCatletCommand {
    pub correlation_id: Option<Uuid>,
}

impl CoreCommand for DeployCatletCommand {
    fn type_tag() -> &'static str {
        "deploy_catlet"
    }

    fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }
}

/// Child commands of the deployment workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareStorageCommand {}

impl CoreCommand for PrepareStorageCommand {
    fn type_tag() -> &'static str {
        "prepare_storage"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartCatletCommand {}

impl CoreCommand for StartCatletCommand {
    fn type_tag() -> &'static str {
        "start_catlet"
    }
}

pub fn test_registry() -> CommandRegistry {
    let registry = CommandRegistry::new();
    registry.register::<ConvergeCatletCommand>().unwrap();
    registry.register::<UpdateInventoryCommand>().unwrap();
    registry.register::<DeployCatletCommand>().unwrap();
    registry.register::<PrepareStorageCommand>().unwrap();
    registry.register::<StartCatletCommand>().unwrap();
    registry
}

pub struct TestSystem {
    pub store: Arc<InMemoryOperationStore>,
    pub transport: Arc<InMemoryTransport>,
    pub dispatcher: Arc<OperationDispatcher>,
    pub engine: Arc<SagaWorkflowEngine>,
    pub agent_resolver: Arc<StaticAgentResolver>,
    pub project_resolver: Arc<StaticProjectResolver>,
}

pub fn build_system(config: OrchestratorConfig) -> TestSystem {
    opflow_core::logging::init_structured_logging();

    let transport = Arc::new(InMemoryTransport::new(config.max_delivery_attempts));
    let store = Arc::new(InMemoryOperationStore::new());
    let project_resolver = Arc::new(StaticProjectResolver::new());
    let agent_resolver = Arc::new(StaticAgentResolver::new());
    let registry = test_registry();

    let dispatcher = Arc::new(OperationDispatcher::new(
        store.clone(),
        project_resolver.clone(),
        transport.clone(),
        registry.clone(),
    ));
    let engine = Arc::new(SagaWorkflowEngine::new(
        store.clone(),
        transport.clone(),
        registry,
        TaskRouter::new(agent_resolver.clone()),
        dispatcher.clone(),
        &config,
    ));

    transport.spawn_consumer(CONTROLLER_QUEUE, config.queue_concurrency, engine.clone());
    FailureConvergenceHandler::new(transport.clone()).spawn(transport.dead_letters());

    TestSystem {
        store,
        transport,
        dispatcher,
        engine,
        agent_resolver,
        project_resolver,
    }
}

pub fn default_system() -> TestSystem {
    build_system(OrchestratorConfig::default())
}

impl TestSystem {
    /// Simulate an agent accepting a task.
    pub async fn accept(&self, operation_id: Uuid, task_id: Uuid, agent: &str) {
        self.transport
            .reply(BusMessage::TaskAccepted(OperationTaskAcceptedEvent {
                agent_name: agent.to_string(),
                operation_id,
                initiating_task_id: task_id,
                task_id,
            }))
            .await
            .unwrap();
    }

    /// Simulate a task reporting progress.
    pub async fn progress(&self, operation_id: Uuid, task_id: Uuid, message: &str) {
        self.transport
            .reply(BusMessage::TaskProgress(OperationTaskProgressEvent {
                operation_id,
                task_id,
                message: message.to_string(),
                timestamp: chrono::Utc::now(),
            }))
            .await
            .unwrap();
    }

    /// Simulate a root task completing.
    pub async fn complete(&self, operation_id: Uuid, task_id: Uuid) {
        self.transport
            .reply(BusMessage::TaskStatus(OperationTaskStatusEvent::completed(
                operation_id,
                task_id,
                task_id,
                None,
            )))
            .await
            .unwrap();
    }

    /// Simulate a root task failing.
    pub async fn fail(&self, operation_id: Uuid, task_id: Uuid, message: &str) {
        self.transport
            .reply(BusMessage::TaskStatus(OperationTaskStatusEvent::failed(
                operation_id,
                task_id,
                task_id,
                ErrorData::new(message),
            )))
            .await
            .unwrap();
    }

    /// Poll the store until the operation reaches the expected status.
    pub async fn wait_for_status(
        &self,
        operation_id: Uuid,
        status: OperationStatus,
    ) -> Operation {
        let deadline = Duration::from_secs(5);
        let operation = tokio::time::timeout(deadline, async {
            loop {
                if let Some(operation) = self.store.get(operation_id).await.unwrap() {
                    if operation.status == status {
                        return operation;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        operation.unwrap_or_else(|_| panic!("operation {operation_id} never reached {status}"))
    }

    /// Give in-flight messages a moment to drain.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
