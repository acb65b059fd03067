//! # Agent Resolution and Task Routing
//!
//! Decides where a task envelope goes: point-to-point to the queue of the
//! agent owning the addressed resource, or broadcast to all agents. Agent
//! ownership comes from the inventory subsystem through the
//! [`AgentResolver`] seam; the in-memory resolver backs tests and
//! embedded deployments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::messaging::CommandResources;
use crate::models::Resource;

/// Queue name for a named agent.
pub fn agent_queue(agent_name: &str) -> String {
    format!("agent.{agent_name}")
}

/// Lookup of the agent currently owning a resource.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    async fn resolve_agent(&self, resource: &Resource) -> Option<String>;
}

/// Fixed resource → agent mapping.
#[derive(Default)]
pub struct StaticAgentResolver {
    mapping: DashMap<Uuid, String>,
}

impl StaticAgentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, resource_id: Uuid, agent_name: impl Into<String>) {
        self.mapping.insert(resource_id, agent_name.into());
    }
}

#[async_trait]
impl AgentResolver for StaticAgentResolver {
    async fn resolve_agent(&self, resource: &Resource) -> Option<String> {
        self.mapping.get(&resource.resource_id).map(|e| e.clone())
    }
}

/// Routing decision for one task envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Send point-to-point to the named agent's queue.
    Agent(String),
    /// Publish on the agent broadcast topic.
    Broadcast,
    /// The command addresses one resource whose owning agent is unknown.
    Unresolved(Resource),
}

/// Routes task envelopes based on the resources bound to the command.
#[derive(Clone)]
pub struct TaskRouter {
    resolver: Arc<dyn AgentResolver>,
}

impl TaskRouter {
    pub fn new(resolver: Arc<dyn AgentResolver>) -> Self {
        Self { resolver }
    }

    /// A command bound to exactly one resource is addressed: it goes to
    /// the owning agent or is reported unresolved. Batched and
    /// resource-less commands are broadcast.
    pub async fn route(&self, resources: &CommandResources) -> RouteDecision {
        match resources {
            CommandResources::Single(Some(resource)) => {
                match self.resolver.resolve_agent(resource).await {
                    Some(agent) => RouteDecision::Agent(agent),
                    None => RouteDecision::Unresolved(resource.clone()),
                }
            }
            CommandResources::Single(None)
            | CommandResources::Multi(_)
            | CommandResources::None => RouteDecision::Broadcast,
        }
    }
}

/// Agent-side intake for task envelopes.
///
/// On every delivery the listener re-publishes the envelope on a local
/// in-process channel so handlers can begin work, and replies an
/// acceptance event towards the saga. The reply goes out exactly once
/// per delivery; duplicate deliveries produce duplicate identical
/// events, which the saga treats as no-ops.
pub struct TaskListener {
    agent_name: String,
    transport: Arc<dyn crate::messaging::MessageTransport>,
    accepted: tokio::sync::broadcast::Sender<crate::messaging::TaskEnvelope>,
}

impl TaskListener {
    pub fn new(
        agent_name: impl Into<String>,
        transport: Arc<dyn crate::messaging::MessageTransport>,
    ) -> Self {
        let (accepted, _) = tokio::sync::broadcast::channel(256);
        Self {
            agent_name: agent_name.into(),
            transport,
            accepted,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Local in-process stream of accepted task envelopes.
    pub fn subscribe_accepted(
        &self,
    ) -> tokio::sync::broadcast::Receiver<crate::messaging::TaskEnvelope> {
        self.accepted.subscribe()
    }

    /// Also consume the agent broadcast topic with this listener.
    pub fn spawn_broadcast(self: Arc<Self>, topic: &str) -> tokio::task::JoinHandle<()> {
        use crate::messaging::MessageHandler;

        let mut receiver = self.transport.subscribe_broadcast(topic);
        tokio::spawn(async move {
            while let Ok(message) = receiver.recv().await {
                if let Err(error) = self.handle(message).await {
                    tracing::warn!(%error, "Broadcast task intake failed");
                }
            }
        })
    }
}

#[async_trait]
impl crate::messaging::MessageHandler for TaskListener {
    async fn handle(&self, message: crate::messaging::BusMessage) -> anyhow::Result<()> {
        use crate::messaging::{BusMessage, OperationTaskAcceptedEvent};

        let BusMessage::Task(envelope) = message else {
            tracing::debug!(kind = message.kind(), "Ignoring non-task message on agent queue");
            return Ok(());
        };

        // No subscribers is fine: acceptance precedes local handling.
        let _ = self.accepted.send(envelope.clone());

        self.transport
            .reply(BusMessage::TaskAccepted(OperationTaskAcceptedEvent {
                agent_name: self.agent_name.clone(),
                operation_id: envelope.operation_id,
                initiating_task_id: envelope.initiating_task_id,
                task_id: envelope.task_id,
            }))
            .await?;
        Ok(())
    }
}
