//! # Failure Convergence
//!
//! Converts transport-level "delivery permanently failed" notifications
//! into the same `Failed` status event a handler would emit voluntarily.
//! Downstream sagas never distinguish "handler reported an error" from
//! "handler never finished within the retry budget", so no saga can hang
//! on a poison message.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::messaging::{
    BusMessage, DeadLetter, ErrorData, MessageTransport, OperationTaskStatusEvent, TaskEnvelope,
};

/// Subscribes to dead-letter notifications and synthesizes task failure
/// events for poisoned task messages.
pub struct FailureConvergenceHandler {
    transport: Arc<dyn MessageTransport>,
}

impl FailureConvergenceHandler {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }

    /// Run until the dead-letter channel closes.
    pub fn spawn(self, mut dead_letters: broadcast::Receiver<DeadLetter>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match dead_letters.recv().await {
                    Ok(dead) => self.converge(dead).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dead-letter subscriber lagged, notifications lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn converge(&self, dead: DeadLetter) {
        let Some(envelope) = task_envelope(&dead.message) else {
            debug!(
                queue = dead.queue,
                kind = dead.message.kind(),
                "Dead letter is not a task message, ignoring"
            );
            return;
        };

        let event = OperationTaskStatusEvent::failed(
            envelope.operation_id,
            envelope.initiating_task_id,
            envelope.task_id,
            ErrorData::new(format!(
                "task delivery failed after {} attempts: {}",
                dead.attempts, dead.error
            )),
        );

        warn!(
            operation_id = %envelope.operation_id,
            task_id = %envelope.task_id,
            queue = dead.queue,
            "Converging poison task message into failure event"
        );
        if let Err(error) = self.transport.reply(BusMessage::TaskStatus(event)).await {
            warn!(%error, "Could not deliver synthesized failure event");
        }
    }
}

fn task_envelope(message: &BusMessage) -> Option<TaskEnvelope> {
    match message {
        BusMessage::Task(envelope) => Some(envelope.clone()),
        BusMessage::CreateOperation(command) => Some(command.task.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONTROLLER_QUEUE;
    use crate::messaging::{InMemoryTransport, MessageHandler, TaskOutcome};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Forward(mpsc::UnboundedSender<BusMessage>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: BusMessage) -> anyhow::Result<()> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poison_task_becomes_failure_event() {
        let transport = Arc::new(InMemoryTransport::new(1));
        let handler = FailureConvergenceHandler::new(transport.clone());
        handler.spawn(transport.dead_letters());

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.spawn_consumer(CONTROLLER_QUEUE, 1, Arc::new(Forward(tx)));

        struct AlwaysFails;
        #[async_trait]
        impl MessageHandler for AlwaysFails {
            async fn handle(&self, _message: BusMessage) -> anyhow::Result<()> {
                anyhow::bail!("agent never acknowledged")
            }
        }
        transport.spawn_consumer("agent.agent-1", 1, Arc::new(AlwaysFails));

        let task_id = Uuid::new_v4();
        let envelope = TaskEnvelope {
            operation_id: Uuid::new_v4(),
            initiating_task_id: task_id,
            task_id,
            command_type_tag: "converge_machine".to_string(),
            command_payload: serde_json::json!({}),
            sibling_task_ids: vec![task_id],
        };
        transport
            .send("agent.agent-1", BusMessage::Task(envelope.clone()))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        let BusMessage::TaskStatus(status) = message else {
            panic!("expected task status event, got {message:?}");
        };
        assert_eq!(status.operation_id, envelope.operation_id);
        assert_eq!(status.task_id, task_id);
        match status.outcome {
            TaskOutcome::Failed { error } => {
                assert!(error.message.contains("agent never acknowledged"));
            }
            other => panic!("expected failure outcome, got {other:?}"),
        }
    }
}
