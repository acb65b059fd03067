//! # Message Transport
//!
//! Abstraction over the queue/topic bus plus an in-memory implementation
//! used by tests and embedded deployments. The in-memory bus models the
//! broker semantics the core depends on: point-to-point queues with
//! concurrent workers, one-way broadcast topics, at-least-once redelivery
//! with a bounded attempt budget, and a dead-letter notification once the
//! budget is exhausted.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::errors::MessagingError;
use super::messages::BusMessage;
use crate::config::CONTROLLER_QUEUE;

/// Capacity for topic and dead-letter broadcast channels.
const BROADCAST_CAPACITY: usize = 1024;

/// Queue/topic bus surface the orchestration core talks to.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Point-to-point send to a named queue.
    async fn send(&self, destination: &str, message: BusMessage) -> Result<(), MessagingError>;

    /// One-way publish to all subscribers of a topic.
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), MessagingError>;

    /// Reply towards the saga workflow engine (the controller queue).
    async fn reply(&self, message: BusMessage) -> Result<(), MessagingError>;

    /// Subscribe to a broadcast topic.
    fn subscribe_broadcast(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
}

/// Consumer callback for queue deliveries. Returning an error triggers
/// redelivery until the attempt budget is exhausted.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BusMessage) -> anyhow::Result<()>;
}

/// Notification that a message exhausted its delivery attempts.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub message: BusMessage,
    /// Last handler error before the message was declared poison.
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
struct Delivery {
    message: BusMessage,
    attempt: u32,
}

struct QueueHandle {
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

/// In-memory transport on tokio channels.
///
/// Queues are created lazily on first send or consume; topics on first
/// publish or subscription.
pub struct InMemoryTransport {
    queues: DashMap<String, Arc<QueueHandle>>,
    topics: DashMap<String, broadcast::Sender<BusMessage>>,
    dead_letters: broadcast::Sender<DeadLetter>,
    max_delivery_attempts: u32,
}

impl InMemoryTransport {
    pub fn new(max_delivery_attempts: u32) -> Self {
        let (dead_letters, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            dead_letters,
            max_delivery_attempts: max_delivery_attempts.max(1),
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueHandle> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Arc::new(QueueHandle {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                })
            })
            .clone()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<BusMessage> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }

    /// Subscribe to dead-letter notifications (poison messages).
    pub fn dead_letters(&self) -> broadcast::Receiver<DeadLetter> {
        self.dead_letters.subscribe()
    }

    /// Attach `concurrency` workers to a queue. Each worker takes one
    /// delivery at a time; a failed delivery is re-enqueued until the
    /// attempt budget runs out, then surfaced as a [`DeadLetter`].
    pub fn spawn_consumer(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn MessageHandler>,
    ) -> Vec<JoinHandle<()>> {
        let handle = self.queue(queue_name);
        let mut workers = Vec::with_capacity(concurrency.max(1));

        for worker_id in 0..concurrency.max(1) {
            let queue_name = queue_name.to_string();
            let handler = Arc::clone(&handler);
            let receiver = Arc::clone(&handle.receiver);
            let redeliver = handle.sender.clone();
            let dead_letters = self.dead_letters.clone();
            let max_attempts = self.max_delivery_attempts;

            workers.push(tokio::spawn(async move {
                loop {
                    let delivery = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(delivery) = delivery else {
                        debug!(queue = %queue_name, worker_id, "Queue closed, worker exiting");
                        break;
                    };

                    match handler.handle(delivery.message.clone()).await {
                        Ok(()) => {}
                        Err(error) if delivery.attempt < max_attempts => {
                            debug!(
                                queue = %queue_name,
                                attempt = delivery.attempt,
                                error = %error,
                                "Delivery failed, redelivering"
                            );
                            let _ = redeliver.send(Delivery {
                                message: delivery.message,
                                attempt: delivery.attempt + 1,
                            });
                        }
                        Err(error) => {
                            warn!(
                                queue = %queue_name,
                                attempts = delivery.attempt,
                                error = %error,
                                "Delivery attempts exhausted, dead-lettering message"
                            );
                            let _ = dead_letters.send(DeadLetter {
                                queue: queue_name.clone(),
                                message: delivery.message,
                                error: error.to_string(),
                                attempts: delivery.attempt,
                            });
                        }
                    }
                }
            }));
        }

        workers
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn send(&self, destination: &str, message: BusMessage) -> Result<(), MessagingError> {
        let handle = self.queue(destination);
        handle
            .sender
            .send(Delivery {
                message,
                attempt: 1,
            })
            .map_err(|_| MessagingError::QueueClosed {
                queue_name: destination.to_string(),
            })
    }

    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), MessagingError> {
        // No subscribers is acceptable for one-way publishing.
        let _ = self.topic(topic).send(message);
        Ok(())
    }

    async fn reply(&self, message: BusMessage) -> Result<(), MessagingError> {
        self.send(CONTROLLER_QUEUE, message).await
    }

    fn subscribe_broadcast(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.topic(topic).subscribe()
    }
}
