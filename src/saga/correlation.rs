//! Explicit correlation table: which saga instance a bus message belongs
//! to and whether it may create one.
//!
//! Every message type the engine handles declares here which of its
//! fields maps to the saga key. Routing is a plain match; only messages
//! marked as initiators may create a new instance, everything else is
//! dropped when no live saga matches.

use super::state::SagaKey;
use crate::messaging::BusMessage;

/// Result of correlating one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub key: SagaKey,
    /// Whether this message type may create a saga instance.
    pub initiator: bool,
}

/// Map a message to its saga instance key.
///
/// Task status events carry double routing: a root task's status (where
/// the task initiated itself) belongs to the operation saga; a child
/// task's status belongs to the step saga listening on the initiating
/// task id.
pub fn correlate(message: &BusMessage) -> Correlation {
    match message {
        BusMessage::StartOperation(m) => Correlation {
            key: SagaKey::Operation(m.operation_id),
            initiator: true,
        },
        BusMessage::CreateOperation(m) => Correlation {
            key: SagaKey::Operation(m.task.operation_id),
            initiator: true,
        },
        // Additional tasks may re-materialize tracking for an operation
        // that is still live; the engine verifies liveness against the
        // store before acting.
        BusMessage::Task(m) => Correlation {
            key: SagaKey::Operation(m.operation_id),
            initiator: true,
        },
        BusMessage::TaskAccepted(m) => Correlation {
            key: SagaKey::Operation(m.operation_id),
            initiator: false,
        },
        BusMessage::TaskProgress(m) => Correlation {
            key: SagaKey::Operation(m.operation_id),
            initiator: false,
        },
        BusMessage::TaskStatus(m) => {
            if m.initiating_task_id == m.task_id {
                Correlation {
                    key: SagaKey::Operation(m.operation_id),
                    initiator: false,
                }
            } else {
                Correlation {
                    key: SagaKey::Step {
                        operation_id: m.operation_id,
                        task_id: m.initiating_task_id,
                    },
                    initiator: false,
                }
            }
        }
    }
}
