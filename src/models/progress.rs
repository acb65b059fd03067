//! Append-only progress log for operations.
//!
//! Progress events from agents land here; the log is also the externally
//! observable failure surface (timeout and task error descriptions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One progress record for an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub operation_id: Uuid,
    /// Task the entry refers to, when the source message carried one.
    pub task_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl OperationLogEntry {
    pub fn new(
        operation_id: Uuid,
        task_id: Option<Uuid>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id,
            task_id,
            message: message.into(),
            timestamp,
        }
    }
}
