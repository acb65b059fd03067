//! Structured error handling for the orchestration core.
//!
//! Validation and not-found failures are synchronous and never cross the
//! bus; task-level failures travel as `Failed` status events, not as
//! errors of this type.

use uuid::Uuid;

use crate::messaging::errors::{CodecError, MessagingError};
use crate::store::StoreError;

/// Top-level error for dispatcher and engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A required identifier was missing or nil. Fails fast before any
    /// store or transport interaction.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A task was attached to an operation id that does not exist.
    #[error("operation {0} not found")]
    OperationNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
