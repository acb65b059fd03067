//! Data layer for the orchestration core.

pub mod operation;
pub mod progress;

pub use operation::{Operation, OperationStatus, Resource, ResourceType};
pub use progress::OperationLogEntry;
