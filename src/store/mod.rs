//! # Operation Store
//!
//! Transactional persistence for Operation aggregates, their resource and
//! project links, and the append-only progress log. The trait splits the
//! in-memory implementation used by tests/embedded deployments from the
//! Postgres implementation used in production.

pub mod memory;
pub mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Operation, OperationLogEntry, OperationStatus, Resource};

pub use memory::{InMemoryOperationStore, StaticProjectResolver};
pub use postgres::PostgresOperationStore;

/// Persistence errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operation {0} not found")]
    NotFound(Uuid),

    #[error("operation {0} already exists")]
    AlreadyExists(Uuid),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Repository for Operation aggregates.
///
/// The dispatcher is the only writer of rows and link sets; the saga
/// workflow engine is the only writer of status transitions.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Persist a fresh operation with its resource/project links in one
    /// transaction. Fails with [`StoreError::AlreadyExists`] when the id
    /// is taken.
    async fn insert(&self, operation: Operation) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, StoreError>;

    /// Extend the resource/project link sets of an existing operation.
    /// Union semantics: links are never removed, duplicates are ignored.
    async fn merge_links(
        &self,
        id: Uuid,
        resources: &BTreeSet<Resource>,
        projects: &BTreeSet<Uuid>,
    ) -> Result<Operation, StoreError>;

    /// Write a status transition (and optionally the accepting agent and
    /// a terminal detail message).
    async fn update_status(
        &self,
        id: Uuid,
        status: OperationStatus,
        agent_name: Option<&str>,
        status_detail: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, entry: OperationLogEntry) -> Result<(), StoreError>;

    async fn log_entries(&self, operation_id: Uuid) -> Result<Vec<OperationLogEntry>, StoreError>;
}

/// Lookup of the projects owning a set of resources. The real
/// implementation lives with the inventory subsystem; the core only
/// depends on this seam.
#[async_trait]
pub trait ProjectResolver: Send + Sync {
    async fn resolve_projects(&self, resource_ids: &[Uuid]) -> Result<BTreeSet<Uuid>, StoreError>;
}
