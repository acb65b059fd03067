//! In-memory operation store and project resolver for tests and embedded
//! deployments.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{OperationStore, ProjectResolver, StoreError};
use crate::models::{Operation, OperationLogEntry, OperationStatus, Resource};

/// Lock-guarded map-backed store. Each method body holds the lock for the
/// whole mutation, which gives the same read-then-write isolation the
/// Postgres store gets from its transactions.
#[derive(Default)]
pub struct InMemoryOperationStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    operations: HashMap<Uuid, Operation>,
    log: Vec<OperationLogEntry>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operations (test helper).
    pub fn operation_count(&self) -> usize {
        self.inner.read().operations.len()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(&self, operation: Operation) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.operations.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists(operation.id));
        }
        inner.operations.insert(operation.id, operation);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, StoreError> {
        Ok(self.inner.read().operations.get(&id).cloned())
    }

    async fn merge_links(
        &self,
        id: Uuid,
        resources: &BTreeSet<Resource>,
        projects: &BTreeSet<Uuid>,
    ) -> Result<Operation, StoreError> {
        let mut inner = self.inner.write();
        let operation = inner
            .operations
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        operation.resources.extend(resources.iter().cloned());
        operation.projects.extend(projects.iter().copied());
        operation.updated_at = chrono::Utc::now();
        Ok(operation.clone())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OperationStatus,
        agent_name: Option<&str>,
        status_detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let operation = inner
            .operations
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        operation.status = status;
        if let Some(agent) = agent_name {
            operation.agent_name = Some(agent.to_string());
        }
        if let Some(detail) = status_detail {
            operation.status_detail = Some(detail.to_string());
        }
        operation.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn append_log(&self, entry: OperationLogEntry) -> Result<(), StoreError> {
        self.inner.write().log.push(entry);
        Ok(())
    }

    async fn log_entries(&self, operation_id: Uuid) -> Result<Vec<OperationLogEntry>, StoreError> {
        Ok(self
            .inner
            .read()
            .log
            .iter()
            .filter(|entry| entry.operation_id == operation_id)
            .cloned()
            .collect())
    }
}

/// Fixed resource → project mapping for tests and embedded use.
#[derive(Default)]
pub struct StaticProjectResolver {
    mapping: RwLock<HashMap<Uuid, Uuid>>,
}

impl StaticProjectResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, resource_id: Uuid, project_id: Uuid) {
        self.mapping.write().insert(resource_id, project_id);
    }
}

#[async_trait]
impl ProjectResolver for StaticProjectResolver {
    async fn resolve_projects(&self, resource_ids: &[Uuid]) -> Result<BTreeSet<Uuid>, StoreError> {
        let mapping = self.mapping.read();
        Ok(resource_ids
            .iter()
            .filter_map(|id| mapping.get(id).copied())
            .collect())
    }
}
