//! # Postgres Operation Store
//!
//! Maps the Operation aggregate onto the operations tables.
//!
//! ## Database Schema
//!
//! ```sql
//! CREATE TABLE operations (
//!   id UUID PRIMARY KEY,
//!   status TEXT NOT NULL,
//!   agent_name TEXT,
//!   tenant_id UUID NOT NULL,
//!   status_detail TEXT,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   updated_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE operation_resources (
//!   operation_id UUID NOT NULL REFERENCES operations(id),
//!   resource_id UUID NOT NULL,
//!   resource_type TEXT NOT NULL,
//!   UNIQUE (operation_id, resource_id, resource_type)
//! );
//! CREATE TABLE operation_projects (
//!   operation_id UUID NOT NULL REFERENCES operations(id),
//!   project_id UUID NOT NULL,
//!   UNIQUE (operation_id, project_id)
//! );
//! CREATE TABLE operation_log_entries (
//!   id UUID PRIMARY KEY,
//!   operation_id UUID NOT NULL REFERENCES operations(id),
//!   task_id UUID,
//!   message TEXT NOT NULL,
//!   timestamp TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! Queries are runtime-checked (`query_as::<_, Row>`) so the crate builds
//! without a live database; link inserts rely on `ON CONFLICT DO NOTHING`
//! for the union-only semantics.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{OperationStore, StoreError};
use crate::models::{Operation, OperationLogEntry, OperationStatus, Resource, ResourceType};

/// sqlx-backed store over a shared connection pool.
#[derive(Clone)]
pub struct PostgresOperationStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct OperationRow {
    id: Uuid,
    status: String,
    agent_name: Option<String>,
    tenant_id: Uuid,
    status_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ResourceRow {
    resource_id: Uuid,
    resource_type: String,
}

#[derive(Debug, FromRow)]
struct ProjectRow {
    project_id: Uuid,
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: Uuid,
    operation_id: Uuid,
    task_id: Option<Uuid>,
    message: String,
    timestamp: DateTime<Utc>,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_links(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        resources: &BTreeSet<Resource>,
        projects: &BTreeSet<Uuid>,
    ) -> Result<(), StoreError> {
        for resource in resources {
            sqlx::query(
                "INSERT INTO operation_resources (operation_id, resource_id, resource_type) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(resource.resource_id)
            .bind(resource.resource_type.to_string())
            .execute(&mut **tx)
            .await?;
        }
        for project in projects {
            sqlx::query(
                "INSERT INTO operation_projects (operation_id, project_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(project)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Operation>, StoreError> {
        let row = sqlx::query_as::<_, OperationRow>(
            "SELECT id, status, agent_name, tenant_id, status_detail, created_at, updated_at \
             FROM operations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let resources = sqlx::query_as::<_, ResourceRow>(
            "SELECT resource_id, resource_type FROM operation_resources WHERE operation_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let projects = sqlx::query_as::<_, ProjectRow>(
            "SELECT project_id FROM operation_projects WHERE operation_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let status: OperationStatus = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Database(e))?;

        Ok(Some(Operation {
            id: row.id,
            status,
            agent_name: row.agent_name,
            tenant_id: row.tenant_id,
            resources: resources
                .into_iter()
                .map(|r| {
                    let resource_type: ResourceType =
                        r.resource_type.parse().unwrap_or(ResourceType::Other(r.resource_type));
                    Resource::new(r.resource_id, resource_type)
                })
                .collect(),
            projects: projects.into_iter().map(|p| p.project_id).collect(),
            status_detail: row.status_detail,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
    async fn insert(&self, operation: Operation) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO operations (id, status, agent_name, tenant_id, status_detail, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING",
        )
        .bind(operation.id)
        .bind(operation.status.to_string())
        .bind(&operation.agent_name)
        .bind(operation.tenant_id)
        .bind(&operation.status_detail)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(operation.id));
        }

        Self::insert_links(&mut tx, operation.id, &operation.resources, &operation.projects)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, StoreError> {
        self.load(id).await
    }

    async fn merge_links(
        &self,
        id: Uuid,
        resources: &BTreeSet<Resource>,
        projects: &BTreeSet<Uuid>,
    ) -> Result<Operation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM operations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id));
        }

        Self::insert_links(&mut tx, id, resources, projects).await?;
        sqlx::query("UPDATE operations SET updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.load(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OperationStatus,
        agent_name: Option<&str>,
        status_detail: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE operations SET status = $2, \
             agent_name = COALESCE($3, agent_name), \
             status_detail = COALESCE($4, status_detail), \
             updated_at = $5 WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .bind(agent_name)
        .bind(status_detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn append_log(&self, entry: OperationLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO operation_log_entries (id, operation_id, task_id, message, timestamp) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id)
        .bind(entry.operation_id)
        .bind(entry.task_id)
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_entries(&self, operation_id: Uuid) -> Result<Vec<OperationLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, operation_id, task_id, message, timestamp \
             FROM operation_log_entries WHERE operation_id = $1 ORDER BY timestamp",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OperationLogEntry {
                id: row.id,
                operation_id: row.operation_id,
                task_id: row.task_id,
                message: row.message,
                timestamp: row.timestamp,
            })
            .collect())
    }
}
