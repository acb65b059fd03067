//! Postgres store integration tests, gated on `DATABASE_URL`. Without a
//! configured database every test is a silent no-op, so the default
//! `cargo test` run needs no infrastructure.

use std::collections::BTreeSet;

use opflow_core::models::{Operation, OperationLogEntry, OperationStatus, Resource};
use opflow_core::store::{OperationStore, PostgresOperationStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

async fn connect() -> Option<PostgresOperationStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.expect("database unreachable");
    Some(PostgresOperationStore::new(pool))
}

fn operation_with(resources: BTreeSet<Resource>) -> Operation {
    Operation::new(Uuid::new_v4(), Uuid::new_v4(), resources, BTreeSet::new())
}

#[tokio::test]
async fn insert_get_round_trip() {
    let Some(store) = connect().await else { return };

    let resource = Resource::machine(Uuid::new_v4());
    let operation = operation_with(BTreeSet::from([resource.clone()]));
    store.insert(operation.clone()).await.unwrap();

    let loaded = store.get(operation.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, operation.id);
    assert_eq!(loaded.status, OperationStatus::Queued);
    assert!(loaded.resources.contains(&resource));

    let err = store.insert(operation).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn merge_links_extends_without_duplicates() {
    let Some(store) = connect().await else { return };

    let first = Resource::machine(Uuid::new_v4());
    let operation = operation_with(BTreeSet::from([first.clone()]));
    let id = operation.id;
    store.insert(operation).await.unwrap();

    let second = Resource::machine(Uuid::new_v4());
    let merged = store
        .merge_links(
            id,
            &BTreeSet::from([first.clone(), second.clone()]),
            &BTreeSet::new(),
        )
        .await
        .unwrap();
    assert_eq!(merged.resources.len(), 2);
    assert!(merged.resources.contains(&second));
}

#[tokio::test]
async fn status_update_and_log() {
    let Some(store) = connect().await else { return };

    let operation = operation_with(BTreeSet::new());
    let id = operation.id;
    store.insert(operation).await.unwrap();

    store
        .update_status(id, OperationStatus::Running, Some("agent-1"), None)
        .await
        .unwrap();
    store
        .update_status(id, OperationStatus::Failed, None, Some("disk full"))
        .await
        .unwrap();

    let loaded = store.get(id).await.unwrap().unwrap();
    assert_eq!(loaded.status, OperationStatus::Failed);
    assert_eq!(loaded.agent_name.as_deref(), Some("agent-1"));
    assert_eq!(loaded.status_detail.as_deref(), Some("disk full"));

    store
        .append_log(OperationLogEntry::new(
            id,
            None,
            "disk full",
            chrono::Utc::now(),
        ))
        .await
        .unwrap();
    let entries = store.log_entries(id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "disk full");
}
