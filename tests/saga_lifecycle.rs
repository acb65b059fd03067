//! End-to-end operation lifecycle through the saga workflow engine:
//! dispatch, acceptance, progress, convergence and the monotonicity of
//! terminal states.

mod common;

use common::{build_system, default_system, ConvergeCatletCommand, UpdateInventoryCommand};
use opflow_core::config::{OrchestratorConfig, AGENT_BROADCAST_TOPIC};
use opflow_core::messaging::{BusMessage, MessageTransport, OperationEvent};
use opflow_core::models::{OperationStatus, Resource};
use opflow_core::store::OperationStore;
use uuid::Uuid;

fn machines(n: usize) -> Vec<Resource> {
    (0..n).map(|_| Resource::machine(Uuid::new_v4())).collect()
}

#[tokio::test]
async fn operation_runs_to_completion() {
    let sys = default_system();
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    let task_id = result.tasks[0].task_id;
    assert_eq!(result.operation.status, OperationStatus::Queued);

    sys.settle().await;
    sys.accept(operation_id, task_id, "agent-1").await;
    let running = sys
        .wait_for_status(operation_id, OperationStatus::Running)
        .await;
    assert_eq!(running.agent_name.as_deref(), Some("agent-1"));

    sys.progress(operation_id, task_id, "converging network adapters")
        .await;
    sys.complete(operation_id, task_id).await;
    sys.wait_for_status(operation_id, OperationStatus::Completed)
        .await;

    // The progress report landed in the log before completion.
    let entries = sys.store.log_entries(operation_id).await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.message == "converging network adapters"));
    sys.settle().await;
    assert_eq!(sys.engine.live_sagas(), 0);
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    let sys = default_system();
    let mut events = sys.engine.subscribe_events();
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    let task_id = result.tasks[0].task_id;

    sys.settle().await;
    sys.accept(operation_id, task_id, "agent-1").await;
    sys.complete(operation_id, task_id).await;
    sys.wait_for_status(operation_id, OperationStatus::Completed)
        .await;

    let deadline = std::time::Duration::from_secs(5);
    let accepted = tokio::time::timeout(deadline, events.recv())
        .await
        .unwrap()
        .unwrap();
    let OperationEvent::Accepted {
        operation_id: accepted_id,
        agent_name,
    } = accepted
    else {
        panic!("expected acceptance event, got {accepted:?}");
    };
    assert_eq!(accepted_id, operation_id);
    assert_eq!(agent_name, "agent-1");

    let completed = tokio::time::timeout(deadline, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        completed,
        OperationEvent::Completed { operation_id: id } if id == operation_id
    ));
}

#[tokio::test]
async fn duplicate_acceptance_is_a_no_op() {
    let sys = default_system();
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    let task_id = result.tasks[0].task_id;

    sys.settle().await;
    sys.accept(operation_id, task_id, "agent-1").await;
    sys.wait_for_status(operation_id, OperationStatus::Running)
        .await;

    // Redelivered acceptance, and a second agent racing in late.
    sys.accept(operation_id, task_id, "agent-1").await;
    sys.accept(operation_id, task_id, "agent-2").await;
    sys.settle().await;

    let operation = sys.store.get(operation_id).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Running);
    assert_eq!(operation.agent_name.as_deref(), Some("agent-1"));
}

#[tokio::test]
async fn multi_task_operation_completes_on_last_task() {
    let sys = default_system();
    let resources = machines(3);
    for resource in &resources {
        sys.agent_resolver.assign(resource.resource_id, "agent-1");
    }

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            resources,
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    assert_eq!(result.tasks.len(), 3);

    sys.settle().await;
    sys.accept(operation_id, result.tasks[0].task_id, "agent-1")
        .await;

    // Two of three done: still running.
    sys.complete(operation_id, result.tasks[0].task_id).await;
    sys.complete(operation_id, result.tasks[1].task_id).await;
    sys.settle().await;
    let operation = sys.store.get(operation_id).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Running);

    sys.complete(operation_id, result.tasks[2].task_id).await;
    sys.wait_for_status(operation_id, OperationStatus::Completed)
        .await;
}

#[tokio::test]
async fn first_task_failure_fails_the_operation() {
    let sys = default_system();
    let resources = machines(3);
    for resource in &resources {
        sys.agent_resolver.assign(resource.resource_id, "agent-1");
    }

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            resources,
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;

    sys.settle().await;
    sys.accept(operation_id, result.tasks[0].task_id, "agent-1")
        .await;
    sys.complete(operation_id, result.tasks[0].task_id).await;
    sys.fail(operation_id, result.tasks[1].task_id, "disk attach rejected")
        .await;

    let operation = sys
        .wait_for_status(operation_id, OperationStatus::Failed)
        .await;
    assert_eq!(
        operation.status_detail.as_deref(),
        Some("disk attach rejected")
    );
}

#[tokio::test]
async fn terminal_operation_is_never_resurrected() {
    let sys = default_system();
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    let task_id = result.tasks[0].task_id;

    sys.settle().await;
    sys.accept(operation_id, task_id, "agent-1").await;
    sys.complete(operation_id, task_id).await;
    sys.wait_for_status(operation_id, OperationStatus::Completed)
        .await;

    // Late duplicates and contradictory reports are all dropped.
    sys.fail(operation_id, task_id, "late failure report").await;
    sys.accept(operation_id, task_id, "agent-2").await;
    sys.complete(operation_id, task_id).await;
    sys.settle().await;

    let operation = sys.store.get(operation_id).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Completed);
    assert!(operation.status_detail.is_none());
    assert_eq!(sys.engine.live_sagas(), 0);
}

#[tokio::test]
async fn batched_command_is_broadcast_to_all_agents() {
    let sys = default_system();
    let mut broadcasts = sys.transport.subscribe_broadcast(AGENT_BROADCAST_TOPIC);

    let result = sys
        .dispatcher
        .start_new(
            UpdateInventoryCommand {
                resources: machines(2),
            },
            Vec::new(),
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    assert_eq!(result.tasks.len(), 1);

    let message = broadcasts.recv().await.unwrap();
    let BusMessage::Task(envelope) = message else {
        panic!("expected task envelope on broadcast topic, got {message:?}");
    };
    assert_eq!(envelope.task_id, result.tasks[0].task_id);
    assert_eq!(envelope.command_type_tag, "update_inventory");
}

#[tokio::test]
async fn unaccepted_operation_fails_after_deadline() {
    let sys = build_system(OrchestratorConfig {
        acceptance_timeout_secs: Some(1),
        ..OrchestratorConfig::default()
    });
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();

    let operation = sys
        .wait_for_status(result.operation.id, OperationStatus::Failed)
        .await;
    let detail = operation.status_detail.unwrap();
    assert!(detail.contains("not accepted"), "detail: {detail}");
    sys.settle().await;
    assert_eq!(sys.engine.live_sagas(), 0);
}

#[tokio::test]
async fn accepted_operation_outlives_the_deadline() {
    let sys = build_system(OrchestratorConfig {
        acceptance_timeout_secs: Some(1),
        ..OrchestratorConfig::default()
    });
    let resource = Resource::machine(Uuid::new_v4());
    sys.agent_resolver.assign(resource.resource_id, "agent-1");

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();
    let operation_id = result.operation.id;
    let task_id = result.tasks[0].task_id;

    sys.settle().await;
    sys.accept(operation_id, task_id, "agent-1").await;
    sys.wait_for_status(operation_id, OperationStatus::Running)
        .await;

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let operation = sys.store.get(operation_id).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Running);
}

#[tokio::test]
async fn unresolved_agent_leaves_operation_queued_by_default() {
    let sys = default_system();
    let resource = Resource::machine(Uuid::new_v4());

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource],
            Uuid::new_v4(),
        )
        .await
        .unwrap();

    sys.settle().await;
    let operation = sys.store.get(result.operation.id).await.unwrap().unwrap();
    assert_eq!(operation.status, OperationStatus::Queued);
}

#[tokio::test]
async fn unresolved_agent_fails_operation_when_configured() {
    let sys = build_system(OrchestratorConfig {
        fail_on_unresolved_agent: true,
        ..OrchestratorConfig::default()
    });
    let resource = Resource::machine(Uuid::new_v4());

    let result = sys
        .dispatcher
        .start_new(
            ConvergeCatletCommand::default(),
            vec![resource.clone()],
            Uuid::new_v4(),
        )
        .await
        .unwrap();

    let operation = sys
        .wait_for_status(result.operation.id, OperationStatus::Failed)
        .await;
    let detail = operation.status_detail.unwrap();
    assert!(detail.contains("no agent resolved"), "detail: {detail}");
    assert!(detail.contains(&resource.resource_id.to_string()));
}
