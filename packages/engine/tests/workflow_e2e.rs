//! End-to-end workflow tests through the orchestrator
//!
//! Uses the scripted runtime, so no worker processes are spawned.

use conductor_engine::executor::{TaskDefinition, TaskStatus, WorkflowOptions, WorkflowStatus};
use conductor_engine::state::{SqliteStore, WorkflowRepository};
use conductor_engine::utils::config::{EngineConfig, StorageBackend};
use conductor_engine::utils::ids::TaskId;
use conductor_engine::{EngineError, Orchestrator, ScriptedRuntime, WorkflowDefinition};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn orchestrator() -> Orchestrator {
    Orchestrator::new(EngineConfig::default(), Arc::new(ScriptedRuntime::new())).unwrap()
}

fn ids(tasks: &[conductor_engine::executor::Task]) -> BTreeSet<String> {
    tasks.iter().map(|t| t.id.to_string()).collect()
}

fn fan_out() -> Vec<TaskDefinition> {
    vec![
        TaskDefinition::new("T1", "search"),
        TaskDefinition::new("T2", "writer").depends_on(["T1"]),
        TaskDefinition::new("T3", "writer").depends_on(["T1"]),
    ]
}

// ============================================================================
// Ready-set progression
// ============================================================================

#[tokio::test]
async fn test_fan_out_progression() {
    let orch = orchestrator();
    let wf = orch
        .create_workflow("fan-out", "", fan_out(), "tester", WorkflowOptions::default())
        .await
        .unwrap();

    let initial = orch.start_workflow(wf.id).await.unwrap();
    assert_eq!(ids(&initial), BTreeSet::from(["T1".to_string()]));

    let assigned = orch.assign_ready(wf.id).await.unwrap();
    assert_eq!(assigned.len(), 1);

    let completion = orch
        .complete_task(wf.id, &TaskId::new("T1"), json!({"found": 12}))
        .await
        .unwrap();
    assert_eq!(
        ids(&completion.newly_ready),
        BTreeSet::from(["T2".to_string(), "T3".to_string()])
    );
    assert_eq!(completion.workflow_status, WorkflowStatus::Running);

    orch.assign_ready(wf.id).await.unwrap();
    orch.complete_task(wf.id, &TaskId::new("T2"), json!("draft a"))
        .await
        .unwrap();
    let last = orch
        .complete_task(wf.id, &TaskId::new("T3"), json!("draft b"))
        .await
        .unwrap();

    assert_eq!(last.workflow_status, WorkflowStatus::Completed);
    let finished = orch.get_workflow(wf.id).unwrap();
    assert!(finished.completed_at.is_some());
}

#[tokio::test]
async fn test_completion_requires_assignment() {
    let orch = orchestrator();
    let wf = orch
        .create_workflow("fan-out", "", fan_out(), "tester", WorkflowOptions::default())
        .await
        .unwrap();
    orch.start_workflow(wf.id).await.unwrap();

    // Waiting tasks cannot jump straight to Completed
    let result = orch
        .complete_task(wf.id, &TaskId::new("T1"), json!(null))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidState(_))));
    assert_eq!(
        orch.get_task(wf.id, &TaskId::new("T1")).unwrap().status,
        TaskStatus::Waiting
    );
}

#[tokio::test]
async fn test_double_completion_is_rejected() {
    let orch = orchestrator();
    let wf = orch
        .create_workflow("fan-out", "", fan_out(), "tester", WorkflowOptions::default())
        .await
        .unwrap();
    orch.start_workflow(wf.id).await.unwrap();
    orch.assign_ready(wf.id).await.unwrap();

    orch.complete_task(wf.id, &TaskId::new("T1"), json!(1))
        .await
        .unwrap();
    let second = orch.complete_task(wf.id, &TaskId::new("T1"), json!(2)).await;

    assert!(matches!(second, Err(EngineError::InvalidState(_))));
    let task = orch.get_task(wf.id, &TaskId::new("T1")).unwrap();
    assert_eq!(task.output, Some(json!(1)));
    assert_eq!(orch.ready_tasks(wf.id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cycle_is_rejected_and_nothing_registered() {
    let orch = orchestrator();
    let result = orch
        .create_workflow(
            "cyclic",
            "",
            vec![
                TaskDefinition::new("A", "search").depends_on(["B"]),
                TaskDefinition::new("B", "search").depends_on(["A"]),
            ],
            "tester",
            WorkflowOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(EngineError::Validation(_))));
    assert!(orch.list_workflows(None).is_empty());
}

// ============================================================================
// Definitions and persistence
// ============================================================================

#[tokio::test]
async fn test_yaml_definition_runs_to_completion() {
    let definition = WorkflowDefinition::from_yaml(
        r#"
name: report
tasks:
  - id: gather
    capability: search
    input: { query: "rust" }
  - id: write
    capability: writer
    dependencies: [gather]
    priority: 5
"#,
    )
    .unwrap();

    let orch = orchestrator();
    let wf = orch.submit_definition(definition).await.unwrap();
    let finished = orch.run_workflow(wf.id).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.created_by, "conductor");
    let gather = finished.task(&TaskId::new("gather")).unwrap();
    assert_eq!(gather.output.as_ref().unwrap()["input"]["query"], "rust");
}

#[tokio::test]
async fn test_sqlite_storage_keeps_final_state() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("conductor.db");

    let mut config = EngineConfig::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.path = db_path.clone();

    let orch = Orchestrator::new(config, Arc::new(ScriptedRuntime::new())).unwrap();
    let wf = orch
        .create_workflow("fan-out", "", fan_out(), "tester", WorkflowOptions::default())
        .await
        .unwrap();
    orch.run_workflow(wf.id).await.unwrap();
    orch.shutdown().await;

    let store = SqliteStore::open(&db_path).unwrap();
    let stored = WorkflowRepository::find_by_id(&store, wf.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert!(WorkflowRepository::find_active(&store).await.unwrap().is_empty());
}
