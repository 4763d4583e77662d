//! Concurrent dispatch through the orchestrator
//!
//! `dispatch_ready` drives every ready task at once, so instance acquisition
//! interleaves with runtime handle creation and repository writes.

use async_trait::async_trait;
use conductor_engine::executor::{TaskDefinition, TaskStatus, WorkflowOptions, WorkflowStatus};
use conductor_engine::runtime::ManagedAgentInstance;
use conductor_engine::state::{InstanceRepository, MemoryStore, Repositories};
use conductor_engine::utils::config::EngineConfig;
use conductor_engine::utils::ids::{Capability, InstanceId};
use conductor_engine::{DispatchOutcome, Orchestrator, Result, ScalingPolicy, ScriptedRuntime};
use std::sync::Arc;
use std::time::Duration;

/// Instance repository whose writes take a while
struct SlowInstances {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl InstanceRepository for SlowInstances {
    async fn save(&self, instance: &ManagedAgentInstance) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        InstanceRepository::save(self.inner.as_ref(), instance).await
    }

    async fn find_by_id(&self, id: InstanceId) -> Result<Option<ManagedAgentInstance>> {
        InstanceRepository::find_by_id(self.inner.as_ref(), id).await
    }

    async fn find_active(&self) -> Result<Vec<ManagedAgentInstance>> {
        InstanceRepository::find_active(self.inner.as_ref()).await
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        InstanceRepository::delete(self.inner.as_ref(), id).await
    }
}

fn independent(n: usize) -> Vec<TaskDefinition> {
    (0..n)
        .map(|i| TaskDefinition::new(format!("s{}", i), "search"))
        .collect()
}

#[tokio::test]
async fn test_pool_maximum_holds_under_concurrent_dispatch() {
    let runtime = Arc::new(ScriptedRuntime::new().with_creation_delay(Duration::from_millis(20)));
    let orch = Orchestrator::new(EngineConfig::default(), runtime.clone()).unwrap();
    let search = Capability::new("search");
    orch.set_scaling_policy(ScalingPolicy::new("search", 0, 1)).unwrap();

    let wf = orch
        .create_workflow("burst", "", independent(3), "tester", WorkflowOptions::default())
        .await
        .unwrap();
    orch.start_workflow(wf.id).await.unwrap();

    let outcomes = orch.dispatch_ready(wf.id).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, DispatchOutcome::Completed { .. })));
    assert!(!outcomes
        .iter()
        .any(|o| matches!(o, DispatchOutcome::Failed { .. })));
    assert_eq!(orch.lifecycle().count_by_capability(&search), 1);

    // Deferred tasks run on the same instance in later rounds
    let finished = orch.run_workflow(wf.id).await.unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(orch.lifecycle().count_by_capability(&search), 1);
    assert_eq!(runtime.execution_count(), 3);
}

#[tokio::test]
async fn test_fresh_instance_is_never_shared() {
    let runtime = Arc::new(ScriptedRuntime::new().with_execution_delay(Duration::from_millis(20)));
    let store = Arc::new(MemoryStore::new());
    let repos = Repositories {
        workflows: store.clone(),
        consensus: store.clone(),
        instances: Arc::new(SlowInstances {
            inner: store,
            delay: Duration::from_millis(5),
        }),
    };
    let orch = Orchestrator::new(EngineConfig::default(), runtime.clone())
        .unwrap()
        .with_repositories(repos);

    let wf = orch
        .create_workflow("pair", "", independent(2), "tester", WorkflowOptions::default())
        .await
        .unwrap();
    orch.start_workflow(wf.id).await.unwrap();

    let outcomes = orch.dispatch_ready(wf.id).await.unwrap();

    let holders: Vec<InstanceId> = outcomes
        .iter()
        .map(|o| match o {
            DispatchOutcome::Completed { instance_id, .. } => *instance_id,
            other => panic!("unexpected outcome: {:?}", other),
        })
        .collect();
    assert_ne!(holders[0], holders[1]);
    assert_eq!(runtime.peak_concurrent_executions(), 1);
    assert_eq!(orch.list_agents(None).len(), 2);
    assert!(orch.busy_instances().is_empty());

    let workflow = orch.get_workflow(wf.id).unwrap();
    assert!(workflow
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed));
}
