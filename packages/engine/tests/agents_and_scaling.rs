//! Resource enforcement and auto-scaling through the orchestrator

use conductor_engine::events::StateChange;
use conductor_engine::runtime::{
    AgentStatus, AgentTemplate, ResourceUsage, ScriptedRuntime, SecurityLevel,
};
use conductor_engine::scaling::{ScalingDirection, ScalingPolicy};
use conductor_engine::state::ConsensusRepository;
use conductor_engine::utils::config::EngineConfig;
use conductor_engine::utils::ids::Capability;
use conductor_engine::{ConsensusStrategy, EngineError, Orchestrator};
use std::sync::Arc;
use std::time::Duration;

fn relaxed(capability: &str) -> AgentTemplate {
    AgentTemplate {
        security_level: SecurityLevel::Relaxed,
        ..AgentTemplate::generic(capability)
    }
}

#[tokio::test]
async fn test_memory_breach_pauses_and_never_stops() {
    let runtime = Arc::new(ScriptedRuntime::new());
    let orch = Orchestrator::new(EngineConfig::default(), runtime.clone()).unwrap();
    let search = Capability::new("search");

    let agent = orch.start_agent(&search).await.unwrap();
    let ceiling = agent.constraints.max_memory_mb as f64;
    runtime.set_usage(&agent.handle, 5.0, ceiling + 1.0);

    orch.lifecycle().sample_once().await;
    assert_eq!(orch.get_agent(agent.id).unwrap().status, AgentStatus::Paused);

    for _ in 0..3 {
        orch.lifecycle().sample_once().await;
    }
    let after = orch.get_agent(agent.id).unwrap();
    assert_eq!(after.status, AgentStatus::Paused);
    assert!(runtime.terminated().is_empty());

    let events = orch.drain_events(64);
    assert!(events.iter().any(|e| matches!(
        &e.change,
        StateChange::ConstraintViolated { instance_id, .. } if *instance_id == agent.id
    )));
}

#[tokio::test]
async fn test_resume_after_pause() {
    let orch = Orchestrator::new(EngineConfig::default(), Arc::new(ScriptedRuntime::new())).unwrap();
    let agent = orch.start_agent(&Capability::new("search")).await.unwrap();

    orch.pause_agent(agent.id, "maintenance").await.unwrap();
    let paused_again = orch.pause_agent(agent.id, "twice").await;
    assert!(matches!(paused_again, Err(EngineError::InvalidState(_))));

    let resumed = orch.resume_agent(agent.id).await.unwrap();
    assert_eq!(resumed.status, AgentStatus::Active);

    let stopped = orch.stop_agent(agent.id).await.unwrap();
    assert_eq!(stopped.status, AgentStatus::Stopped);
    assert!(orch.list_agents(None).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_allows_one_action() {
    let runtime = Arc::new(ScriptedRuntime::new());
    runtime.set_default_usage(ResourceUsage {
        cpu_percent: 90.0,
        memory_mb: 64.0,
    });
    let orch = Orchestrator::new(EngineConfig::default(), runtime.clone()).unwrap();
    let search = Capability::new("search");

    orch.factory().register_template(relaxed("search"));
    orch.set_scaling_policy(
        ScalingPolicy::new("search", 1, 4).with_cooldown(Duration::from_secs(300)),
    )
    .unwrap();
    orch.prewarm().await.unwrap();
    orch.lifecycle().sample_once().await;

    let first = orch.run_scaling_cycle().await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].0.direction, ScalingDirection::Up);
    assert!(first[0].1.is_ok());

    orch.lifecycle().sample_once().await;
    let second = orch.run_scaling_cycle().await;
    assert!(second.is_empty());
    assert!(orch.evaluate_scaling().is_empty());
    assert_eq!(orch.lifecycle().count_by_capability(&search), 2);

    tokio::time::advance(Duration::from_secs(301)).await;
    orch.lifecycle().sample_once().await;
    let third = orch.run_scaling_cycle().await;
    assert_eq!(third.len(), 1);
    assert_eq!(orch.lifecycle().count_by_capability(&search), 3);
}

#[tokio::test]
async fn test_manual_consensus_round() {
    let orch = Orchestrator::new(EngineConfig::default(), Arc::new(ScriptedRuntime::new())).unwrap();
    let wf = orch
        .create_workflow(
            "vote",
            "",
            vec![conductor_engine::TaskDefinition::new("t", "review")],
            "tester",
            conductor_engine::WorkflowOptions::default(),
        )
        .await
        .unwrap();

    let a = orch.start_agent(&Capability::new("review")).await.unwrap().id;
    let b = orch.start_agent(&Capability::new("review")).await.unwrap().id;
    let request = orch
        .create_consensus(wf.id, "ship it?", vec![a, b], ConsensusStrategy::Weighted, None)
        .await
        .unwrap();

    orch.submit_consensus_response(request.id, a, "approve", Some(0.9))
        .await
        .unwrap();
    orch.submit_consensus_response(request.id, b, "reject", Some(0.3))
        .await
        .unwrap();

    let outcome = orch.await_consensus(request.id).await.unwrap();
    assert!(outcome.consensus);
    assert_eq!(outcome.decision.as_deref(), Some("approve"));
    assert!((outcome.confidence - 0.75).abs() < 1e-9);

    let late = orch
        .submit_consensus_response(request.id, a, "reject", None)
        .await;
    assert!(matches!(late, Err(EngineError::AlreadyFinalized(_))));

    let stored = orch
        .repositories()
        .consensus
        .find_by_id(request.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.is_finalized());
}
