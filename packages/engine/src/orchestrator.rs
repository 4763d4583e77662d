// packages/engine/src/orchestrator.rs
//! Orchestrator façade
//!
//! One context owning every registry. It pairs ready tasks with instances,
//! runs them through the agent runtime, opens consensus when a task asks
//! for agreement and drives the background loops.
//!
//! ```text
//! Orchestrator
//! ├─ WorkflowEngine         (task graphs)
//! ├─ AgentLifecycleManager  (instances + monitor)
//! ├─ AgentFactory           (templates)
//! ├─ ConsensusCoordinator   (requests + sweeper)
//! ├─ AutoScalingController  (policies + scaler)
//! ├─ Assignments            (busy instances)
//! └─ EventLog               (recent state changes)
//! ```

use crate::consensus::coordinator::{ConsensusCoordinator, ConsensusRequest};
use crate::consensus::strategy::{ConsensusOutcome, ConsensusStrategy};
use crate::events::{EventLog, EventLogStats, Notifier, StateEvent, StateObserver};
use crate::executor::definition::WorkflowDefinition;
use crate::executor::engine::{TaskCompletion, TaskFailure, WorkflowEngine};
use crate::executor::workflow::{
    ConsensusPolicy, Task, TaskDefinition, Workflow, WorkflowOptions, WorkflowStatus,
};
use crate::observability;
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::factory::AgentFactory;
use crate::runtime::lifecycle::{
    AgentLifecycleManager, AgentStatus, FleetMetrics, LifecycleConfig, ManagedAgentInstance,
};
use crate::scaling::autoscaler::{AutoScalingController, ScalerConfig};
use crate::scaling::policy::{ScalingAction, ScalingPolicy};
use crate::state::Repositories;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{Capability, InstanceId, RequestId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A task held by an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentAssignment {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub instance_id: InstanceId,
    pub priority: u32,
    pub assigned_at: DateTime<Utc>,
}

/// What happened to one ready task during dispatch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed {
        task_id: TaskId,
        instance_id: InstanceId,
    },
    Failed {
        task_id: TaskId,
        instance_id: InstanceId,
        error: String,
    },
    /// No instance could take the task; it stays Waiting
    Deferred { task_id: TaskId, reason: String },
}

impl DispatchOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DispatchOutcome::Completed { task_id, .. }
            | DispatchOutcome::Failed { task_id, .. }
            | DispatchOutcome::Deferred { task_id, .. } => task_id,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, DispatchOutcome::Deferred { .. })
    }
}

/// Engine-wide aggregate
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub agents: FleetMetrics,
    pub busy_instances: usize,
    pub workflows_by_status: BTreeMap<String, usize>,
    pub open_consensus_requests: usize,
    pub scaling_policies: usize,
    pub events: EventLogStats,
}

pub struct Orchestrator {
    config: EngineConfig,
    notifier: Notifier,
    events: Arc<EventLog>,
    workflows: WorkflowEngine,
    lifecycle: Arc<AgentLifecycleManager>,
    factory: AgentFactory,
    consensus: Arc<ConsensusCoordinator>,
    scaler: AutoScalingController,
    repos: Repositories,
    /// Busy instances and the task each one holds
    assignments: DashMap<InstanceId, AgentAssignment>,
    /// Serializes instance acquisition per capability
    acquisition: DashMap<Capability, Arc<AsyncMutex<()>>>,
}

impl Orchestrator {
    /// Build every component from configuration
    pub fn new(config: EngineConfig, runtime: Arc<dyn AgentRuntime>) -> Result<Self> {
        config.validate()?;
        let repos = Repositories::from_config(&config.storage)?;

        let notifier = Notifier::new();
        let events = Arc::new(EventLog::new(config.observability.event_log_capacity));
        notifier.subscribe(events.clone());

        let lifecycle = Arc::new(AgentLifecycleManager::new(
            runtime,
            LifecycleConfig::from(&config),
            notifier.clone(),
        ));
        let consensus = Arc::new(ConsensusCoordinator::new(
            Duration::from_secs(config.consensus.default_timeout_secs),
            notifier.clone(),
        ));
        let scaler = AutoScalingController::new(ScalerConfig::from(&config), notifier.clone());
        for policy in config.scaling_policies()? {
            scaler.set_policy(policy)?;
        }

        info!(
            "Orchestrator ready ({} templates, {} scaling policies, {:?} storage)",
            config.agents.len(),
            scaler.policies().len(),
            config.storage.backend
        );

        Ok(Self {
            factory: AgentFactory::new(config.templates()),
            workflows: WorkflowEngine::new(notifier.clone()),
            config,
            notifier,
            events,
            lifecycle,
            consensus,
            scaler,
            repos,
            assignments: DashMap::new(),
            acquisition: DashMap::new(),
        })
    }

    /// Replace the configured repositories
    pub fn with_repositories(mut self, repos: Repositories) -> Self {
        self.repos = repos;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub fn lifecycle(&self) -> &Arc<AgentLifecycleManager> {
        &self.lifecycle
    }

    pub fn factory(&self) -> &AgentFactory {
        &self.factory
    }

    pub fn consensus(&self) -> &Arc<ConsensusCoordinator> {
        &self.consensus
    }

    pub fn scaler(&self) -> &AutoScalingController {
        &self.scaler
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub async fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        tasks: Vec<TaskDefinition>,
        created_by: impl Into<String>,
        options: WorkflowOptions,
    ) -> Result<Workflow> {
        let workflow = self
            .workflows
            .create(name, description, tasks, created_by, options)?;
        self.persist_workflow(workflow.id).await;
        Ok(workflow)
    }

    pub async fn submit_definition(&self, definition: WorkflowDefinition) -> Result<Workflow> {
        definition.validate()?;
        self.create_workflow(
            definition.name,
            definition.description,
            definition.tasks,
            definition.created_by,
            definition.options,
        )
        .await
    }

    /// Pending → Running; returns the initial ready set
    pub async fn start_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        let ready = self.workflows.start(workflow_id)?;
        self.persist_workflow(workflow_id).await;
        Ok(ready)
    }

    /// Run every ready task once through the agent runtime
    pub async fn dispatch_ready(&self, workflow_id: WorkflowId) -> Result<Vec<DispatchOutcome>> {
        let ready = self.workflows.ready_tasks(workflow_id)?;
        if ready.is_empty() {
            return Ok(vec![]);
        }

        debug!("Dispatching {} ready tasks of {}", ready.len(), workflow_id);
        let outcomes = join_all(
            ready
                .into_iter()
                .map(|task| self.dispatch_task(workflow_id, task)),
        )
        .await;

        self.persist_workflow(workflow_id).await;
        Ok(outcomes)
    }

    /// Start (if needed) and dispatch until no task can make progress
    pub async fn run_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        if self.workflows.get(workflow_id)?.status == WorkflowStatus::Pending {
            self.start_workflow(workflow_id).await?;
        }

        loop {
            let outcomes = self.dispatch_ready(workflow_id).await?;
            if outcomes.iter().all(DispatchOutcome::is_deferred) {
                for outcome in &outcomes {
                    if let DispatchOutcome::Deferred { task_id, reason } = outcome {
                        warn!("Task {} of {} deferred: {}", task_id, workflow_id, reason);
                    }
                }
                break;
            }
        }

        let workflow = self.workflows.get(workflow_id)?;
        info!(
            "Workflow {} quiescent with status {} ({}/{} tasks completed)",
            workflow_id,
            workflow.status,
            workflow.progress().completed,
            workflow.tasks.len()
        );
        Ok(workflow)
    }

    /// Assign every ready task to an instance without executing it
    ///
    /// The caller reports back through `complete_task` / `fail_task`.
    /// Consensus policies are only applied by `dispatch_ready`.
    pub async fn assign_ready(&self, workflow_id: WorkflowId) -> Result<Vec<AgentAssignment>> {
        let ready = self.workflows.ready_tasks(workflow_id)?;
        let mut assignments = Vec::with_capacity(ready.len());

        for task in ready {
            let instance_id = match self.acquire_instance(workflow_id, &task).await {
                Ok(id) => id,
                Err(e) => {
                    debug!("No instance for task {}: {}", task.id, e);
                    continue;
                }
            };
            if let Err(e) = self.start_task(workflow_id, &task.id, instance_id) {
                self.release(instance_id);
                return Err(e);
            }
            if let Some(assignment) = self.assignments.get(&instance_id) {
                assignments.push(assignment.value().clone());
            }
        }

        self.persist_workflow(workflow_id).await;
        Ok(assignments)
    }

    /// Record a task's output reported by an external executor
    pub async fn complete_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        output: serde_json::Value,
    ) -> Result<TaskCompletion> {
        let instance = self.workflows.get_task(workflow_id, task_id)?.assigned_instance;
        let completion = self.workflows.complete_task(workflow_id, task_id, output)?;

        if let Some(instance_id) = instance {
            self.record_outcome(instance_id, true);
            self.release(instance_id);
        }
        self.persist_workflow(workflow_id).await;
        Ok(completion)
    }

    /// Record a task failure reported by an external executor
    pub async fn fail_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<TaskFailure> {
        let task = self.workflows.get_task(workflow_id, task_id)?;
        let failure = self.workflows.fail_task(workflow_id, task_id, error)?;

        if let Some(instance_id) = task.assigned_instance.filter(|_| task.status.is_in_flight()) {
            self.record_outcome(instance_id, false);
            self.release(instance_id);
        }
        self.persist_workflow(workflow_id).await;
        Ok(failure)
    }

    pub async fn skip_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Vec<Task>> {
        let ready = self.workflows.skip_task(workflow_id, task_id)?;
        self.persist_workflow(workflow_id).await;
        Ok(ready)
    }

    pub async fn retry_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Vec<Task>> {
        let ready = self.workflows.retry_task(workflow_id, task_id)?;
        self.persist_workflow(workflow_id).await;
        Ok(ready)
    }

    /// Cancel a workflow, its open consensus requests and stop the
    /// instances holding its in-flight tasks
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<InstanceId>> {
        let holders = self.workflows.cancel(workflow_id)?;

        for request in self.consensus.list_open() {
            if request.workflow_id == workflow_id {
                if let Err(e) = self.consensus.cancel(request.id) {
                    debug!("Consensus {} already settled: {}", request.id, e);
                }
                self.persist_consensus(request.id).await;
            }
        }

        // Consensus participants beyond the lead hold the task too
        let mut instances: Vec<InstanceId> = self
            .assignments
            .iter()
            .filter(|a| a.workflow_id == workflow_id)
            .map(|a| a.instance_id)
            .collect();
        for id in holders {
            if !instances.contains(&id) {
                instances.push(id);
            }
        }

        let mut stopped = Vec::with_capacity(instances.len());
        for instance_id in instances {
            self.release(instance_id);
            match self.lifecycle.stop_agent(instance_id).await {
                Ok(_) => {
                    self.forget_instance(instance_id).await;
                    stopped.push(instance_id);
                }
                Err(e) => warn!("Failed to stop agent {} of cancelled {}: {}", instance_id, workflow_id, e),
            }
        }

        self.persist_workflow(workflow_id).await;
        Ok(stopped)
    }

    pub fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.workflows.get(workflow_id)
    }

    pub fn get_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Task> {
        self.workflows.get_task(workflow_id, task_id)
    }

    pub fn list_workflows(&self, status: Option<WorkflowStatus>) -> Vec<Workflow> {
        self.workflows.list(status)
    }

    pub fn ready_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        self.workflows.ready_tasks(workflow_id)
    }

    pub fn assignments(&self) -> Vec<AgentAssignment> {
        let mut assignments: Vec<AgentAssignment> =
            self.assignments.iter().map(|a| a.value().clone()).collect();
        assignments.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at));
        assignments
    }

    pub fn busy_instances(&self) -> HashSet<InstanceId> {
        self.assignments.iter().map(|a| *a.key()).collect()
    }

    // ------------------------------------------------------------------
    // Consensus
    // ------------------------------------------------------------------

    pub async fn create_consensus(
        &self,
        workflow_id: WorkflowId,
        topic: impl Into<String>,
        participants: Vec<InstanceId>,
        strategy: ConsensusStrategy,
        timeout: Option<Duration>,
    ) -> Result<ConsensusRequest> {
        self.workflows.get(workflow_id)?;
        let timeout = timeout.unwrap_or_else(|| self.consensus.default_timeout());
        let request = self
            .consensus
            .create_request(workflow_id, topic, participants, strategy, timeout)?;
        self.persist_consensus(request.id).await;
        Ok(request)
    }

    pub async fn submit_consensus_response(
        &self,
        request_id: RequestId,
        agent_id: InstanceId,
        decision: impl Into<String>,
        confidence: Option<f64>,
    ) -> Result<ConsensusRequest> {
        let result = self
            .consensus
            .submit_response(request_id, agent_id, decision, confidence);
        if matches!(&result, Ok(_) | Err(EngineError::ConsensusTimeout(_))) {
            self.persist_consensus(request_id).await;
        }
        result
    }

    pub async fn await_consensus(&self, request_id: RequestId) -> Result<ConsensusOutcome> {
        let outcome = self.consensus.await_result(request_id).await?;
        self.persist_consensus(request_id).await;
        Ok(outcome)
    }

    pub fn get_consensus(&self, request_id: RequestId) -> Result<ConsensusRequest> {
        self.consensus.get(request_id)
    }

    pub async fn cancel_consensus(&self, request_id: RequestId) -> Result<ConsensusOutcome> {
        let outcome = self.consensus.cancel(request_id)?;
        self.persist_consensus(request_id).await;
        Ok(outcome)
    }

    pub fn open_consensus(&self) -> Vec<ConsensusRequest> {
        self.consensus.list_open()
    }

    // ------------------------------------------------------------------
    // Scaling
    // ------------------------------------------------------------------

    pub fn set_scaling_policy(&self, policy: ScalingPolicy) -> Result<()> {
        self.scaler.set_policy(policy)
    }

    pub fn get_scaling_policy(&self, capability: &Capability) -> Option<ScalingPolicy> {
        self.scaler.get_policy(capability)
    }

    pub fn remove_scaling_policy(&self, capability: &Capability) -> Option<ScalingPolicy> {
        self.scaler.remove_policy(capability)
    }

    pub fn scaling_policies(&self) -> Vec<ScalingPolicy> {
        self.scaler.policies()
    }

    /// Take a load snapshot and return the actions it would trigger
    pub fn evaluate_scaling(&self) -> Vec<ScalingAction> {
        self.scaler
            .collect(&self.lifecycle, &self.workflows.pending_by_capability());
        self.scaler.evaluate(&self.lifecycle)
    }

    /// Snapshot, evaluate and execute; busy instances are never stopped
    pub async fn run_scaling_cycle(&self) -> Vec<(ScalingAction, Result<InstanceId>)> {
        let pending = self.workflows.pending_by_capability();
        let busy = self.busy_instances();
        let executed = self
            .scaler
            .run_cycle(&self.factory, &self.lifecycle, &pending, &busy)
            .await;

        for (action, result) in &executed {
            if let Ok(instance_id) = result {
                match self.lifecycle.get_status(*instance_id) {
                    Ok(instance) => self.persist_instance(&instance).await,
                    Err(_) => self.forget_instance(*instance_id).await,
                }
            }
            debug!("Scaling cycle: {} -> {:?}", action, result.as_ref().ok());
        }
        executed
    }

    /// Fill every policy-managed pool up to its minimum
    pub async fn prewarm(&self) -> Result<Vec<ManagedAgentInstance>> {
        let mut created = Vec::new();
        for policy in self.scaler.policies() {
            let instances = self
                .factory
                .prewarm(&policy.capability, policy.min_instances, &self.lifecycle)
                .await?;
            for instance in &instances {
                self.persist_instance(instance).await;
            }
            created.extend(instances);
        }
        Ok(created)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Start one instance from the capability's template
    pub async fn start_agent(&self, capability: &Capability) -> Result<ManagedAgentInstance> {
        let instance = self.factory.create(capability, &self.lifecycle).await?;
        self.persist_instance(&instance).await;
        Ok(instance)
    }

    pub fn list_agents(&self, filter: Option<AgentStatus>) -> Vec<ManagedAgentInstance> {
        self.lifecycle.list_agents(filter)
    }

    pub fn get_agent(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        self.lifecycle.get_status(id)
    }

    pub async fn pause_agent(
        &self,
        id: InstanceId,
        reason: impl Into<String>,
    ) -> Result<ManagedAgentInstance> {
        let instance = self.lifecycle.pause_agent(id, reason)?;
        self.persist_instance(&instance).await;
        Ok(instance)
    }

    pub async fn resume_agent(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        let instance = self.lifecycle.resume_agent(id)?;
        self.persist_instance(&instance).await;
        Ok(instance)
    }

    /// Stop an idle instance
    pub async fn stop_agent(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        if let Some(assignment) = self.assignments.get(&id) {
            return Err(EngineError::InvalidState(format!(
                "agent {} is busy with task '{}' of {}",
                id, assignment.task_id, assignment.workflow_id
            )));
        }
        let instance = self.lifecycle.stop_agent(id).await?;
        self.forget_instance(id).await;
        Ok(instance)
    }

    /// Write every registered instance through to the repository
    pub async fn sync_instances(&self) {
        for instance in self.lifecycle.list_agents(None) {
            self.persist_instance(&instance).await;
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn metrics(&self) -> OrchestratorMetrics {
        let mut workflows_by_status = BTreeMap::new();
        for workflow in self.workflows.list(None) {
            *workflows_by_status
                .entry(workflow.status.to_string())
                .or_insert(0) += 1;
        }

        OrchestratorMetrics {
            agents: self.lifecycle.fleet_metrics(),
            busy_instances: self.assignments.len(),
            workflows_by_status,
            open_consensus_requests: self.consensus.list_open().len(),
            scaling_policies: self.scaler.policies().len(),
            events: self.events.stats(),
        }
    }

    /// Remove and return up to `max` of the oldest retained state changes
    ///
    /// Destructive: drained events are gone for every other reader.
    pub fn drain_events(&self, max: usize) -> Vec<StateEvent> {
        self.events.drain(max)
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.notifier.subscribe(observer);
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Spawn the monitor, the consensus sweeper and (when enabled) the scaler
    pub fn start_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(Arc::clone(&self.lifecycle).run_monitor(cancel.clone())),
            tokio::spawn(Arc::clone(&self.consensus).run_sweeper(
                Duration::from_millis(self.config.consensus.sweep_interval_ms),
                cancel.clone(),
            )),
        ];

        if self.scaler.config().enabled {
            handles.push(tokio::spawn(Arc::clone(self).run_scaler(cancel)));
        } else {
            info!("Auto-scaling disabled");
        }
        handles
    }

    async fn run_scaler(self: Arc<Self>, cancel: CancellationToken) {
        let every = self.scaler.config().interval;
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Auto-scaler started (every {:?})", every);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_scaling_cycle().await;
                    self.sync_instances().await;
                    let pruned = self.consensus.prune_finalized(self.scaler.config().retention);
                    if pruned > 0 {
                        debug!("Pruned {} finalized consensus requests", pruned);
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Auto-scaler stopped");
                    break;
                }
            }
        }
    }

    /// Cancel open consensus requests and stop every instance
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");

        for request in self.consensus.list_open() {
            if self.consensus.cancel(request.id).is_ok() {
                self.persist_consensus(request.id).await;
            }
        }

        self.assignments.clear();
        let stopped = self.lifecycle.stop_all().await;
        for instance in &stopped {
            self.forget_instance(instance.id).await;
        }

        for workflow in self.workflows.list(None) {
            self.persist_workflow(workflow.id).await;
        }
        info!("Orchestrator stopped ({} agents terminated)", stopped.len());
    }

    // ------------------------------------------------------------------
    // Dispatch internals
    // ------------------------------------------------------------------

    async fn dispatch_task(&self, workflow_id: WorkflowId, task: Task) -> DispatchOutcome {
        if let Some(policy) = task.consensus.clone() {
            return self.dispatch_consensus(workflow_id, task, policy).await;
        }

        let instance_id = match self.acquire_instance(workflow_id, &task).await {
            Ok(id) => id,
            Err(e) => {
                return DispatchOutcome::Deferred {
                    task_id: task.id,
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = self.start_task(workflow_id, &task.id, instance_id) {
            self.release(instance_id);
            return DispatchOutcome::Deferred {
                task_id: task.id,
                reason: e.to_string(),
            };
        }

        let result = self.execute_on(instance_id, &task.input).await;
        self.record_outcome(instance_id, result.is_ok());
        let outcome = self.settle(workflow_id, &task.id, instance_id, result);
        self.release(instance_id);
        outcome
    }

    /// Run the task on several instances and reduce their decisions
    async fn dispatch_consensus(
        &self,
        workflow_id: WorkflowId,
        task: Task,
        policy: ConsensusPolicy,
    ) -> DispatchOutcome {
        let mut participants = Vec::with_capacity(policy.participants);
        for _ in 0..policy.participants {
            match self.acquire_instance(workflow_id, &task).await {
                Ok(id) => participants.push(id),
                Err(e) => {
                    participants.iter().for_each(|id| self.release(*id));
                    return DispatchOutcome::Deferred {
                        task_id: task.id,
                        reason: e.to_string(),
                    };
                }
            }
        }

        let lead = participants[0];
        if let Err(e) = self.start_task(workflow_id, &task.id, lead) {
            participants.iter().for_each(|id| self.release(*id));
            return DispatchOutcome::Deferred {
                task_id: task.id,
                reason: e.to_string(),
            };
        }

        let timeout = policy
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.consensus.default_timeout());
        let result = match self.consensus.create_request(
            workflow_id,
            format!("task '{}'", task.id),
            participants.clone(),
            policy.strategy,
            timeout,
        ) {
            Ok(request) => self.collect_verdict(request.id, &participants, &task).await,
            Err(e) => Err(e),
        };

        let outcome = self.settle(workflow_id, &task.id, lead, result);
        participants.iter().for_each(|id| self.release(*id));
        outcome
    }

    async fn collect_verdict(
        &self,
        request_id: RequestId,
        participants: &[InstanceId],
        task: &Task,
    ) -> Result<serde_json::Value> {
        let executions = participants.iter().map(|&id| async move {
            let result = self.execute_on(id, &task.input).await;
            (id, result)
        });

        for (id, result) in join_all(executions).await {
            self.record_outcome(id, result.is_ok());
            match result {
                Ok(output) => {
                    let (decision, confidence) = decision_of(&output);
                    if let Err(e) =
                        self.consensus
                            .submit_response(request_id, id, decision, confidence)
                    {
                        warn!("Response of {} to consensus {} rejected: {}", id, request_id, e);
                    }
                }
                Err(e) => warn!("Agent {} failed consensus task '{}': {}", id, task.id, e),
            }
        }

        // Every participant has answered or failed; nothing more can arrive
        let outcome = self.consensus.close(request_id)?;
        self.persist_consensus(request_id).await;

        if !outcome.consensus {
            return Err(EngineError::Execution(format!(
                "consensus not reached: {}",
                outcome.reason.as_deref().unwrap_or("unknown")
            )));
        }
        Ok(json!({
            "decision": outcome.decision,
            "confidence": outcome.confidence,
            "tally": outcome.tally,
            "responses": outcome.response_count,
            "request_id": request_id,
        }))
    }

    fn start_task(&self, workflow_id: WorkflowId, task_id: &TaskId, instance_id: InstanceId) -> Result<()> {
        self.workflows.assign_task(workflow_id, task_id, instance_id)?;
        self.workflows.begin_task(workflow_id, task_id)?;
        Ok(())
    }

    fn settle(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        instance_id: InstanceId,
        result: Result<serde_json::Value>,
    ) -> DispatchOutcome {
        let error = match result {
            Ok(output) => match self.workflows.complete_task(workflow_id, task_id, output) {
                Ok(_) => {
                    return DispatchOutcome::Completed {
                        task_id: task_id.clone(),
                        instance_id,
                    }
                }
                Err(e) => {
                    warn!("Could not complete task {} of {}: {}", task_id, workflow_id, e);
                    e.to_string()
                }
            },
            Err(e) => {
                let error = e.to_string();
                if let Err(inner) = self.workflows.fail_task(workflow_id, task_id, error.clone()) {
                    warn!("Could not fail task {} of {}: {}", task_id, workflow_id, inner);
                }
                error
            }
        };

        DispatchOutcome::Failed {
            task_id: task_id.clone(),
            instance_id,
            error,
        }
    }

    /// Reserve an idle Active instance, creating one when none is free
    ///
    /// Acquisitions of one capability are serialized, so the pool maximum
    /// holds under concurrent dispatch and a fresh instance is reserved
    /// before any other acquisition can see it.
    async fn acquire_instance(&self, workflow_id: WorkflowId, task: &Task) -> Result<InstanceId> {
        let lock = self.acquisition_lock(&task.capability);
        let guard = lock.lock().await;

        if let Some(id) = self.reserve_idle(workflow_id, task) {
            return Ok(id);
        }

        if let Some(policy) = self.scaler.get_policy(&task.capability) {
            if self.lifecycle.count_by_capability(&task.capability) >= policy.max_instances {
                return Err(EngineError::InvalidState(format!(
                    "{} pool is at its maximum of {} instances",
                    task.capability, policy.max_instances
                )));
            }
        }

        let instance = self.factory.create(&task.capability, &self.lifecycle).await?;
        self.assignments
            .insert(instance.id, assignment(workflow_id, task, instance.id));
        if let Err(e) = self.lifecycle.admit_request(instance.id) {
            self.release(instance.id);
            return Err(e);
        }
        drop(guard);

        self.persist_instance(&instance).await;
        Ok(instance.id)
    }

    fn acquisition_lock(&self, capability: &Capability) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.acquisition
                .entry(capability.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        )
    }

    fn reserve_idle(&self, workflow_id: WorkflowId, task: &Task) -> Option<InstanceId> {
        for instance in self.lifecycle.instances_of(&task.capability) {
            if instance.status != AgentStatus::Active {
                continue;
            }
            if let Entry::Vacant(slot) = self.assignments.entry(instance.id) {
                match self.lifecycle.admit_request(instance.id) {
                    Ok(true) => {
                        slot.insert(assignment(workflow_id, task, instance.id));
                        return Some(instance.id);
                    }
                    Ok(false) => continue,
                    Err(e) => debug!("Skipping agent {}: {}", instance.id, e),
                }
            }
        }
        None
    }

    async fn execute_on(&self, instance_id: InstanceId, input: &serde_json::Value) -> Result<serde_json::Value> {
        let handle = self.lifecycle.get_status(instance_id)?.handle;
        // Backstop only; it outlasts the runtime's own execution timeout
        let timeout = self.config.runtime.execution_timeout() + self.config.runtime.grace_period();

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.lifecycle.runtime().execute(&handle, input)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ExecutionTimeout),
        };
        metrics::histogram!(observability::TASK_DURATION).record(started.elapsed().as_secs_f64());
        result
    }

    fn record_outcome(&self, instance_id: InstanceId, success: bool) {
        if let Err(e) = self.lifecycle.record_task_outcome(instance_id, success) {
            debug!("Outcome for {} not recorded: {}", instance_id, e);
        }
    }

    fn release(&self, instance_id: InstanceId) {
        self.assignments.remove(&instance_id);
    }

    async fn persist_workflow(&self, workflow_id: WorkflowId) {
        let Ok(workflow) = self.workflows.get(workflow_id) else {
            return;
        };
        if let Err(e) = self.repos.workflows.save(&workflow).await {
            warn!("Failed to persist workflow {}: {}", workflow_id, e);
        }
    }

    async fn persist_consensus(&self, request_id: RequestId) {
        let Ok(request) = self.consensus.get(request_id) else {
            return;
        };
        match self.repos.consensus.save(&request).await {
            Ok(()) => {}
            // A newer version is already stored
            Err(EngineError::ConcurrencyConflict(_)) => {}
            Err(e) => warn!("Failed to persist consensus {}: {}", request_id, e),
        }
    }

    async fn persist_instance(&self, instance: &ManagedAgentInstance) {
        if let Err(e) = self.repos.instances.save(instance).await {
            warn!("Failed to persist agent {}: {}", instance.id, e);
        }
    }

    async fn forget_instance(&self, instance_id: InstanceId) {
        if let Err(e) = self.repos.instances.delete(instance_id).await {
            warn!("Failed to remove agent {} from storage: {}", instance_id, e);
        }
    }
}

fn assignment(workflow_id: WorkflowId, task: &Task, instance_id: InstanceId) -> AgentAssignment {
    AgentAssignment {
        workflow_id,
        task_id: task.id.clone(),
        instance_id,
        priority: task.priority,
        assigned_at: Utc::now(),
    }
}

/// Read `decision` and `confidence` from an agent's output
///
/// A bare string output is taken as the decision itself.
fn decision_of(output: &serde_json::Value) -> (String, Option<f64>) {
    let decision = match output.get("decision").unwrap_or(output) {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let confidence = output
        .get("confidence")
        .and_then(serde_json::Value::as_f64)
        .map(|c| c.clamp(0.0, 1.0));
    (decision, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::workflow::TaskStatus;
    use crate::runtime::agent_runtime::AgentConfig;
    use crate::runtime::scripted::ScriptedRuntime;
    use crate::state::WorkflowRepository;

    fn orchestrator(runtime: ScriptedRuntime) -> Orchestrator {
        Orchestrator::new(EngineConfig::default(), Arc::new(runtime)).unwrap()
    }

    fn diamond() -> Vec<TaskDefinition> {
        vec![
            TaskDefinition::new("t1", "search"),
            TaskDefinition::new("t2", "writer").depends_on(["t1"]),
            TaskDefinition::new("t3", "writer").depends_on(["t1"]),
        ]
    }

    #[tokio::test]
    async fn test_run_workflow_to_completion() {
        let orch = orchestrator(ScriptedRuntime::new());
        let wf = orch
            .create_workflow("diamond", "", diamond(), "tester", WorkflowOptions::default())
            .await
            .unwrap();

        let finished = orch.run_workflow(wf.id).await.unwrap();

        assert_eq!(finished.status, WorkflowStatus::Completed);
        assert!(finished.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert!(finished.tasks.iter().all(|t| t.output.is_some()));
        assert!(orch.busy_instances().is_empty());

        let stored = orch
            .repositories()
            .workflows
            .find_by_id(wf.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_idle_instances_are_reused() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let orch = Orchestrator::new(EngineConfig::default(), runtime.clone()).unwrap();
        let wf = orch
            .create_workflow(
                "chain",
                "",
                vec![
                    TaskDefinition::new("a", "search"),
                    TaskDefinition::new("b", "search").depends_on(["a"]),
                ],
                "tester",
                WorkflowOptions::default(),
            )
            .await
            .unwrap();

        orch.run_workflow(wf.id).await.unwrap();

        assert_eq!(orch.list_agents(None).len(), 1);
        assert_eq!(runtime.execution_count(), 2);
        let agent = &orch.list_agents(None)[0];
        assert_eq!(agent.metrics.tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_execution_failure_blocks_dependents() {
        let runtime = ScriptedRuntime::new().with_handler(|config: &AgentConfig, _input| {
            if config.capability.as_str() == "search" {
                Err(EngineError::Execution("upstream unavailable".to_string()))
            } else {
                Ok(json!("ok"))
            }
        });
        let orch = orchestrator(runtime);
        let wf = orch
            .create_workflow("diamond", "", diamond(), "tester", WorkflowOptions::default())
            .await
            .unwrap();

        let state = orch.run_workflow(wf.id).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Running);
        let t1 = state.task(&TaskId::new("t1")).unwrap();
        assert_eq!(t1.status, TaskStatus::Failed);
        assert!(t1.error.as_deref().unwrap().contains("upstream unavailable"));
        assert_eq!(state.task(&TaskId::new("t2")).unwrap().status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_consensus_task_completes_on_majority() {
        let runtime = ScriptedRuntime::new().with_handler(|config: &AgentConfig, _input| {
            let decision = if config.name.ends_with("-3") { "reject" } else { "approve" };
            Ok(json!({ "decision": decision, "confidence": 0.9 }))
        });
        let orch = orchestrator(runtime);
        let wf = orch
            .create_workflow(
                "review",
                "",
                vec![TaskDefinition::new("vote", "reviewer").with_consensus(ConsensusPolicy {
                    participants: 3,
                    strategy: ConsensusStrategy::Majority,
                    timeout_secs: Some(5),
                })],
                "tester",
                WorkflowOptions::default(),
            )
            .await
            .unwrap();

        let state = orch.run_workflow(wf.id).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        let output = state.tasks[0].output.clone().unwrap();
        assert_eq!(output["decision"], "approve");
        assert!((output["confidence"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-3);
        assert_eq!(orch.list_agents(None).len(), 3);
    }

    #[tokio::test]
    async fn test_consensus_task_fails_without_agreement() {
        let runtime = ScriptedRuntime::new().with_handler(|config: &AgentConfig, _input| {
            let decision = if config.name.ends_with("-1") { "approve" } else { "reject" };
            Ok(json!({ "decision": decision }))
        });
        let orch = orchestrator(runtime);
        let wf = orch
            .create_workflow(
                "review",
                "",
                vec![TaskDefinition::new("vote", "reviewer").with_consensus(ConsensusPolicy {
                    participants: 2,
                    strategy: ConsensusStrategy::Unanimous,
                    timeout_secs: Some(5),
                })],
                "tester",
                WorkflowOptions::default(),
            )
            .await
            .unwrap();

        let state = orch.run_workflow(wf.id).await.unwrap();

        let task = &state.tasks[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("consensus not reached"));
    }

    #[tokio::test]
    async fn test_failed_participant_does_not_wait_for_deadline() {
        let runtime = ScriptedRuntime::new().with_handler(|config: &AgentConfig, _input| {
            if config.name.ends_with("-3") {
                Err(EngineError::Execution("reviewer crashed".to_string()))
            } else {
                Ok(json!({ "decision": "approve" }))
            }
        });
        let orch = orchestrator(runtime);
        let wf = orch
            .create_workflow(
                "review",
                "",
                vec![TaskDefinition::new("vote", "reviewer").with_consensus(ConsensusPolicy {
                    participants: 3,
                    strategy: ConsensusStrategy::Majority,
                    timeout_secs: Some(600),
                })],
                "tester",
                WorkflowOptions::default(),
            )
            .await
            .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(5), orch.run_workflow(wf.id))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        let output = state.tasks[0].output.clone().unwrap();
        assert_eq!(output["decision"], "approve");
        assert_eq!(output["responses"], 2);
        assert!(orch.open_consensus().is_empty());
    }

    #[tokio::test]
    async fn test_external_assignment_flow() {
        let orch = orchestrator(ScriptedRuntime::new());
        let wf = orch
            .create_workflow("diamond", "", diamond(), "tester", WorkflowOptions::default())
            .await
            .unwrap();
        orch.start_workflow(wf.id).await.unwrap();

        let assigned = orch.assign_ready(wf.id).await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].task_id, TaskId::new("t1"));
        assert!(orch.busy_instances().contains(&assigned[0].instance_id));

        let completion = orch
            .complete_task(wf.id, &TaskId::new("t1"), json!({"hits": 3}))
            .await
            .unwrap();
        assert_eq!(completion.newly_ready.len(), 2);
        assert!(orch.busy_instances().is_empty());

        let second = orch
            .complete_task(wf.id, &TaskId::new("t1"), json!({"hits": 4}))
            .await;
        assert!(matches!(second, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_busy_agent_cannot_be_stopped() {
        let orch = orchestrator(ScriptedRuntime::new());
        let wf = orch
            .create_workflow("diamond", "", diamond(), "tester", WorkflowOptions::default())
            .await
            .unwrap();
        orch.start_workflow(wf.id).await.unwrap();
        let assigned = orch.assign_ready(wf.id).await.unwrap();

        let result = orch.stop_agent(assigned[0].instance_id).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_holders() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let orch = Orchestrator::new(EngineConfig::default(), runtime.clone()).unwrap();
        let wf = orch
            .create_workflow("diamond", "", diamond(), "tester", WorkflowOptions::default())
            .await
            .unwrap();
        orch.start_workflow(wf.id).await.unwrap();
        let assigned = orch.assign_ready(wf.id).await.unwrap();

        let stopped = orch.cancel_workflow(wf.id).await.unwrap();

        assert_eq!(stopped, vec![assigned[0].instance_id]);
        assert_eq!(orch.get_workflow(wf.id).unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(runtime.terminated().len(), 1);
        assert!(orch.busy_instances().is_empty());
    }

    #[tokio::test]
    async fn test_policy_maximum_defers_tasks() {
        let orch = orchestrator(ScriptedRuntime::new());
        orch.set_scaling_policy(ScalingPolicy::new("search", 0, 1)).unwrap();
        let wf = orch
            .create_workflow(
                "fan-out",
                "",
                vec![
                    TaskDefinition::new("a", "search"),
                    TaskDefinition::new("b", "search"),
                ],
                "tester",
                WorkflowOptions::default(),
            )
            .await
            .unwrap();
        orch.start_workflow(wf.id).await.unwrap();

        let assigned = orch.assign_ready(wf.id).await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(orch.list_agents(None).len(), 1);
    }

    #[tokio::test]
    async fn test_prewarm_and_metrics() {
        let orch = orchestrator(ScriptedRuntime::new());
        orch.set_scaling_policy(ScalingPolicy::new("search", 2, 4)).unwrap();

        let created = orch.prewarm().await.unwrap();
        assert_eq!(created.len(), 2);

        let metrics = orch.metrics();
        assert_eq!(metrics.agents.total, 2);
        assert_eq!(metrics.scaling_policies, 1);
        assert_eq!(metrics.busy_instances, 0);
        assert!(metrics.events.push_count >= 2);

        let retained = orch.metrics().events.current_size;
        let events = orch.drain_events(10);
        assert!(!events.is_empty());
        assert_eq!(orch.metrics().events.current_size, retained - events.len());
    }

    #[test]
    fn test_decision_of() {
        assert_eq!(
            decision_of(&json!({"decision": "approve", "confidence": 0.4})),
            ("approve".to_string(), Some(0.4))
        );
        assert_eq!(decision_of(&json!("reject")), ("reject".to_string(), None));
        assert_eq!(
            decision_of(&json!({"decision": true, "confidence": 3.0})),
            ("true".to_string(), Some(1.0))
        );
    }
}
