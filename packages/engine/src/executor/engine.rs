// packages/engine/src/executor/engine.rs
//! Workflow engine
//!
//! Owns every workflow's task graph. Each workflow sits behind its own
//! mutex, so operations on one workflow apply in arrival order while
//! different workflows progress independently.
//!
//! Task lifecycle:
//!
//! ```text
//! Waiting ──▶ Assigned ──▶ InProgress ──▶ Completed
//!    │            │             │
//!    │            └─────────────┴──▶ Failed ──▶ Waiting (retry)
//!    └──▶ Skipped ◀─────────────────────┘
//! ```

use crate::events::{Notifier, StateChange};
use crate::executor::graph;
use crate::executor::workflow::{
    FailurePolicy, Task, TaskDefinition, TaskStatus, Workflow, WorkflowOptions, WorkflowStatus,
};
use crate::observability;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{Capability, InstanceId, TaskId, WorkflowId};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of completing a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskCompletion {
    pub task: Task,
    /// Tasks that became ready because of this completion
    pub newly_ready: Vec<Task>,
    pub workflow_status: WorkflowStatus,
}

/// Result of failing a task
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task: Task,
    /// Dependents skipped by the failure policy
    pub skipped: Vec<TaskId>,
    pub workflow_status: WorkflowStatus,
}

/// Registry of workflows and their task graphs
pub struct WorkflowEngine {
    workflows: DashMap<WorkflowId, Arc<Mutex<Workflow>>>,
    notifier: Notifier,
}

impl WorkflowEngine {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            workflows: DashMap::new(),
            notifier,
        }
    }

    /// Validate a task graph and register it as a Pending workflow
    pub fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        task_defs: Vec<TaskDefinition>,
        created_by: impl Into<String>,
        options: WorkflowOptions,
    ) -> Result<Workflow> {
        let name = name.into();
        graph::validate(&task_defs)?;

        for def in &task_defs {
            if let Some(policy) = &def.consensus {
                if policy.participants == 0 {
                    return Err(EngineError::Validation(format!(
                        "task '{}' requires at least one consensus participant",
                        def.id
                    )));
                }
            }
        }

        let workflow = Workflow {
            id: WorkflowId::new(),
            name,
            description: description.into(),
            tasks: task_defs.into_iter().map(Task::from).collect(),
            status: WorkflowStatus::Pending,
            options,
            created_by: created_by.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
        };

        info!(
            "Created workflow {} '{}' with {} tasks",
            workflow.id,
            workflow.name,
            workflow.tasks.len()
        );
        metrics::counter!(observability::WORKFLOWS_CREATED).increment(1);

        self.workflows
            .insert(workflow.id, Arc::new(Mutex::new(workflow.clone())));
        Ok(workflow)
    }

    /// Pending → Running; returns the initial ready set
    pub fn start(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        self.with_workflow(workflow_id, |wf, changes| {
            set_workflow_status(wf, WorkflowStatus::Running, None, changes)?;
            wf.started_at = Some(Utc::now());
            info!("Started workflow {}", wf.id);
            Ok(ready_of(wf))
        })
    }

    /// Waiting → Assigned for a ready task
    pub fn assign_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        instance_id: InstanceId,
    ) -> Result<Task> {
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if !is_ready(wf, task_id) {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {} and not ready for assignment",
                    task_id, task.status
                )));
            }

            set_task_status(wf, task_id, TaskStatus::Assigned, changes)?;
            let task = find_task_mut(wf, task_id)?;
            task.assigned_instance = Some(instance_id);
            task.assigned_at = Some(Utc::now());
            task.attempts += 1;
            task.error = None;

            debug!("Assigned task {} of {} to {}", task_id, workflow_id, instance_id);
            Ok(task.clone())
        })
    }

    /// Assigned → InProgress
    pub fn begin_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Task> {
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if task.status != TaskStatus::Assigned {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {}, expected assigned",
                    task_id, task.status
                )));
            }
            set_task_status(wf, task_id, TaskStatus::InProgress, changes)?;
            find_task(wf, task_id).cloned()
        })
    }

    /// Record a task's output and advance the graph
    pub fn complete_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        output: serde_json::Value,
    ) -> Result<TaskCompletion> {
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if !task.status.is_in_flight() {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {}, only assigned or in-progress tasks can complete",
                    task_id, task.status
                )));
            }

            set_task_status(wf, task_id, TaskStatus::Completed, changes)?;
            let task = find_task_mut(wf, task_id)?;
            task.output = Some(output);
            task.finished_at = Some(Utc::now());
            let task = task.clone();
            metrics::counter!(observability::TASKS_COMPLETED).increment(1);

            let satisfied = wf.satisfied_ids();
            if let Some((completed, missing)) = graph::find_unmet_completion(&wf.tasks, &satisfied) {
                let reason = format!(
                    "task '{}' completed while dependency '{}' is unsatisfied",
                    completed, missing
                );
                error!("Halting workflow {}: {}", wf.id, reason);
                set_workflow_status(wf, WorkflowStatus::Failed, Some(reason.clone()), changes)?;
                return Err(EngineError::InternalConsistency(reason));
            }

            let newly_ready = graph::compute_ready(&wf.tasks, &satisfied)
                .into_iter()
                .filter(|t| t.dependencies.contains(task_id))
                .cloned()
                .collect();

            settle(wf, changes)?;
            debug!("Completed task {} of {}", task_id, workflow_id);

            Ok(TaskCompletion {
                task,
                newly_ready,
                workflow_status: wf.status,
            })
        })
    }

    /// Record a task failure and apply the workflow's failure policy
    pub fn fail_task(
        &self,
        workflow_id: WorkflowId,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<TaskFailure> {
        let error = error.into();
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if !matches!(
                task.status,
                TaskStatus::Waiting | TaskStatus::Assigned | TaskStatus::InProgress
            ) {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {} and cannot fail",
                    task_id, task.status
                )));
            }
            // A Waiting task leaves Waiting only once its dependencies are met
            if task.status == TaskStatus::Waiting && !is_ready(wf, task_id) {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is blocked on its dependencies and cannot fail",
                    task_id
                )));
            }

            set_task_status(wf, task_id, TaskStatus::Failed, changes)?;
            let task = find_task_mut(wf, task_id)?;
            task.error = Some(error.clone());
            task.finished_at = Some(Utc::now());
            let task = task.clone();

            warn!("Task {} of {} failed: {}", task_id, workflow_id, error);
            metrics::counter!(observability::TASKS_FAILED).increment(1);

            let mut skipped = Vec::new();
            match wf.options.failure_policy {
                FailurePolicy::Block => {}
                FailurePolicy::SkipDependents => {
                    for dependent in graph::transitive_dependents(&wf.tasks, task_id) {
                        if find_task(wf, &dependent)?.status == TaskStatus::Waiting {
                            set_task_status(wf, &dependent, TaskStatus::Skipped, changes)?;
                            skipped.push(dependent);
                        }
                    }
                }
                FailurePolicy::FailWorkflow => {
                    let reason = format!("task '{}' failed: {}", task_id, error);
                    set_workflow_status(wf, WorkflowStatus::Failed, Some(reason), changes)?;
                }
            }

            settle(wf, changes)?;
            Ok(TaskFailure {
                task,
                skipped,
                workflow_status: wf.status,
            })
        })
    }

    /// Skip a Waiting or Failed task
    pub fn skip_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Vec<Task>> {
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if !matches!(task.status, TaskStatus::Waiting | TaskStatus::Failed) {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {} and cannot be skipped",
                    task_id, task.status
                )));
            }

            set_task_status(wf, task_id, TaskStatus::Skipped, changes)?;
            info!("Skipped task {} of {}", task_id, workflow_id);
            settle(wf, changes)?;
            Ok(ready_of(wf))
        })
    }

    /// Failed → Waiting; returns the ready set afterwards
    pub fn retry_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Vec<Task>> {
        self.with_workflow(workflow_id, |wf, changes| {
            require_running(wf)?;
            let task = find_task(wf, task_id)?;
            if task.status != TaskStatus::Failed {
                return Err(EngineError::InvalidState(format!(
                    "task '{}' is {}, only failed tasks can be retried",
                    task_id, task.status
                )));
            }

            set_task_status(wf, task_id, TaskStatus::Waiting, changes)?;
            let task = find_task_mut(wf, task_id)?;
            task.assigned_instance = None;
            task.output = None;
            task.finished_at = None;

            info!("Retrying task {} of {}", task_id, workflow_id);
            Ok(ready_of(wf))
        })
    }

    /// Fail a Pending or Running workflow
    pub fn fail_workflow(&self, workflow_id: WorkflowId, reason: impl Into<String>) -> Result<Workflow> {
        let reason = reason.into();
        self.with_workflow(workflow_id, |wf, changes| {
            set_workflow_status(wf, WorkflowStatus::Failed, Some(reason), changes)?;
            Ok(wf.clone())
        })
    }

    /// Cancel a workflow; returns the instances holding its in-flight tasks
    pub fn cancel(&self, workflow_id: WorkflowId) -> Result<Vec<InstanceId>> {
        self.with_workflow(workflow_id, |wf, changes| {
            set_workflow_status(
                wf,
                WorkflowStatus::Cancelled,
                Some("cancelled".to_string()),
                changes,
            )?;

            let in_flight: Vec<TaskId> = wf
                .tasks
                .iter()
                .filter(|t| t.status.is_in_flight())
                .map(|t| t.id.clone())
                .collect();

            let mut instances = Vec::with_capacity(in_flight.len());
            for task_id in in_flight {
                set_task_status(wf, &task_id, TaskStatus::Failed, changes)?;
                let task = find_task_mut(wf, &task_id)?;
                task.error = Some("workflow cancelled".to_string());
                task.finished_at = Some(Utc::now());
                if let Some(instance) = task.assigned_instance {
                    if !instances.contains(&instance) {
                        instances.push(instance);
                    }
                }
            }

            info!(
                "Cancelled workflow {} ({} instances to stop)",
                workflow_id,
                instances.len()
            );
            Ok(instances)
        })
    }

    /// Current ready set; empty unless the workflow is Running
    pub fn ready_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        let slot = self.slot(workflow_id)?;
        let wf = slot.lock();
        if wf.status != WorkflowStatus::Running {
            return Ok(vec![]);
        }
        Ok(ready_of(&wf))
    }

    pub fn get(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        Ok(self.slot(workflow_id)?.lock().clone())
    }

    pub fn get_task(&self, workflow_id: WorkflowId, task_id: &TaskId) -> Result<Task> {
        let slot = self.slot(workflow_id)?;
        let wf = slot.lock();
        let task = find_task(&wf, task_id)?.clone();
        Ok(task)
    }

    /// Workflows, oldest first
    pub fn list(&self, status: Option<WorkflowStatus>) -> Vec<Workflow> {
        let slots: Vec<Arc<Mutex<Workflow>>> =
            self.workflows.iter().map(|e| Arc::clone(e.value())).collect();

        let mut workflows: Vec<Workflow> = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|wf| status.map_or(true, |s| wf.status == s))
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        workflows
    }

    /// Ready but unassigned tasks across Running workflows, per capability
    pub fn pending_by_capability(&self) -> HashMap<Capability, usize> {
        let slots: Vec<Arc<Mutex<Workflow>>> =
            self.workflows.iter().map(|e| Arc::clone(e.value())).collect();

        let mut pending: HashMap<Capability, usize> = HashMap::new();
        for slot in slots {
            let wf = slot.lock();
            if wf.status != WorkflowStatus::Running {
                continue;
            }
            let satisfied = wf.satisfied_ids();
            for task in graph::compute_ready(&wf.tasks, &satisfied) {
                *pending.entry(task.capability.clone()).or_default() += 1;
            }
        }
        pending
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn slot(&self, workflow_id: WorkflowId) -> Result<Arc<Mutex<Workflow>>> {
        self.workflows
            .get(&workflow_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| EngineError::not_found("workflow", workflow_id))
    }

    /// Run `op` under the workflow's mutex, then publish its changes
    ///
    /// Changes are published even when `op` fails part-way, since they
    /// have already been applied.
    fn with_workflow<R>(
        &self,
        workflow_id: WorkflowId,
        op: impl FnOnce(&mut Workflow, &mut Vec<StateChange>) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(workflow_id)?;
        let mut changes = Vec::new();
        let result = {
            let mut wf = slot.lock();
            op(&mut wf, &mut changes)
        };
        self.notifier.notify_all(changes);
        result
    }
}

fn ready_of(wf: &Workflow) -> Vec<Task> {
    let satisfied = wf.satisfied_ids();
    graph::compute_ready(&wf.tasks, &satisfied)
        .into_iter()
        .cloned()
        .collect()
}

fn is_ready(wf: &Workflow, task_id: &TaskId) -> bool {
    let satisfied = wf.satisfied_ids();
    graph::compute_ready(&wf.tasks, &satisfied)
        .iter()
        .any(|t| &t.id == task_id)
}

fn require_running(wf: &Workflow) -> Result<()> {
    if wf.status != WorkflowStatus::Running {
        return Err(EngineError::InvalidState(format!(
            "workflow {} is {}, expected running",
            wf.id, wf.status
        )));
    }
    Ok(())
}

fn find_task<'a>(wf: &'a Workflow, task_id: &TaskId) -> Result<&'a Task> {
    wf.task(task_id)
        .ok_or_else(|| EngineError::not_found("task", task_id))
}

fn find_task_mut<'a>(wf: &'a mut Workflow, task_id: &TaskId) -> Result<&'a mut Task> {
    wf.task_mut(task_id)
        .ok_or_else(|| EngineError::not_found("task", task_id))
}

fn set_task_status(
    wf: &mut Workflow,
    task_id: &TaskId,
    next: TaskStatus,
    changes: &mut Vec<StateChange>,
) -> Result<()> {
    let workflow_id = wf.id;
    let task = find_task_mut(wf, task_id)?;
    if !task.status.can_transition_to(next) {
        return Err(EngineError::InvalidState(format!(
            "task '{}' cannot move from {} to {}",
            task_id, task.status, next
        )));
    }

    let from = task.status;
    task.status = next;
    changes.push(StateChange::TaskStatus {
        workflow_id,
        task_id: task_id.clone(),
        from,
        to: next,
    });
    Ok(())
}

fn set_workflow_status(
    wf: &mut Workflow,
    next: WorkflowStatus,
    reason: Option<String>,
    changes: &mut Vec<StateChange>,
) -> Result<()> {
    if !wf.status.can_transition_to(next) {
        return Err(EngineError::InvalidState(format!(
            "workflow {} cannot move from {} to {}",
            wf.id, wf.status, next
        )));
    }

    let from = wf.status;
    wf.status = next;
    if next.is_terminal() {
        wf.completed_at = Some(Utc::now());
        wf.failure_reason = reason;
    }

    match next {
        WorkflowStatus::Completed => {
            info!("Workflow {} completed", wf.id);
            metrics::counter!(observability::WORKFLOWS_COMPLETED).increment(1);
        }
        WorkflowStatus::Failed => {
            warn!("Workflow {} failed", wf.id);
            metrics::counter!(observability::WORKFLOWS_FAILED).increment(1);
        }
        _ => {}
    }

    changes.push(StateChange::WorkflowStatus {
        workflow_id: wf.id,
        from,
        to: next,
    });
    Ok(())
}

/// Finish a Running workflow once nothing is left to do
///
/// Completed when every task is Completed or Skipped. Under a non-blocking
/// failure policy a workflow whose remaining tasks are all settled with at
/// least one failure becomes Failed; under Block it waits for a retry/skip.
fn settle(wf: &mut Workflow, changes: &mut Vec<StateChange>) -> Result<()> {
    if wf.status != WorkflowStatus::Running {
        return Ok(());
    }

    let all_done = wf
        .tasks
        .iter()
        .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Skipped));
    if all_done {
        return set_workflow_status(wf, WorkflowStatus::Completed, None, changes);
    }

    let all_settled = wf.tasks.iter().all(|t| t.status.is_settled());
    if all_settled && wf.options.failure_policy != FailurePolicy::Block {
        let failed = wf
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        let reason = format!("{} task(s) failed", failed);
        return set_workflow_status(wf, WorkflowStatus::Failed, Some(reason), changes);
    }

    Ok(())
}
