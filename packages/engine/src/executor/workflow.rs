// packages/engine/src/executor/workflow.rs
//! Workflow and task data model

use crate::consensus::strategy::ConsensusStrategy;
use crate::utils::ids::{Capability, InstanceId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Workflow status; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Waiting, Assigned)
                | (Waiting, Skipped)
                | (Waiting, Failed)
                | (Assigned, InProgress)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Waiting)
                | (Failed, Skipped)
        )
    }

    /// Held by an instance
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    /// No further progress without operator action
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// What happens to the dependents of a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dependents stay Waiting until the task is retried or skipped
    #[default]
    Block,
    /// Transitive dependents become Skipped
    SkipDependents,
    /// The whole workflow fails
    FailWorkflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowOptions {
    pub failure_policy: FailurePolicy,
    /// Treat Skipped dependencies as satisfied
    pub skipped_satisfies_dependencies: bool,
}

/// Requirement that several instances agree on a task's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    /// Independent executions to collect
    pub participants: usize,
    pub strategy: ConsensusStrategy,
    /// Falls back to the engine default when absent
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Caller-supplied task description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub capability: Capability,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub consensus: Option<ConsensusPolicy>,
    /// Higher runs first among ready tasks
    #[serde(default)]
    pub priority: u32,
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>, capability: impl Into<Capability>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            dependencies: vec![],
            input: serde_json::Value::Null,
            consensus: None,
            priority: 0,
        }
    }

    pub fn depends_on<I, T>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_consensus(mut self, policy: ConsensusPolicy) -> Self {
        self.consensus = Some(policy);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub capability: Capability,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub assigned_instance: Option<InstanceId>,
    pub consensus: Option<ConsensusPolicy>,
    pub priority: u32,
    /// Times the task has been assigned
    pub attempts: u32,
    pub assigned_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<TaskDefinition> for Task {
    fn from(def: TaskDefinition) -> Self {
        Self {
            id: def.id,
            capability: def.capability,
            status: TaskStatus::Waiting,
            dependencies: def.dependencies,
            input: def.input,
            output: None,
            error: None,
            assigned_instance: None,
            consensus: def.consensus,
            priority: def.priority,
            attempts: 0,
            assigned_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub status: WorkflowStatus,
    pub options: WorkflowOptions,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Workflow {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    /// Ids that satisfy a dependency
    pub fn satisfied_ids(&self) -> HashSet<TaskId> {
        let skipped_counts = self.options.skipped_satisfies_dependencies;
        self.tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    || (skipped_counts && t.status == TaskStatus::Skipped)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn progress(&self) -> WorkflowProgress {
        let mut progress = WorkflowProgress {
            total: self.tasks.len(),
            ..WorkflowProgress::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Waiting => progress.waiting += 1,
                TaskStatus::Assigned | TaskStatus::InProgress => progress.in_flight += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
            }
        }
        progress
    }
}

/// Task counts per status group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowProgress {
    pub total: usize,
    pub waiting: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}
