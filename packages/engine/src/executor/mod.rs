// packages/engine/src/executor/mod.rs
//! Workflow execution
//!
//! - **Workflow**: workflows, tasks and their status machines
//! - **Graph**: validation and ready-set computation
//! - **Engine**: the per-workflow-locked registry that advances graphs
//! - **Definition**: YAML/JSON workflow files

pub mod definition;
pub mod engine;
pub mod graph;
pub mod workflow;

pub use definition::WorkflowDefinition;
pub use engine::{TaskCompletion, TaskFailure, WorkflowEngine};
pub use workflow::{
    ConsensusPolicy, FailurePolicy, Task, TaskDefinition, TaskStatus, Workflow, WorkflowOptions,
    WorkflowProgress, WorkflowStatus,
};
