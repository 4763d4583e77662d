// packages/engine/src/runtime/agent_runtime.rs
//! Agent runtime capability
//!
//! The engine never executes work itself. Everything an agent does goes
//! through an opaque [`RuntimeHandle`] obtained from an [`AgentRuntime`]:
//! - Handle creation for a configuration + constraints snapshot
//! - Execution of a task input
//! - Resource usage probing
//! - Graceful termination with forced escalation after a grace period

use crate::runtime::resource_limiter::{SecurityConstraints, SecurityLevel};
use crate::utils::errors::Result;
use crate::utils::ids::Capability;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Data-driven configuration of one agent instance
///
/// Behaviour varies by data (role, goal, tools), never by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Human readable instance name
    pub name: String,

    /// Capability this instance provides
    pub capability: Capability,

    pub role: String,

    pub goal: String,

    /// Tools the agent intends to use (checked against constraints)
    pub tools: Vec<String>,

    /// Level the constraints snapshot was derived from
    pub security_level: SecurityLevel,

    /// Free-form parameters handed to the runtime
    #[serde(default)]
    pub parameters: serde_json::Value,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, capability: impl Into<Capability>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            role: String::new(),
            goal: String::new(),
            tools: vec![],
            security_level: SecurityLevel::Standard,
            parameters: serde_json::Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }
}

/// Opaque handle to a running agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeHandle {
    /// Runtime-assigned identifier
    pub id: String,

    /// Process ID, when the runtime is process-backed
    pub pid: Option<u32>,

    pub started_at: DateTime<Utc>,
}

impl RuntimeHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pid: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// One resource usage sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Capability the engine consumes to run agents
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create a handle for a new agent
    async fn create_handle(
        &self,
        config: &AgentConfig,
        constraints: &SecurityConstraints,
    ) -> Result<RuntimeHandle>;

    /// Execute one task input and return its output
    async fn execute(
        &self,
        handle: &RuntimeHandle,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Sample current resource usage
    async fn probe(&self, handle: &RuntimeHandle) -> Result<ResourceUsage>;

    /// Request graceful termination, forcing it after `grace_period`
    async fn terminate(&self, handle: &RuntimeHandle, grace_period: Duration) -> Result<()>;
}
