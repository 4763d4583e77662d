// packages/engine/src/runtime/mod.rs
//! Agent runtime and lifecycle
//!
//! This module provides everything between the orchestrator and the
//! processes that do the actual work:
//!
//! - **Agent Runtime**: the capability trait every execution backend implements
//! - **Process Runtime**: one OS worker process per handle
//! - **Scripted Runtime**: in-memory backend for tests and dry runs
//! - **Resource Limiter**: security levels and per-instance ceilings
//! - **Lifecycle**: the instance registry, status machine and resource monitor
//! - **Factory**: template-driven instance creation and pre-warming
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               AgentLifecycleManager                  │
//! │   registry ─ monitor loop ─ rate admission           │
//! │         ▲                         │                  │
//! │   AgentFactory               probe / terminate       │
//! │   (templates)                     ▼                  │
//! │                   dyn AgentRuntime                   │
//! │           ┌───────────────┴───────────────┐          │
//! │     ProcessRuntime                 ScriptedRuntime    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent_runtime;
pub mod factory;
pub mod lifecycle;
pub mod process_manager;
pub mod resource_limiter;
pub mod scripted;

// Re-export commonly used types
pub use agent_runtime::{AgentConfig, AgentRuntime, ResourceUsage, RuntimeHandle};
pub use factory::{AgentFactory, AgentTemplate};
pub use lifecycle::{
    AgentLifecycleManager, AgentMetrics, AgentStatus, CapabilityLoad, FleetMetrics,
    LifecycleConfig, ManagedAgentInstance, MonitorReport,
};
pub use process_manager::{ProcessRuntime, SpawnConfig};
pub use resource_limiter::{ConstraintViolation, SecurityConstraints, SecurityLevel};
pub use scripted::{ProbeBehavior, ScriptedRuntime};
