// packages/engine/src/lib.rs
//! Conductor Coordination Engine Library
//!
//! Coordinates a pool of capability-typed worker agents: runs dependency
//! graphs of tasks across them, reduces multi-agent decisions to a single
//! verdict and keeps each pool sized to its observed load.
//!
//! # Architecture
//!
//! - **executor**: workflow task graphs, ready-set computation, definitions
//! - **consensus**: multi-agent decision requests and reduction strategies
//! - **runtime**: agent runtime capability, lifecycle manager, factory
//! - **scaling**: per-capability policies and the auto-scaler
//! - **events**: state-change notifications and the bounded event log
//! - **state**: repositories for persisted aggregates
//! - **orchestrator**: the façade composing all of the above
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration, errors and identifiers

pub mod consensus;
pub mod events;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod runtime;
pub mod scaling;
pub mod state;
pub mod utils;

// Re-export commonly used types
pub use consensus::{ConsensusCoordinator, ConsensusOutcome, ConsensusStrategy};
pub use executor::{TaskDefinition, WorkflowDefinition, WorkflowEngine, WorkflowOptions};
pub use orchestrator::{DispatchOutcome, Orchestrator};
pub use runtime::{AgentLifecycleManager, AgentRuntime, ProcessRuntime, ScriptedRuntime};
pub use scaling::{AutoScalingController, ScalingPolicy};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
