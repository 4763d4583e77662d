// packages/engine/src/utils/mod.rs
//! Common utilities: errors, configuration and identifiers

pub mod config;
pub mod errors;
pub mod ids;

pub use self::config::EngineConfig;
pub use errors::{EngineError, Result};
pub use ids::{Capability, InstanceId, RequestId, TaskId, WorkflowId};
