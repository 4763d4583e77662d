// packages/engine/src/utils/errors.rs
//! Error taxonomy for the coordination engine
//!
//! Structural errors (validation, not-found, invalid state) are returned
//! synchronously to the caller of a mutating operation. Agent execution
//! failures are recorded on the task or instance they belong to and only
//! surface through status queries.

use thiserror::Error;

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input such as a cyclic or dangling task graph
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown workflow, task, instance or consensus request id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation is illegal for the current state of the target
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource ceiling breach (handled internally as a pause)
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Consensus deadline reached before the operation could apply
    #[error("Consensus timeout: {0}")]
    ConsensusTimeout(String),

    /// Failure reported by the agent runtime while executing a task
    #[error("Execution error: {0}")]
    Execution(String),

    /// Detected lost update on shared state
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Agent {agent_id} is not a participant of consensus request {request_id}")]
    UnknownParticipant { request_id: String, agent_id: String },

    #[error("Consensus request {0} is already finalized")]
    AlreadyFinalized(String),

    /// Internal invariant broken inside one workflow; the workflow is halted
    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Execution timed out")]
    ExecutionTimeout,

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error describes a caller mistake rather than an engine fault
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::NotFound { .. }
                | EngineError::InvalidState(_)
                | EngineError::UnknownParticipant { .. }
                | EngineError::AlreadyFinalized(_)
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::StorageFailed(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Validation(format!("invalid definition: {}", err))
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;
