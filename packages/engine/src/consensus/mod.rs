// packages/engine/src/consensus/mod.rs
//! Multi-agent consensus
//!
//! - **Strategy**: Unanimous, Majority and Weighted reductions
//! - **Coordinator**: request registry, deadline handling and the sweeper

pub mod coordinator;
pub mod strategy;

pub use coordinator::{ConsensusCoordinator, ConsensusRequest};
pub use strategy::{ConsensusOutcome, ConsensusResponse, ConsensusStrategy};
