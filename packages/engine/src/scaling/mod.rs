// packages/engine/src/scaling/mod.rs
//! Pool auto-scaling
//!
//! - **Policy**: per-capability bounds, thresholds and cooldown
//! - **History**: one hour of load snapshots per capability
//! - **Autoscaler**: evaluation, single-step execution and cooldown gating

pub mod autoscaler;
pub mod history;
pub mod policy;

pub use autoscaler::{AutoScalingController, ScalerConfig};
pub use history::LoadHistory;
pub use policy::{LoadMetrics, ScalingAction, ScalingDirection, ScalingPolicy};
