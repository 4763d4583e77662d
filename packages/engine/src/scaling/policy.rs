// packages/engine/src/scaling/policy.rs
//! Scaling policies, load snapshots and actions

use crate::runtime::resource_limiter::duration_secs;
use crate::utils::ids::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Pool bounds and thresholds for one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub capability: Capability,

    pub min_instances: usize,

    pub max_instances: usize,

    /// Trailing mean CPU % above which the pool grows
    pub scale_up_threshold: f64,

    /// Trailing mean CPU % below which the pool shrinks
    pub scale_down_threshold: f64,

    /// Quiet period after an executed action
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
}

impl ScalingPolicy {
    pub fn new(capability: impl Into<Capability>, min_instances: usize, max_instances: usize) -> Self {
        Self {
            capability: capability.into(),
            min_instances,
            max_instances,
            scale_up_threshold: 75.0,
            scale_down_threshold: 25.0,
            cooldown: Duration::from_secs(300),
        }
    }

    pub fn with_thresholds(mut self, scale_down: f64, scale_up: f64) -> Self {
        self.scale_down_threshold = scale_down;
        self.scale_up_threshold = scale_up;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("max_instances must be at least 1".to_string());
        }
        if self.min_instances > self.max_instances {
            return Err(format!(
                "min_instances ({}) cannot exceed max_instances ({})",
                self.min_instances, self.max_instances
            ));
        }
        if !self.scale_up_threshold.is_finite() || !self.scale_down_threshold.is_finite() {
            return Err("thresholds must be finite".to_string());
        }
        if self.scale_down_threshold < 0.0 {
            return Err("scale_down_threshold cannot be negative".to_string());
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            ));
        }
        Ok(())
    }
}

/// Load snapshot of one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadMetrics {
    pub capability: Capability,
    pub at: DateTime<Utc>,
    pub avg_cpu_percent: f64,
    pub avg_memory_mb: f64,
    pub pending_tasks: usize,
    pub active_instances: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

impl fmt::Display for ScalingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingDirection::Up => write!(f, "up"),
            ScalingDirection::Down => write!(f, "down"),
        }
    }
}

/// A single-step change to one capability's pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub capability: Capability,
    pub direction: ScalingDirection,
    pub current_instances: usize,
    pub target_instances: usize,
    pub reason: String,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scale {} {} {} -> {} ({})",
            self.capability, self.direction, self.current_instances, self.target_instances, self.reason
        )
    }
}
