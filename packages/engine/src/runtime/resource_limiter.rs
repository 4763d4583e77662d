// packages/engine/src/runtime/resource_limiter.rs
//! Security constraints for agent instances
//!
//! Every instance carries an immutable snapshot of ceilings derived from a
//! named security level when it is created:
//! - CPU usage (percentage of one core)
//! - Memory consumption (MB)
//! - Wall-clock execution time
//! - Request rate (per minute)
//! - Capability allow/block lists, network and file access flags

use crate::runtime::agent_runtime::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named security level an instance is created under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Unrestricted,
    Relaxed,
    #[default]
    Standard,
    Strict,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Unrestricted => write!(f, "unrestricted"),
            SecurityLevel::Relaxed => write!(f, "relaxed"),
            SecurityLevel::Standard => write!(f, "standard"),
            SecurityLevel::Strict => write!(f, "strict"),
        }
    }
}

/// Resource and capability ceilings for an agent instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConstraints {
    pub level: SecurityLevel,

    /// Memory ceiling in megabytes
    pub max_memory_mb: u64,

    /// CPU ceiling as percentage (100 = one full core)
    pub max_cpu_percent: f64,

    /// Maximum uptime before the instance is paused
    #[serde(with = "duration_secs")]
    pub max_execution_time: Duration,

    /// Requests admitted per rolling minute
    pub rate_limit_per_minute: u32,

    /// Tools the instance may use; empty means "anything not blocked"
    pub allowed_capabilities: Vec<String>,

    pub blocked_capabilities: Vec<String>,

    pub network_access: bool,

    pub file_access: bool,
}

impl Default for SecurityConstraints {
    fn default() -> Self {
        Self::for_level(SecurityLevel::Standard)
    }
}

impl SecurityConstraints {
    /// Derive the ceilings for a named level
    pub fn for_level(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Unrestricted => Self {
                level,
                max_memory_mb: 16_384,
                max_cpu_percent: 400.0,
                max_execution_time: Duration::from_secs(24 * 3_600),
                rate_limit_per_minute: 10_000,
                allowed_capabilities: vec![],
                blocked_capabilities: vec![],
                network_access: true,
                file_access: true,
            },
            SecurityLevel::Relaxed => Self {
                level,
                max_memory_mb: 2_048,
                max_cpu_percent: 100.0,
                max_execution_time: Duration::from_secs(4 * 3_600),
                rate_limit_per_minute: 600,
                allowed_capabilities: vec![],
                blocked_capabilities: vec![],
                network_access: true,
                file_access: true,
            },
            SecurityLevel::Standard => Self {
                level,
                max_memory_mb: 512,
                max_cpu_percent: 50.0,
                max_execution_time: Duration::from_secs(3_600),
                rate_limit_per_minute: 120,
                allowed_capabilities: vec![],
                blocked_capabilities: vec!["shell".to_string()],
                network_access: true,
                file_access: false,
            },
            SecurityLevel::Strict => Self {
                level,
                max_memory_mb: 256,
                max_cpu_percent: 25.0,
                max_execution_time: Duration::from_secs(900),
                rate_limit_per_minute: 30,
                allowed_capabilities: vec![],
                blocked_capabilities: vec![
                    "shell".to_string(),
                    "filesystem".to_string(),
                    "network".to_string(),
                ],
                network_access: false,
                file_access: false,
            },
        }
    }

    pub fn with_max_memory_mb(mut self, max_memory_mb: u64) -> Self {
        self.max_memory_mb = max_memory_mb;
        self
    }

    pub fn with_max_cpu_percent(mut self, max_cpu_percent: f64) -> Self {
        self.max_cpu_percent = max_cpu_percent;
        self
    }

    pub fn with_max_execution_time(mut self, max_execution_time: Duration) -> Self {
        self.max_execution_time = max_execution_time;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn with_allowed(mut self, allowed: Vec<String>) -> Self {
        self.allowed_capabilities = allowed;
        self
    }

    /// Validate the ceilings themselves
    pub fn validate(&self) -> Result<(), String> {
        if self.max_cpu_percent <= 0.0 {
            return Err("CPU ceiling must be positive".to_string());
        }
        if self.max_cpu_percent > 6_400.0 {
            return Err("CPU ceiling cannot exceed 6400% (64 cores)".to_string());
        }

        if self.max_memory_mb < 16 {
            return Err("Memory ceiling cannot be less than 16MB".to_string());
        }

        if self.max_execution_time.is_zero() {
            return Err("Execution time ceiling cannot be 0".to_string());
        }

        if self.rate_limit_per_minute == 0 {
            return Err("Rate limit cannot be 0".to_string());
        }

        if let Some(both) = self
            .allowed_capabilities
            .iter()
            .find(|c| self.blocked_capabilities.contains(c))
        {
            return Err(format!("Capability '{}' is both allowed and blocked", both));
        }

        Ok(())
    }

    /// Whether a tool/capability may be used under these constraints
    pub fn permits(&self, capability: &str) -> bool {
        if self.blocked_capabilities.iter().any(|c| c == capability) {
            return false;
        }
        self.allowed_capabilities.is_empty()
            || self.allowed_capabilities.iter().any(|c| c == capability)
    }

    /// Compare a usage sample and uptime against the ceilings
    pub fn check(&self, usage: &ResourceUsage, uptime: Duration) -> Vec<ConstraintViolation> {
        let mut violations = Vec::new();

        if usage.memory_mb > self.max_memory_mb as f64 {
            violations.push(ConstraintViolation::Memory {
                observed_mb: usage.memory_mb,
                limit_mb: self.max_memory_mb,
            });
        }

        if usage.cpu_percent > self.max_cpu_percent {
            violations.push(ConstraintViolation::Cpu {
                observed_percent: usage.cpu_percent,
                limit_percent: self.max_cpu_percent,
            });
        }

        if uptime > self.max_execution_time {
            violations.push(ConstraintViolation::ExecutionTime {
                observed: uptime,
                limit: self.max_execution_time,
            });
        }

        violations
    }
}

/// A single ceiling breach observed by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintViolation {
    Memory {
        observed_mb: f64,
        limit_mb: u64,
    },
    Cpu {
        observed_percent: f64,
        limit_percent: f64,
    },
    ExecutionTime {
        #[serde(with = "duration_secs")]
        observed: Duration,
        #[serde(with = "duration_secs")]
        limit: Duration,
    },
}

impl fmt::Display for ConstraintViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintViolation::Memory {
                observed_mb,
                limit_mb,
            } => write!(f, "memory {:.1}MB exceeds {}MB", observed_mb, limit_mb),
            ConstraintViolation::Cpu {
                observed_percent,
                limit_percent,
            } => write!(f, "cpu {:.1}% exceeds {:.1}%", observed_percent, limit_percent),
            ConstraintViolation::ExecutionTime { observed, limit } => write!(
                f,
                "uptime {}s exceeds {}s",
                observed.as_secs(),
                limit.as_secs()
            ),
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
