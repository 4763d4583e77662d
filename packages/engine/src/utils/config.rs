// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Loaded with the `config` crate from an optional file (`config/engine.*`
//! or an explicit path) layered under `CONDUCTOR__*` environment variables,
//! e.g. `CONDUCTOR__MONITOR__INTERVAL_SECS=10`.

use crate::runtime::factory::AgentTemplate;
use crate::runtime::resource_limiter::SecurityLevel;
use crate::scaling::policy::ScalingPolicy;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::Capability;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/engine";
const ENV_PREFIX: &str = "CONDUCTOR";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub monitor: MonitorConfig,
    pub scaling: ScalingConfig,
    pub consensus: ConsensusConfig,
    /// Agent templates keyed by capability name
    pub agents: HashMap<String, TemplateConfig>,
    pub storage: StorageConfig,
    pub observability: ObservabilityConfig,
}

/// Worker process settings used by the process-backed runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker executable (resolved through PATH)
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: Option<String>,
    pub env_vars: HashMap<String, String>,
    /// Time between SIGTERM and SIGKILL when stopping an instance
    pub grace_period_secs: u64,
    /// Probes slower than this are skipped for the cycle
    pub probe_timeout_ms: u64,
    pub execution_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string(), "worker.py".to_string()],
            work_dir: None,
            env_vars: HashMap::new(),
            grace_period_secs: 10,
            probe_timeout_ms: 2_000,
            execution_timeout_secs: 300,
        }
    }
}

impl RuntimeConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Consecutive probe failures before an instance is moved to Error
    pub max_probe_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_probe_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Span of history averaged by each evaluation
    pub trailing_window_secs: u64,
    /// Metrics older than this are pruned
    pub retention_secs: u64,
    pub default_cooldown_secs: u64,
    pub policies: HashMap<String, PolicyConfig>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            trailing_window_secs: 300,
            retention_secs: 3_600,
            default_cooldown_secs: 300,
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub default_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            sweep_interval_ms: 1_000,
        }
    }
}

/// Default configuration for instances of one capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub role: String,
    pub goal: String,
    pub tools: Vec<String>,
    pub security_level: SecurityLevel,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from("conductor.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Prometheus listener, e.g. "0.0.0.0:9464"; disabled when unset
    pub metrics_addr: Option<String>,
    pub event_log_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "info".to_string(),
            metrics_addr: None,
            event_log_capacity: 1_024,
        }
    }
}

impl EngineConfig {
    /// Load from `config/engine.*` (if present) and the environment
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.interval_secs == 0 {
            return Err(EngineError::Config(
                "monitor.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.scaling.interval_secs == 0 {
            return Err(EngineError::Config(
                "scaling.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.scaling.trailing_window_secs > self.scaling.retention_secs {
            return Err(EngineError::Config(
                "scaling.trailing_window_secs cannot exceed scaling.retention_secs".to_string(),
            ));
        }
        if self.consensus.default_timeout_secs == 0 {
            return Err(EngineError::Config(
                "consensus.default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.observability.event_log_capacity == 0 {
            return Err(EngineError::Config(
                "observability.event_log_capacity must be greater than 0".to_string(),
            ));
        }

        self.scaling_policies()?;
        Ok(())
    }

    /// Scaling policies declared in configuration, validated
    pub fn scaling_policies(&self) -> Result<Vec<ScalingPolicy>> {
        let mut policies = Vec::with_capacity(self.scaling.policies.len());

        for (name, raw) in &self.scaling.policies {
            let cooldown = raw.cooldown_secs.unwrap_or(self.scaling.default_cooldown_secs);
            let policy = ScalingPolicy {
                capability: Capability::new(name.clone()),
                min_instances: raw.min_instances,
                max_instances: raw.max_instances,
                scale_up_threshold: raw.scale_up_threshold,
                scale_down_threshold: raw.scale_down_threshold,
                cooldown: Duration::from_secs(cooldown),
            };
            policy
                .validate()
                .map_err(|e| EngineError::Config(format!("scaling.policies.{}: {}", name, e)))?;
            policies.push(policy);
        }

        policies.sort_by(|a, b| a.capability.cmp(&b.capability));
        Ok(policies)
    }

    /// Agent templates declared in configuration
    pub fn templates(&self) -> Vec<AgentTemplate> {
        let mut templates: Vec<AgentTemplate> = self
            .agents
            .iter()
            .map(|(name, raw)| AgentTemplate {
                capability: Capability::new(name.clone()),
                role: raw.role.clone(),
                goal: raw.goal.clone(),
                tools: raw.tools.clone(),
                security_level: raw.security_level,
                parameters: raw.parameters.clone(),
            })
            .collect();

        templates.sort_by(|a, b| a.capability.cmp(&b.capability));
        templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.scaling.retention_secs, 3_600);
        assert_eq!(config.scaling.trailing_window_secs, 300);
        assert_eq!(config.consensus.default_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[monitor]
interval_secs = 2

[scaling.policies.research]
min_instances = 1
max_instances = 4
scale_up_threshold = 75.0
scale_down_threshold = 20.0
cooldown_secs = 60

[agents.research]
role = "researcher"
goal = "collect sources"
tools = ["search"]
security_level = "strict"
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.monitor.interval_secs, 2);
        // Unspecified sections fall back to defaults
        assert_eq!(config.consensus.default_timeout_secs, 60);

        let policies = config.scaling_policies().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].max_instances, 4);
        assert_eq!(policies[0].cooldown, Duration::from_secs(60));

        let templates = config.templates();
        assert_eq!(templates[0].security_level, SecurityLevel::Strict);
        assert_eq!(templates[0].tools, vec!["search".to_string()]);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut config = EngineConfig::default();
        config.scaling.policies.insert(
            "review".to_string(),
            PolicyConfig {
                min_instances: 5,
                max_instances: 2,
                scale_up_threshold: 80.0,
                scale_down_threshold: 20.0,
                cooldown_secs: None,
            },
        );
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_monitor_interval_rejected() {
        let mut config = EngineConfig::default();
        config.monitor.interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
