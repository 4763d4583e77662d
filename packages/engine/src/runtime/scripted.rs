// packages/engine/src/runtime/scripted.rs
//! In-memory agent runtime with scriptable behaviour
//!
//! Used by tests and by the binary's dry-run mode. Usage samples, probe
//! failures, probe stalls, creation failures and execution results can all
//! be scripted per handle.

use crate::runtime::agent_runtime::{AgentConfig, AgentRuntime, ResourceUsage, RuntimeHandle};
use crate::runtime::resource_limiter::SecurityConstraints;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::Capability;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Closure deciding the outcome of an execution
pub type ExecutionHandler =
    Arc<dyn Fn(&AgentConfig, &serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

/// What a probe of a given handle does
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeBehavior {
    Report(ResourceUsage),
    Fail,
    /// Never answers; the monitor's probe timeout must skip it
    Stall,
}

/// Scriptable runtime
pub struct ScriptedRuntime {
    configs: DashMap<String, AgentConfig>,
    probes: DashMap<String, ProbeBehavior>,
    default_usage: Mutex<ResourceUsage>,
    failing_capabilities: Mutex<HashSet<Capability>>,
    handler: Mutex<ExecutionHandler>,
    execution_delay: Mutex<Duration>,
    creation_delay: Mutex<Duration>,
    /// Executions currently running per handle
    in_flight: DashMap<String, usize>,
    peak_in_flight: AtomicUsize,
    terminated: Mutex<Vec<(RuntimeHandle, Duration)>>,
    executions: AtomicU64,
    next_id: AtomicU64,
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        let echo: ExecutionHandler = Arc::new(
            |config: &AgentConfig, input: &serde_json::Value| -> Result<serde_json::Value> {
                Ok(json!({ "agent": config.name, "input": input }))
            },
        );

        Self {
            configs: DashMap::new(),
            probes: DashMap::new(),
            default_usage: Mutex::new(ResourceUsage {
                cpu_percent: 5.0,
                memory_mb: 64.0,
            }),
            failing_capabilities: Mutex::new(HashSet::new()),
            handler: Mutex::new(echo),
            execution_delay: Mutex::new(Duration::ZERO),
            creation_delay: Mutex::new(Duration::ZERO),
            in_flight: DashMap::new(),
            peak_in_flight: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
            executions: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    /// Replace the execution handler
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&AgentConfig, &serde_json::Value) -> Result<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        *self.handler.lock() = Arc::new(handler);
        self
    }

    pub fn with_execution_delay(self, delay: Duration) -> Self {
        *self.execution_delay.lock() = delay;
        self
    }

    /// Delay every handle creation, so creations interleave with other work
    pub fn with_creation_delay(self, delay: Duration) -> Self {
        *self.creation_delay.lock() = delay;
        self
    }

    /// Usage reported by handles without a scripted probe
    pub fn set_default_usage(&self, usage: ResourceUsage) {
        *self.default_usage.lock() = usage;
    }

    pub fn set_probe(&self, handle: &RuntimeHandle, behavior: ProbeBehavior) {
        self.probes.insert(handle.id.clone(), behavior);
    }

    pub fn set_usage(&self, handle: &RuntimeHandle, cpu_percent: f64, memory_mb: f64) {
        self.set_probe(
            handle,
            ProbeBehavior::Report(ResourceUsage {
                cpu_percent,
                memory_mb,
            }),
        );
    }

    /// Make handle creation fail for a capability
    pub fn fail_creation_for(&self, capability: impl Into<Capability>) {
        self.failing_capabilities.lock().insert(capability.into());
    }

    /// Handles that were terminated, with the grace period they were given
    pub fn terminated(&self) -> Vec<(RuntimeHandle, Duration)> {
        self.terminated.lock().clone()
    }

    pub fn live_handles(&self) -> usize {
        self.configs.len()
    }

    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Most executions ever observed running at once on a single handle
    pub fn peak_concurrent_executions(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn create_handle(
        &self,
        config: &AgentConfig,
        _constraints: &SecurityConstraints,
    ) -> Result<RuntimeHandle> {
        if self.failing_capabilities.lock().contains(&config.capability) {
            return Err(EngineError::ProcessSpawnFailed(format!(
                "scripted creation failure for {}",
                config.capability
            )));
        }

        let delay = *self.creation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = RuntimeHandle::new(format!("scripted-{}", seq));
        self.configs.insert(handle.id.clone(), config.clone());
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &RuntimeHandle,
        input: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let config = self
            .configs
            .get(&handle.id)
            .map(|c| c.value().clone())
            .ok_or_else(|| EngineError::not_found("runtime handle", &handle.id))?;

        let running = {
            let mut count = self.in_flight.entry(handle.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.execution_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(mut count) = self.in_flight.get_mut(&handle.id) {
            *count -= 1;
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        let handler = Arc::clone(&*self.handler.lock());
        handler(&config, input)
    }

    async fn probe(&self, handle: &RuntimeHandle) -> Result<ResourceUsage> {
        if !self.configs.contains_key(&handle.id) {
            return Err(EngineError::not_found("runtime handle", &handle.id));
        }

        let behavior = self
            .probes
            .get(&handle.id)
            .map(|b| *b.value())
            .unwrap_or_else(|| ProbeBehavior::Report(*self.default_usage.lock()));

        match behavior {
            ProbeBehavior::Report(usage) => Ok(usage),
            ProbeBehavior::Fail => Err(EngineError::RuntimeError(format!(
                "scripted probe failure for {}",
                handle.id
            ))),
            ProbeBehavior::Stall => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(EngineError::RuntimeError("stalled probe".to_string()))
            }
        }
    }

    async fn terminate(&self, handle: &RuntimeHandle, grace_period: Duration) -> Result<()> {
        self.configs.remove(&handle.id);
        self.probes.remove(&handle.id);
        self.terminated.lock().push((handle.clone(), grace_period));
        Ok(())
    }
}
