// packages/engine/src/runtime/lifecycle.rs
//! Agent lifecycle management
//!
//! The [`AgentLifecycleManager`] owns every managed agent instance behind a
//! single registry lock and drives the status state machine:
//!
//! ```text
//! Creating ──▶ Active ◀──▶ Paused
//!                │           │
//!                └──▶ Stopping ◀┘ ──▶ Stopped
//!
//! (any non-terminal state) ──▶ Error
//! ```
//!
//! A periodic monitor probes every Active instance concurrently, records
//! usage, and pauses instances that exceed their ceilings. Probing happens
//! outside the registry lock; a stalled probe is skipped for that cycle.

use crate::events::{Notifier, StateChange};
use crate::observability;
use crate::runtime::agent_runtime::{AgentConfig, AgentRuntime, ResourceUsage, RuntimeHandle};
use crate::runtime::resource_limiter::{ConstraintViolation, SecurityConstraints};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{Capability, InstanceId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Status of a managed agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Creating,
    Active,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Creating, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Stopping)
                | (Paused, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Creating, Error)
                | (Active, Error)
                | (Paused, Error)
                | (Stopping, Error)
        )
    }

    /// Instances in these states count toward pool size
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            AgentStatus::Creating | AgentStatus::Active | AgentStatus::Paused
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Creating => "creating",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Observed metrics of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_activity: DateTime<Utc>,
    /// Successful usage samples
    pub samples: u64,
    pub consecutive_probe_failures: u32,
}

impl AgentMetrics {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0.0,
            tasks_completed: 0,
            tasks_failed: 0,
            last_activity: now,
            samples: 0,
            consecutive_probe_failures: 0,
        }
    }
}

/// A worker instance owned by the lifecycle manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedAgentInstance {
    pub id: InstanceId,
    pub handle: RuntimeHandle,
    pub config: AgentConfig,
    pub constraints: SecurityConstraints,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    pub created_at: DateTime<Utc>,
    /// Why the instance last changed status
    pub status_reason: Option<String>,
}

impl ManagedAgentInstance {
    pub fn capability(&self) -> &Capability {
        &self.config.capability
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    fn transition(
        &mut self,
        next: AgentStatus,
        reason: Option<String>,
    ) -> Result<StateChange> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidState(format!(
                "agent {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        let from = self.status;
        self.status = next;
        self.status_reason = reason.clone();

        Ok(StateChange::AgentStatus {
            instance_id: self.id,
            capability: self.config.capability.clone(),
            from,
            to: next,
            reason,
        })
    }
}

/// Monitor settings
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub monitor_interval: Duration,
    pub probe_timeout: Duration,
    pub grace_period: Duration,
    pub max_probe_failures: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(10),
            max_probe_failures: 3,
        }
    }
}

impl From<&EngineConfig> for LifecycleConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            monitor_interval: Duration::from_secs(config.monitor.interval_secs),
            probe_timeout: config.runtime.probe_timeout(),
            grace_period: config.runtime.grace_period(),
            max_probe_failures: config.monitor.max_probe_failures,
        }
    }
}

/// Outcome of one monitor cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub sampled: usize,
    pub paused: Vec<InstanceId>,
    pub probe_failures: Vec<InstanceId>,
    pub errored: Vec<InstanceId>,
}

/// Averaged load of one capability's Active instances
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityLoad {
    pub capability: Capability,
    /// Live instances (Creating, Active, Paused)
    pub instances: usize,
    pub active: usize,
    pub avg_cpu_percent: f64,
    pub avg_memory_mb: f64,
}

/// Fleet-wide totals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FleetMetrics {
    pub total: usize,
    pub by_status: HashMap<AgentStatus, usize>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_cpu_percent: f64,
    pub avg_memory_mb: f64,
}

/// Owner of every managed agent instance
pub struct AgentLifecycleManager {
    runtime: Arc<dyn AgentRuntime>,
    config: LifecycleConfig,
    instances: RwLock<HashMap<InstanceId, ManagedAgentInstance>>,
    /// Admission timestamps within the trailing minute, per instance
    request_windows: Mutex<HashMap<InstanceId, VecDeque<Instant>>>,
    notifier: Notifier,
}

impl AgentLifecycleManager {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: LifecycleConfig, notifier: Notifier) -> Self {
        Self {
            runtime,
            config,
            instances: RwLock::new(HashMap::new()),
            request_windows: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    /// Create an instance through the runtime and register it as Active
    pub async fn start_agent(
        &self,
        config: AgentConfig,
        constraints: SecurityConstraints,
    ) -> Result<ManagedAgentInstance> {
        constraints
            .validate()
            .map_err(|e| EngineError::Validation(format!("constraints for {}: {}", config.name, e)))?;

        if let Some(tool) = config.tools.iter().find(|t| !constraints.permits(t)) {
            return Err(EngineError::Validation(format!(
                "tool '{}' is not permitted at security level {}",
                tool, constraints.level
            )));
        }

        info!(
            "Starting agent {} (capability: {}, level: {})",
            config.name, config.capability, constraints.level
        );

        let handle = match self.runtime.create_handle(&config, &constraints).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to create runtime handle for {}: {}", config.name, e);
                metrics::counter!(observability::AGENT_START_FAILURES).increment(1);
                return Err(e);
            }
        };

        let now = Utc::now();
        let mut instance = ManagedAgentInstance {
            id: InstanceId::new(),
            handle,
            config,
            constraints,
            status: AgentStatus::Creating,
            metrics: AgentMetrics::new(now),
            created_at: now,
            status_reason: None,
        };
        let change = instance.transition(AgentStatus::Active, None)?;

        let snapshot = instance.clone();
        self.instances.write().insert(instance.id, instance);
        self.update_gauges();
        self.notifier.notify(change);

        info!("Agent {} active (handle {})", snapshot.id, snapshot.handle.id);
        Ok(snapshot)
    }

    /// Probe every Active instance once and enforce its ceilings
    pub async fn sample_once(&self) -> MonitorReport {
        let targets: Vec<(InstanceId, RuntimeHandle)> = self
            .instances
            .read()
            .values()
            .filter(|i| i.status == AgentStatus::Active)
            .map(|i| (i.id, i.handle.clone()))
            .collect();

        let probe_timeout = self.config.probe_timeout;
        let probes = targets.into_iter().map(|(id, handle)| {
            let runtime = Arc::clone(&self.runtime);
            async move {
                let outcome = tokio::time::timeout(probe_timeout, runtime.probe(&handle)).await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::RuntimeError(format!(
                        "probe timed out after {:?}",
                        probe_timeout
                    ))),
                };
                (id, result)
            }
        });
        let results = join_all(probes).await;

        let mut report = MonitorReport::default();
        let mut changes = Vec::new();
        let now = Utc::now();

        {
            let mut instances = self.instances.write();
            for (id, result) in results {
                // Stopped or paused while the probe was in flight
                let Some(instance) = instances.get_mut(&id) else {
                    continue;
                };
                if instance.status != AgentStatus::Active {
                    continue;
                }

                match result {
                    Ok(usage) => {
                        report.sampled += 1;
                        if let Some(change) = Self::apply_sample(instance, usage, now) {
                            report.paused.push(id);
                            changes.extend(change);
                        }
                    }
                    Err(e) => {
                        report.probe_failures.push(id);
                        instance.metrics.consecutive_probe_failures += 1;
                        metrics::counter!(observability::PROBE_FAILURES).increment(1);
                        warn!(
                            "Probe of agent {} failed ({} consecutive): {}",
                            id, instance.metrics.consecutive_probe_failures, e
                        );

                        if instance.metrics.consecutive_probe_failures
                            >= self.config.max_probe_failures
                        {
                            let reason = format!(
                                "{} consecutive probe failures",
                                instance.metrics.consecutive_probe_failures
                            );
                            if let Ok(change) = instance.transition(AgentStatus::Error, Some(reason))
                            {
                                error!("Agent {} moved to error after repeated probe failures", id);
                                report.errored.push(id);
                                changes.push(change);
                            }
                        }
                    }
                }
            }
        }

        if !changes.is_empty() {
            self.update_gauges();
        }
        self.notifier.notify_all(changes);

        debug!(
            "Monitor cycle: {} sampled, {} paused, {} probe failures",
            report.sampled,
            report.paused.len(),
            report.probe_failures.len()
        );
        report
    }

    /// Record a sample; returns the changes to publish when the instance is paused
    fn apply_sample(
        instance: &mut ManagedAgentInstance,
        usage: ResourceUsage,
        now: DateTime<Utc>,
    ) -> Option<Vec<StateChange>> {
        instance.metrics.cpu_percent = usage.cpu_percent;
        instance.metrics.memory_mb = usage.memory_mb;
        instance.metrics.samples += 1;
        instance.metrics.consecutive_probe_failures = 0;

        let violations = instance.constraints.check(&usage, instance.uptime(now));
        if violations.is_empty() {
            return None;
        }

        let reason = violations
            .iter()
            .map(ConstraintViolation::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("Agent {} violated its constraints: {}", instance.id, reason);
        metrics::counter!(observability::CONSTRAINT_VIOLATIONS).increment(violations.len() as u64);

        let paused = instance.transition(AgentStatus::Paused, Some(reason)).ok()?;
        Some(vec![
            paused,
            StateChange::ConstraintViolated {
                instance_id: instance.id,
                violations,
            },
        ])
    }

    /// Run the monitor until cancelled
    pub async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Agent monitor started (every {:?})", self.config.monitor_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sample_once().await;
                }
                _ = cancel.cancelled() => {
                    info!("Agent monitor stopped");
                    break;
                }
            }
        }
    }

    pub fn pause_agent(&self, id: InstanceId, reason: impl Into<String>) -> Result<ManagedAgentInstance> {
        self.change_status(id, AgentStatus::Paused, Some(reason.into()), &[AgentStatus::Active])
    }

    pub fn resume_agent(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        self.change_status(id, AgentStatus::Active, None, &[AgentStatus::Paused])
    }

    /// Move an instance to Error
    pub fn mark_error(&self, id: InstanceId, reason: impl Into<String>) -> Result<ManagedAgentInstance> {
        let reason = reason.into();
        error!("Agent {} marked as error: {}", id, reason);
        self.change_status(
            id,
            AgentStatus::Error,
            Some(reason),
            &[
                AgentStatus::Creating,
                AgentStatus::Active,
                AgentStatus::Paused,
                AgentStatus::Stopping,
            ],
        )
    }

    fn change_status(
        &self,
        id: InstanceId,
        next: AgentStatus,
        reason: Option<String>,
        allowed_from: &[AgentStatus],
    ) -> Result<ManagedAgentInstance> {
        let (change, snapshot) = {
            let mut instances = self.instances.write();
            let instance = instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("agent", id))?;

            if !allowed_from.contains(&instance.status) {
                return Err(EngineError::InvalidState(format!(
                    "agent {} is {}, cannot move to {}",
                    id, instance.status, next
                )));
            }

            let change = instance.transition(next, reason)?;
            (change, instance.clone())
        };

        info!("Agent {} is now {}", id, next);
        self.update_gauges();
        self.notifier.notify(change);
        Ok(snapshot)
    }

    /// Terminate an instance and remove it from the registry
    ///
    /// The returned snapshot carries status Stopped, or Error when the
    /// runtime failed to terminate the handle.
    pub async fn stop_agent(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        let (handle, change) = {
            let mut instances = self.instances.write();
            let instance = instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("agent", id))?;
            let change = instance.transition(AgentStatus::Stopping, None)?;
            (instance.handle.clone(), change)
        };
        self.notifier.notify(change);

        info!("Stopping agent {} (grace period {:?})", id, self.config.grace_period);
        let terminated = self.runtime.terminate(&handle, self.config.grace_period).await;

        let mut instance = self
            .instances
            .write()
            .remove(&id)
            .ok_or_else(|| EngineError::InternalConsistency(format!("agent {} vanished while stopping", id)))?;
        self.request_windows.lock().remove(&id);

        // Someone may have marked the instance as Error while it was stopping
        let change = match terminated {
            Ok(()) => instance.transition(AgentStatus::Stopped, None).ok(),
            Err(e) => {
                warn!("Runtime failed to terminate agent {}: {}", id, e);
                instance
                    .transition(AgentStatus::Error, Some(format!("terminate failed: {}", e)))
                    .ok()
            }
        };

        self.update_gauges();
        self.notifier.notify_all(change);
        Ok(instance)
    }

    /// Stop every instance, used at shutdown
    pub async fn stop_all(&self) -> Vec<ManagedAgentInstance> {
        let ids: Vec<InstanceId> = self
            .instances
            .read()
            .values()
            .filter(|i| i.status != AgentStatus::Stopping)
            .map(|i| i.id)
            .collect();

        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            match self.stop_agent(id).await {
                Ok(instance) => stopped.push(instance),
                Err(e) => warn!("Failed to stop agent {} at shutdown: {}", id, e),
            }
        }
        stopped
    }

    /// Count a finished task against an instance
    pub fn record_task_outcome(&self, id: InstanceId, success: bool) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("agent", id))?;

        if success {
            instance.metrics.tasks_completed += 1;
        } else {
            instance.metrics.tasks_failed += 1;
        }
        instance.metrics.last_activity = Utc::now();
        Ok(())
    }

    /// Admit one request against the instance's per-minute budget
    pub fn admit_request(&self, id: InstanceId) -> Result<bool> {
        let limit = {
            let mut instances = self.instances.write();
            let instance = instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("agent", id))?;
            instance.metrics.last_activity = Utc::now();
            instance.constraints.rate_limit_per_minute as usize
        };

        let now = Instant::now();
        let mut windows = self.request_windows.lock();
        let window = windows.entry(id).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(60))
        {
            window.pop_front();
        }

        if window.len() >= limit {
            debug!("Agent {} is over its rate limit ({}/min)", id, limit);
            return Ok(false);
        }
        window.push_back(now);
        Ok(true)
    }

    pub fn get_status(&self, id: InstanceId) -> Result<ManagedAgentInstance> {
        self.instances
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("agent", id))
    }

    /// Snapshot of instances, oldest first
    pub fn list_agents(&self, filter: Option<AgentStatus>) -> Vec<ManagedAgentInstance> {
        let mut agents: Vec<ManagedAgentInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| filter.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    /// Instances of one capability, oldest first
    pub fn instances_of(&self, capability: &Capability) -> Vec<ManagedAgentInstance> {
        let mut agents: Vec<ManagedAgentInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| &i.config.capability == capability)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    /// Live instances of a capability
    pub fn count_by_capability(&self, capability: &Capability) -> usize {
        self.instances
            .read()
            .values()
            .filter(|i| &i.config.capability == capability && i.status.is_live())
            .count()
    }

    pub fn load_by_capability(&self) -> HashMap<Capability, CapabilityLoad> {
        let instances = self.instances.read();
        let mut loads: HashMap<Capability, CapabilityLoad> = HashMap::new();

        for instance in instances.values().filter(|i| i.status.is_live()) {
            let load = loads
                .entry(instance.config.capability.clone())
                .or_insert_with(|| CapabilityLoad {
                    capability: instance.config.capability.clone(),
                    instances: 0,
                    active: 0,
                    avg_cpu_percent: 0.0,
                    avg_memory_mb: 0.0,
                });
            load.instances += 1;
            if instance.status == AgentStatus::Active {
                load.active += 1;
                load.avg_cpu_percent += instance.metrics.cpu_percent;
                load.avg_memory_mb += instance.metrics.memory_mb;
            }
        }

        for load in loads.values_mut() {
            if load.active > 0 {
                load.avg_cpu_percent /= load.active as f64;
                load.avg_memory_mb /= load.active as f64;
            }
        }
        loads
    }

    pub fn fleet_metrics(&self) -> FleetMetrics {
        let instances = self.instances.read();
        let mut fleet = FleetMetrics {
            total: instances.len(),
            ..FleetMetrics::default()
        };

        for instance in instances.values() {
            *fleet.by_status.entry(instance.status).or_default() += 1;
            fleet.tasks_completed += instance.metrics.tasks_completed;
            fleet.tasks_failed += instance.metrics.tasks_failed;
            fleet.avg_cpu_percent += instance.metrics.cpu_percent;
            fleet.avg_memory_mb += instance.metrics.memory_mb;
        }

        if fleet.total > 0 {
            fleet.avg_cpu_percent /= fleet.total as f64;
            fleet.avg_memory_mb /= fleet.total as f64;
        }
        fleet
    }

    fn update_gauges(&self) {
        let active = self
            .instances
            .read()
            .values()
            .filter(|i| i.status == AgentStatus::Active)
            .count();
        metrics::gauge!(observability::AGENTS_ACTIVE).set(active as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLog, StateEvent};
    use crate::runtime::resource_limiter::SecurityLevel;
    use crate::runtime::scripted::{ProbeBehavior, ScriptedRuntime};

    fn manager(runtime: Arc<ScriptedRuntime>) -> (AgentLifecycleManager, Arc<EventLog>) {
        let notifier = Notifier::new();
        let log = Arc::new(EventLog::new(256));
        notifier.subscribe(log.clone());

        let config = LifecycleConfig {
            monitor_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            grace_period: Duration::from_secs(3),
            max_probe_failures: 3,
        };
        (AgentLifecycleManager::new(runtime, config, notifier), log)
    }

    fn statuses(log: &EventLog) -> Vec<(AgentStatus, AgentStatus)> {
        log.drain(usize::MAX)
            .into_iter()
            .filter_map(|e: StateEvent| match e.change {
                StateChange::AgentStatus { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transitions() {
        assert!(AgentStatus::Creating.can_transition_to(AgentStatus::Active));
        assert!(AgentStatus::Paused.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Stopped.can_transition_to(AgentStatus::Active));
        assert!(!AgentStatus::Paused.can_transition_to(AgentStatus::Stopped));
        assert!(!AgentStatus::Stopped.can_transition_to(AgentStatus::Error));
    }

    #[tokio::test]
    async fn test_start_registers_active_instance() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, log) = manager(runtime);

        let instance = manager
            .start_agent(AgentConfig::new("w-1", "search"), SecurityConstraints::default())
            .await
            .unwrap();

        assert_eq!(instance.status, AgentStatus::Active);
        assert_eq!(manager.count_by_capability(&Capability::new("search")), 1);
        assert_eq!(
            statuses(&log),
            vec![(AgentStatus::Creating, AgentStatus::Active)]
        );
    }

    #[tokio::test]
    async fn test_failed_creation_registers_nothing() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.fail_creation_for("gpu");
        let (manager, _) = manager(runtime);

        let result = manager
            .start_agent(AgentConfig::new("w-1", "gpu"), SecurityConstraints::default())
            .await;

        assert!(matches!(result, Err(EngineError::ProcessSpawnFailed(_))));
        assert!(manager.list_agents(None).is_empty());
    }

    #[tokio::test]
    async fn test_blocked_tool_is_rejected() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(Arc::clone(&runtime));

        let config = AgentConfig::new("w-1", "ops").with_tools(vec!["shell".to_string()]);
        let result = manager
            .start_agent(config, SecurityConstraints::for_level(SecurityLevel::Strict))
            .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(runtime.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_memory_breach_pauses_and_never_stops() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, log) = manager(Arc::clone(&runtime));

        let instance = manager
            .start_agent(AgentConfig::new("w-1", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        runtime.set_usage(&instance.handle, 10.0, 4_096.0);
        log.drain(usize::MAX);

        let report = manager.sample_once().await;
        assert_eq!(report.paused, vec![instance.id]);

        // Paused instances are not probed again
        let report = manager.sample_once().await;
        assert_eq!(report.sampled, 0);

        let current = manager.get_status(instance.id).unwrap();
        assert_eq!(current.status, AgentStatus::Paused);
        assert!(current.status_reason.unwrap().contains("memory"));
        assert!(runtime.terminated().is_empty());

        let events = log.drain(usize::MAX);
        assert!(events
            .iter()
            .any(|e| matches!(e.change, StateChange::ConstraintViolated { .. })));
    }

    #[tokio::test]
    async fn test_probe_failures_are_isolated() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(Arc::clone(&runtime));

        let healthy = manager
            .start_agent(AgentConfig::new("ok", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        let failing = manager
            .start_agent(AgentConfig::new("bad", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        let stalled = manager
            .start_agent(AgentConfig::new("slow", "search"), SecurityConstraints::default())
            .await
            .unwrap();

        runtime.set_usage(&healthy.handle, 12.0, 100.0);
        runtime.set_probe(&failing.handle, ProbeBehavior::Fail);
        runtime.set_probe(&stalled.handle, ProbeBehavior::Stall);

        let report = manager.sample_once().await;
        assert_eq!(report.sampled, 1);
        assert_eq!(report.probe_failures.len(), 2);

        let sampled = manager.get_status(healthy.id).unwrap();
        assert_eq!(sampled.metrics.cpu_percent, 12.0);
        assert_eq!(sampled.metrics.samples, 1);
        assert_eq!(manager.get_status(failing.id).unwrap().status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_repeated_probe_failures_move_to_error() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(Arc::clone(&runtime));

        let instance = manager
            .start_agent(AgentConfig::new("bad", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        runtime.set_probe(&instance.handle, ProbeBehavior::Fail);

        for _ in 0..2 {
            manager.sample_once().await;
        }
        assert_eq!(manager.get_status(instance.id).unwrap().status, AgentStatus::Active);

        let report = manager.sample_once().await;
        assert_eq!(report.errored, vec![instance.id]);
        assert_eq!(manager.get_status(instance.id).unwrap().status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_pause_resume_rules() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(runtime);

        let instance = manager
            .start_agent(AgentConfig::new("w", "search"), SecurityConstraints::default())
            .await
            .unwrap();

        assert!(matches!(
            manager.resume_agent(instance.id),
            Err(EngineError::InvalidState(_))
        ));

        let paused = manager.pause_agent(instance.id, "operator").unwrap();
        assert_eq!(paused.status, AgentStatus::Paused);
        assert!(matches!(
            manager.pause_agent(instance.id, "again"),
            Err(EngineError::InvalidState(_))
        ));

        let resumed = manager.resume_agent(instance.id).unwrap();
        assert_eq!(resumed.status, AgentStatus::Active);

        assert!(matches!(
            manager.pause_agent(InstanceId::new(), "missing"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_returns_final_snapshot() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, log) = manager(Arc::clone(&runtime));

        let instance = manager
            .start_agent(AgentConfig::new("w", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        manager.record_task_outcome(instance.id, true).unwrap();
        log.drain(usize::MAX);

        let stopped = manager.stop_agent(instance.id).await.unwrap();
        assert_eq!(stopped.status, AgentStatus::Stopped);
        assert_eq!(stopped.metrics.tasks_completed, 1);
        assert!(manager.get_status(instance.id).is_err());

        let terminated = runtime.terminated();
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].1, Duration::from_secs(3));

        assert_eq!(
            statuses(&log),
            vec![
                (AgentStatus::Active, AgentStatus::Stopping),
                (AgentStatus::Stopping, AgentStatus::Stopped)
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(runtime);

        let mut snapshot = manager
            .start_agent(AgentConfig::new("w", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        snapshot.status = AgentStatus::Error;

        assert_eq!(manager.get_status(snapshot.id).unwrap().status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_rate_limit_admission() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(runtime);

        let instance = manager
            .start_agent(
                AgentConfig::new("w", "search"),
                SecurityConstraints::default().with_rate_limit(2),
            )
            .await
            .unwrap();

        assert!(manager.admit_request(instance.id).unwrap());
        assert!(manager.admit_request(instance.id).unwrap());
        assert!(!manager.admit_request(instance.id).unwrap());
    }

    #[tokio::test]
    async fn test_load_by_capability_averages_active() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(Arc::clone(&runtime));

        for cpu in [20.0, 40.0] {
            let instance = manager
                .start_agent(AgentConfig::new("w", "search"), SecurityConstraints::default())
                .await
                .unwrap();
            runtime.set_usage(&instance.handle, cpu, 100.0);
        }
        manager.sample_once().await;

        let loads = manager.load_by_capability();
        let load = &loads[&Capability::new("search")];
        assert_eq!(load.active, 2);
        assert!((load.avg_cpu_percent - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_monitor_loop_pauses_and_stops_on_cancel() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (manager, _) = manager(Arc::clone(&runtime));
        let manager = Arc::new(manager);

        let instance = manager
            .start_agent(AgentConfig::new("w", "search"), SecurityConstraints::default())
            .await
            .unwrap();
        runtime.set_usage(&instance.handle, 99.0, 10.0);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&manager).run_monitor(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get_status(instance.id).unwrap().status, AgentStatus::Paused);

        cancel.cancel();
        task.await.unwrap();
    }
}
