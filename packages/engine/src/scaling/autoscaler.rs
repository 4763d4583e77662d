// packages/engine/src/scaling/autoscaler.rs
//! Auto-scaling controller
//!
//! Each evaluation compares a capability's trailing CPU against its policy
//! and proposes at most one single-step action per capability:
//!
//! - instance count outside `[min, max]` → one step back toward the bounds
//! - trailing CPU above `scale_up_threshold` and below max → +1
//! - trailing CPU below `scale_down_threshold` and above min → −1
//!
//! An executed action starts the capability's cooldown, during which no
//! further proposal is made for it.

use crate::events::{Notifier, StateChange};
use crate::observability;
use crate::runtime::factory::AgentFactory;
use crate::runtime::lifecycle::{AgentLifecycleManager, AgentStatus};
use crate::scaling::history::LoadHistory;
use crate::scaling::policy::{LoadMetrics, ScalingAction, ScalingDirection, ScalingPolicy};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{Capability, InstanceId};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ScalerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub trailing_window: Duration,
    pub retention: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            trailing_window: Duration::from_secs(300),
            retention: Duration::from_secs(3_600),
        }
    }
}

impl From<&EngineConfig> for ScalerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            enabled: config.scaling.enabled,
            interval: Duration::from_secs(config.scaling.interval_secs),
            trailing_window: Duration::from_secs(config.scaling.trailing_window_secs),
            retention: Duration::from_secs(config.scaling.retention_secs),
        }
    }
}

pub struct AutoScalingController {
    config: ScalerConfig,
    policies: RwLock<BTreeMap<Capability, ScalingPolicy>>,
    history: Mutex<LoadHistory>,
    /// When the last action per capability was executed
    last_action: Mutex<HashMap<Capability, Instant>>,
    notifier: Notifier,
}

impl AutoScalingController {
    pub fn new(config: ScalerConfig, notifier: Notifier) -> Self {
        let retention = config.retention;
        Self {
            config,
            policies: RwLock::new(BTreeMap::new()),
            history: Mutex::new(LoadHistory::new(retention)),
            last_action: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.config
    }

    pub fn set_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy
            .validate()
            .map_err(|e| EngineError::Validation(format!("policy for {}: {}", policy.capability, e)))?;

        info!(
            "Scaling policy for {}: {}..{} instances, {:.0}%/{:.0}% cpu, cooldown {:?}",
            policy.capability,
            policy.min_instances,
            policy.max_instances,
            policy.scale_down_threshold,
            policy.scale_up_threshold,
            policy.cooldown
        );
        self.policies.write().insert(policy.capability.clone(), policy);
        Ok(())
    }

    pub fn get_policy(&self, capability: &Capability) -> Option<ScalingPolicy> {
        self.policies.read().get(capability).cloned()
    }

    pub fn remove_policy(&self, capability: &Capability) -> Option<ScalingPolicy> {
        self.last_action.lock().remove(capability);
        self.policies.write().remove(capability)
    }

    pub fn policies(&self) -> Vec<ScalingPolicy> {
        self.policies.read().values().cloned().collect()
    }

    pub fn record(&self, metrics: LoadMetrics) {
        self.history.lock().record(metrics);
    }

    /// Snapshot the load of every policy-managed capability
    pub fn collect(
        &self,
        lifecycle: &AgentLifecycleManager,
        pending: &HashMap<Capability, usize>,
    ) -> Vec<LoadMetrics> {
        let loads = lifecycle.load_by_capability();
        let now = Utc::now();

        let snapshots: Vec<LoadMetrics> = self
            .policies
            .read()
            .keys()
            .map(|capability| {
                let load = loads.get(capability);
                LoadMetrics {
                    capability: capability.clone(),
                    at: now,
                    avg_cpu_percent: load.map_or(0.0, |l| l.avg_cpu_percent),
                    avg_memory_mb: load.map_or(0.0, |l| l.avg_memory_mb),
                    pending_tasks: pending.get(capability).copied().unwrap_or(0),
                    active_instances: load.map_or(0, |l| l.active),
                }
            })
            .collect();

        let mut history = self.history.lock();
        for snapshot in &snapshots {
            history.record(snapshot.clone());
        }
        snapshots
    }

    /// Time left before the capability may scale again
    pub fn cooldown_remaining(&self, capability: &Capability) -> Option<Duration> {
        let cooldown = self.policies.read().get(capability)?.cooldown;
        let last = *self.last_action.lock().get(capability)?;
        cooldown.checked_sub(last.elapsed()).filter(|d| !d.is_zero())
    }

    /// Propose at most one action per capability
    pub fn evaluate(&self, lifecycle: &AgentLifecycleManager) -> Vec<ScalingAction> {
        let policies = self.policies();
        let mut actions = Vec::new();

        for policy in policies {
            if let Some(remaining) = self.cooldown_remaining(&policy.capability) {
                debug!("{} in cooldown for {:?}", policy.capability, remaining);
                continue;
            }

            let current = lifecycle.count_by_capability(&policy.capability);
            let trailing = self
                .history
                .lock()
                .trailing_cpu(&policy.capability, self.config.trailing_window);

            if let Some(action) = propose(&policy, current, trailing) {
                debug!("Proposed {}", action);
                actions.push(action);
            }
        }
        actions
    }

    /// Apply one action and start the capability's cooldown
    ///
    /// Scale-down never stops an instance listed in `exclude`.
    pub async fn execute_action(
        &self,
        action: &ScalingAction,
        factory: &AgentFactory,
        lifecycle: &AgentLifecycleManager,
        exclude: &HashSet<InstanceId>,
    ) -> Result<InstanceId> {
        let instance_id = match action.direction {
            ScalingDirection::Up => factory.create(&action.capability, lifecycle).await?.id,
            ScalingDirection::Down => {
                let victim = lifecycle
                    .instances_of(&action.capability)
                    .into_iter()
                    .filter(|i| matches!(i.status, AgentStatus::Active | AgentStatus::Paused))
                    .filter(|i| !exclude.contains(&i.id))
                    .min_by(|a, b| {
                        a.metrics
                            .tasks_completed
                            .cmp(&b.metrics.tasks_completed)
                            .then(a.created_at.cmp(&b.created_at))
                    })
                    .ok_or_else(|| {
                        EngineError::InvalidState(format!(
                            "no idle {} instance to stop",
                            action.capability
                        ))
                    })?;
                lifecycle.stop_agent(victim.id).await?.id
            }
        };

        self.last_action
            .lock()
            .insert(action.capability.clone(), Instant::now());

        info!("Executed {} (instance {})", action, instance_id);
        metrics::counter!(
            observability::SCALING_ACTIONS,
            "direction" => action.direction.to_string()
        )
        .increment(1);

        self.notifier.notify(StateChange::ScalingExecuted {
            action: action.clone(),
            instance_id: Some(instance_id),
        });
        Ok(instance_id)
    }

    /// Evaluate and execute in one pass; failures are logged per action
    pub async fn run_cycle(
        &self,
        factory: &AgentFactory,
        lifecycle: &AgentLifecycleManager,
        pending: &HashMap<Capability, usize>,
        exclude: &HashSet<InstanceId>,
    ) -> Vec<(ScalingAction, Result<InstanceId>)> {
        self.collect(lifecycle, pending);

        let mut executed = Vec::new();
        for action in self.evaluate(lifecycle) {
            let result = self.execute_action(&action, factory, lifecycle, exclude).await;
            if let Err(e) = &result {
                warn!("Scaling action failed: {}: {}", action, e);
            }
            executed.push((action, result));
        }
        executed
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn load_history(&self, capability: &Capability) -> Vec<LoadMetrics> {
        self.history.lock().snapshots(capability)
    }
}

fn propose(policy: &ScalingPolicy, current: usize, trailing_cpu: Option<f64>) -> Option<ScalingAction> {
    let step = |direction: ScalingDirection, reason: String| {
        let target = match direction {
            ScalingDirection::Up => current + 1,
            ScalingDirection::Down => current.saturating_sub(1),
        };
        ScalingAction {
            capability: policy.capability.clone(),
            direction,
            current_instances: current,
            target_instances: target,
            reason,
        }
    };

    if current < policy.min_instances {
        return Some(step(
            ScalingDirection::Up,
            format!("below minimum of {}", policy.min_instances),
        ));
    }
    if current > policy.max_instances {
        return Some(step(
            ScalingDirection::Down,
            format!("above maximum of {}", policy.max_instances),
        ));
    }

    let cpu = trailing_cpu?;
    if cpu > policy.scale_up_threshold && current < policy.max_instances {
        return Some(step(
            ScalingDirection::Up,
            format!("trailing cpu {:.1}% above {:.1}%", cpu, policy.scale_up_threshold),
        ));
    }
    if cpu < policy.scale_down_threshold && current > policy.min_instances {
        return Some(step(
            ScalingDirection::Down,
            format!("trailing cpu {:.1}% below {:.1}%", cpu, policy.scale_down_threshold),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lifecycle::LifecycleConfig;
    use crate::runtime::scripted::ScriptedRuntime;
    use std::sync::Arc;

    fn fixture() -> (AutoScalingController, AgentLifecycleManager, AgentFactory) {
        let notifier = Notifier::new();
        let scaler = AutoScalingController::new(ScalerConfig::default(), notifier.clone());
        let lifecycle = AgentLifecycleManager::new(
            Arc::new(ScriptedRuntime::new()),
            LifecycleConfig::default(),
            notifier,
        );
        (scaler, lifecycle, AgentFactory::new(vec![]))
    }

    fn load(capability: &str, cpu: f64) -> LoadMetrics {
        LoadMetrics {
            capability: Capability::new(capability),
            at: Utc::now(),
            avg_cpu_percent: cpu,
            avg_memory_mb: 64.0,
            pending_tasks: 0,
            active_instances: 1,
        }
    }

    #[test]
    fn test_propose_rules() {
        let policy = ScalingPolicy::new("search", 1, 3).with_thresholds(20.0, 80.0);

        assert_eq!(propose(&policy, 0, None).unwrap().direction, ScalingDirection::Up);
        assert_eq!(propose(&policy, 4, None).unwrap().direction, ScalingDirection::Down);
        assert!(propose(&policy, 2, None).is_none());

        let up = propose(&policy, 2, Some(90.0)).unwrap();
        assert_eq!((up.current_instances, up.target_instances), (2, 3));
        assert!(propose(&policy, 3, Some(90.0)).is_none());

        assert_eq!(propose(&policy, 2, Some(5.0)).unwrap().direction, ScalingDirection::Down);
        assert!(propose(&policy, 1, Some(5.0)).is_none());
        assert!(propose(&policy, 2, Some(50.0)).is_none());
    }

    #[test]
    fn test_policy_crud() {
        let (scaler, _, _) = fixture();
        let search = Capability::new("search");

        assert!(matches!(
            scaler.set_policy(ScalingPolicy::new("search", 3, 1)),
            Err(EngineError::Validation(_))
        ));

        scaler.set_policy(ScalingPolicy::new("search", 1, 3)).unwrap();
        assert_eq!(scaler.get_policy(&search).unwrap().max_instances, 3);
        assert_eq!(scaler.policies().len(), 1);

        assert!(scaler.remove_policy(&search).is_some());
        assert!(scaler.get_policy(&search).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_second_action() {
        let (scaler, lifecycle, factory) = fixture();
        scaler
            .set_policy(
                ScalingPolicy::new("search", 0, 5)
                    .with_thresholds(20.0, 70.0)
                    .with_cooldown(Duration::from_secs(300)),
            )
            .unwrap();
        scaler.record(load("search", 95.0));

        let actions = scaler.evaluate(&lifecycle);
        assert_eq!(actions.len(), 1);
        scaler
            .execute_action(&actions[0], &factory, &lifecycle, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(lifecycle.count_by_capability(&Capability::new("search")), 1);

        scaler.record(load("search", 95.0));
        assert!(scaler.evaluate(&lifecycle).is_empty());
        tokio::time::advance(Duration::from_secs(120)).await;
        scaler.record(load("search", 95.0));
        assert!(scaler.evaluate(&lifecycle).is_empty());

        tokio::time::advance(Duration::from_secs(181)).await;
        scaler.record(load("search", 95.0));
        assert_eq!(scaler.evaluate(&lifecycle).len(), 1);
    }

    #[tokio::test]
    async fn test_scale_down_picks_least_used_idle_instance() {
        let (scaler, lifecycle, factory) = fixture();
        let search = Capability::new("search");

        let busy = factory.create(&search, &lifecycle).await.unwrap();
        let worked = factory.create(&search, &lifecycle).await.unwrap();
        let idle = factory.create(&search, &lifecycle).await.unwrap();
        lifecycle.record_task_outcome(worked.id, true).unwrap();

        let action = ScalingAction {
            capability: search.clone(),
            direction: ScalingDirection::Down,
            current_instances: 3,
            target_instances: 2,
            reason: "test".to_string(),
        };
        let exclude: HashSet<InstanceId> = [busy.id].into_iter().collect();

        let stopped = scaler
            .execute_action(&action, &factory, &lifecycle, &exclude)
            .await
            .unwrap();
        assert_eq!(stopped, idle.id);
        assert_eq!(lifecycle.count_by_capability(&search), 2);
        assert!(scaler.cooldown_remaining(&search).is_none());
    }

    #[tokio::test]
    async fn test_collect_records_policy_capabilities() {
        let (scaler, lifecycle, factory) = fixture();
        scaler.set_policy(ScalingPolicy::new("search", 0, 2)).unwrap();
        factory.create(&Capability::new("search"), &lifecycle).await.unwrap();

        let pending: HashMap<Capability, usize> = [(Capability::new("search"), 4)].into_iter().collect();
        let snapshots = scaler.collect(&lifecycle, &pending);

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].pending_tasks, 4);
        assert_eq!(snapshots[0].active_instances, 1);
        assert_eq!(scaler.history_len(), 1);
    }
}
