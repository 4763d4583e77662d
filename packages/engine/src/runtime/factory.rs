// packages/engine/src/runtime/factory.rs
//! Agent factory
//!
//! Turns a per-capability [`AgentTemplate`] into a running instance through
//! the lifecycle manager. Used for on-demand creation when a ready task has
//! no available instance, for scale-up, and for pre-warming pools.
//!
//! # Architecture
//!
//! ```text
//! AgentFactory
//! ├─ Templates: {capability → AgentTemplate}
//! ├─ Counters:  {capability → n}        (instance names "{capability}-{n}")
//! └─ Permits:   Semaphore               (concurrent creations)
//! ```

use crate::runtime::agent_runtime::AgentConfig;
use crate::runtime::lifecycle::{AgentLifecycleManager, ManagedAgentInstance};
use crate::runtime::resource_limiter::{SecurityConstraints, SecurityLevel};
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::Capability;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Default configuration for instances of one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub capability: Capability,
    pub role: String,
    pub goal: String,
    pub tools: Vec<String>,
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl AgentTemplate {
    /// Minimal template for a capability nobody configured
    pub fn generic(capability: impl Into<Capability>) -> Self {
        let capability = capability.into();
        Self {
            role: capability.to_string(),
            goal: format!("Handle {} tasks", capability),
            capability,
            tools: vec![],
            security_level: SecurityLevel::Standard,
            parameters: serde_json::Value::Null,
        }
    }

    /// Instantiate the configuration for the instance named `name`
    pub fn to_config(&self, name: impl Into<String>) -> AgentConfig {
        let mut config = AgentConfig::new(name, self.capability.clone())
            .with_role(self.role.clone())
            .with_goal(self.goal.clone())
            .with_tools(self.tools.clone())
            .with_security_level(self.security_level);
        config.parameters = self.parameters.clone();
        config
    }

    pub fn constraints(&self) -> SecurityConstraints {
        SecurityConstraints::for_level(self.security_level)
    }
}

/// Creates instances from templates
pub struct AgentFactory {
    templates: DashMap<Capability, AgentTemplate>,
    counters: DashMap<Capability, AtomicU64>,
    /// Fall back to a generic template for unknown capabilities
    allow_generic: bool,
    permits: Arc<Semaphore>,
}

impl AgentFactory {
    pub fn new(templates: Vec<AgentTemplate>) -> Self {
        let factory = Self {
            templates: DashMap::new(),
            counters: DashMap::new(),
            allow_generic: true,
            permits: Arc::new(Semaphore::new(8)),
        };
        for template in templates {
            factory.register_template(template);
        }
        factory
    }

    /// Refuse capabilities without a registered template
    pub fn strict(mut self) -> Self {
        self.allow_generic = false;
        self
    }

    pub fn with_max_concurrent_creations(mut self, max: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn register_template(&self, template: AgentTemplate) {
        debug!("Registered template for {}", template.capability);
        self.templates.insert(template.capability.clone(), template);
    }

    pub fn template(&self, capability: &Capability) -> Result<AgentTemplate> {
        if let Some(template) = self.templates.get(capability) {
            return Ok(template.value().clone());
        }
        if self.allow_generic {
            return Ok(AgentTemplate::generic(capability.clone()));
        }
        Err(EngineError::not_found("agent template", capability))
    }

    pub fn templates(&self) -> Vec<AgentTemplate> {
        let mut templates: Vec<AgentTemplate> =
            self.templates.iter().map(|t| t.value().clone()).collect();
        templates.sort_by(|a, b| a.capability.cmp(&b.capability));
        templates
    }

    fn next_name(&self, capability: &Capability) -> String {
        let n = self
            .counters
            .entry(capability.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        format!("{}-{}", capability, n)
    }

    /// Start one instance of a capability
    pub async fn create(
        &self,
        capability: &Capability,
        lifecycle: &AgentLifecycleManager,
    ) -> Result<ManagedAgentInstance> {
        let template = self.template(capability)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::RuntimeError("agent factory is closed".to_string()))?;

        let config = template.to_config(self.next_name(capability));
        lifecycle.start_agent(config, template.constraints()).await
    }

    /// Start instances until the capability has at least `min_instances` live
    pub async fn prewarm(
        &self,
        capability: &Capability,
        min_instances: usize,
        lifecycle: &AgentLifecycleManager,
    ) -> Result<Vec<ManagedAgentInstance>> {
        let existing = lifecycle.count_by_capability(capability);
        if existing >= min_instances {
            return Ok(vec![]);
        }

        info!(
            "Pre-warming {} pool: {} -> {} instances",
            capability, existing, min_instances
        );

        let mut created = Vec::with_capacity(min_instances - existing);
        for _ in existing..min_instances {
            match self.create(capability, lifecycle).await {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    warn!("Pre-warm of {} stopped after {} instances: {}", capability, created.len(), e);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notifier;
    use crate::runtime::lifecycle::LifecycleConfig;
    use crate::runtime::scripted::ScriptedRuntime;

    fn lifecycle() -> AgentLifecycleManager {
        AgentLifecycleManager::new(
            Arc::new(ScriptedRuntime::new()),
            LifecycleConfig::default(),
            Notifier::new(),
        )
    }

    fn reviewer() -> AgentTemplate {
        AgentTemplate {
            capability: Capability::new("review"),
            role: "reviewer".to_string(),
            goal: "find defects".to_string(),
            tools: vec!["diff".to_string()],
            security_level: SecurityLevel::Strict,
            parameters: serde_json::json!({"depth": 2}),
        }
    }

    #[tokio::test]
    async fn test_create_uses_template() {
        let lifecycle = lifecycle();
        let factory = AgentFactory::new(vec![reviewer()]);

        let first = factory.create(&Capability::new("review"), &lifecycle).await.unwrap();
        let second = factory.create(&Capability::new("review"), &lifecycle).await.unwrap();

        assert_eq!(first.config.name, "review-1");
        assert_eq!(second.config.name, "review-2");
        assert_eq!(first.config.role, "reviewer");
        assert_eq!(first.config.parameters["depth"], 2);
        assert_eq!(first.constraints.level, SecurityLevel::Strict);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let lifecycle = lifecycle();

        let generic = AgentFactory::new(vec![]);
        let instance = generic.create(&Capability::new("misc"), &lifecycle).await.unwrap();
        assert_eq!(instance.config.role, "misc");

        let strict = AgentFactory::new(vec![]).strict();
        assert!(matches!(
            strict.create(&Capability::new("misc"), &lifecycle).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_prewarm_fills_to_minimum() {
        let lifecycle = lifecycle();
        let factory = AgentFactory::new(vec![reviewer()]);
        let capability = Capability::new("review");

        factory.create(&capability, &lifecycle).await.unwrap();
        let created = factory.prewarm(&capability, 3, &lifecycle).await.unwrap();

        assert_eq!(created.len(), 2);
        assert_eq!(lifecycle.count_by_capability(&capability), 3);
        assert!(factory.prewarm(&capability, 3, &lifecycle).await.unwrap().is_empty());
    }
}
