// packages/engine/src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Metric names live here so every emitter and the exporter agree on them.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const WORKFLOWS_CREATED: &str = "conductor_workflows_created_total";
pub const WORKFLOWS_COMPLETED: &str = "conductor_workflows_completed_total";
pub const WORKFLOWS_FAILED: &str = "conductor_workflows_failed_total";
pub const TASKS_COMPLETED: &str = "conductor_tasks_completed_total";
pub const TASKS_FAILED: &str = "conductor_tasks_failed_total";
pub const TASK_DURATION: &str = "conductor_task_duration_seconds";
pub const CONSENSUS_FINALIZED: &str = "conductor_consensus_finalized_total";
pub const CONSTRAINT_VIOLATIONS: &str = "conductor_constraint_violations_total";
pub const PROBE_FAILURES: &str = "conductor_probe_failures_total";
pub const AGENT_START_FAILURES: &str = "conductor_agent_start_failures_total";
pub const SCALING_ACTIONS: &str = "conductor_scaling_actions_total";
pub const AGENTS_ACTIVE: &str = "conductor_agents_active";

/// Install the global subscriber; `RUST_LOG` overrides the configured filter
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| EngineError::Config(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    installed.map_err(|e| EngineError::Config(format!("Failed to install subscriber: {}", e)))
}

/// Install the Prometheus recorder, serving `/metrics` when `addr` is set
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    match addr {
        Some(addr) => {
            let socket: SocketAddr = addr.parse().map_err(|e| {
                EngineError::Config(format!("Invalid metrics address '{}': {}", addr, e))
            })?;
            PrometheusBuilder::new()
                .with_http_listener(socket)
                .install()
                .map_err(|e| EngineError::Config(format!("Failed to start exporter: {}", e)))?;
            info!("Metrics exporter listening on {}", socket);
        }
        None => {
            PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| EngineError::Config(format!("Failed to install recorder: {}", e)))?;
        }
    }

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(WORKFLOWS_CREATED, "Workflows registered");
    describe_counter!(WORKFLOWS_COMPLETED, "Workflows that reached completed");
    describe_counter!(WORKFLOWS_FAILED, "Workflows that reached failed");
    describe_counter!(TASKS_COMPLETED, "Tasks completed");
    describe_counter!(TASKS_FAILED, "Task failures, including retried attempts");
    describe_histogram!(TASK_DURATION, Unit::Seconds, "Agent execution time per task");
    describe_counter!(CONSENSUS_FINALIZED, "Consensus requests finalized");
    describe_counter!(CONSTRAINT_VIOLATIONS, "Security constraint breaches observed");
    describe_counter!(PROBE_FAILURES, "Failed or stalled resource probes");
    describe_counter!(AGENT_START_FAILURES, "Agent instances that failed to start");
    describe_counter!(SCALING_ACTIONS, "Scaling actions executed, by direction");
    describe_gauge!(AGENTS_ACTIVE, "Agent instances currently active");
}
