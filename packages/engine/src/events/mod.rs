// packages/engine/src/events/mod.rs
//! State-change notifications
//!
//! Every component reports its transitions through a [`Notifier`], which
//! synchronously invokes each registered [`StateObserver`] after the
//! transition has been applied and all engine locks are released. The
//! engine ships one observer, the bounded [`EventLog`].

pub mod log;

pub use log::{EventLog, EventLogStats};

use crate::consensus::strategy::ConsensusOutcome;
use crate::executor::workflow::{TaskStatus, WorkflowStatus};
use crate::runtime::lifecycle::AgentStatus;
use crate::runtime::resource_limiter::ConstraintViolation;
use crate::scaling::policy::ScalingAction;
use crate::utils::ids::{Capability, InstanceId, RequestId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A transition somewhere in the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateChange {
    WorkflowStatus {
        workflow_id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
    TaskStatus {
        workflow_id: WorkflowId,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    AgentStatus {
        instance_id: InstanceId,
        capability: Capability,
        from: AgentStatus,
        to: AgentStatus,
        reason: Option<String>,
    },
    ConstraintViolated {
        instance_id: InstanceId,
        violations: Vec<ConstraintViolation>,
    },
    ConsensusFinalized {
        request_id: RequestId,
        workflow_id: WorkflowId,
        outcome: ConsensusOutcome,
    },
    ScalingExecuted {
        action: ScalingAction,
        instance_id: Option<InstanceId>,
    },
}

/// A sequenced, timestamped state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub change: StateChange,
}

/// Hook invoked after each transition
pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, event: &StateEvent);
}

impl<F> StateObserver for F
where
    F: Fn(&StateEvent) + Send + Sync,
{
    fn on_state_change(&self, event: &StateEvent) {
        self(event)
    }
}

/// Fan-out of state changes to registered observers
#[derive(Clone, Default)]
pub struct Notifier {
    observers: Arc<RwLock<Vec<Arc<dyn StateObserver>>>>,
    seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.observers.read().len())
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.observers.write().push(observer);
    }

    /// Deliver one change to every observer
    pub fn notify(&self, change: StateChange) {
        let event = StateEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            at: Utc::now(),
            change,
        };

        // Clone the list so observers may subscribe from inside a callback
        let observers: Vec<Arc<dyn StateObserver>> = self.observers.read().clone();
        for observer in observers {
            observer.on_state_change(&event);
        }
    }

    pub fn notify_all(&self, changes: impl IntoIterator<Item = StateChange>) {
        for change in changes {
            self.notify(change);
        }
    }

    /// Number of events emitted so far
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}
