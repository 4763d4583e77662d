// packages/engine/src/consensus/coordinator.rs
//! Consensus coordinator
//!
//! Collects one decision per participant for a question, within a
//! deadline, and reduces them to a verdict. Every request has its own
//! mutex; the verdict is published once through a watch channel so any
//! number of callers can await it without missing the finalization.
//!
//! Lifecycle:
//!
//! ```text
//! open ──(all participants responded)──▶ finalized
//!   │──(deadline passed: late response, await, or sweep)──▶ finalized (timed out)
//!   │──(close: no further response can arrive)──▶ finalized
//!   └──(cancel)──▶ finalized (cancelled)
//! ```

use crate::consensus::strategy::{self, ConsensusOutcome, ConsensusResponse, ConsensusStrategy};
use crate::events::{Notifier, StateChange};
use crate::observability;
use crate::utils::errors::{EngineError, Result};
use crate::utils::ids::{InstanceId, RequestId, WorkflowId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A question put to a fixed set of participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub id: RequestId,
    pub workflow_id: WorkflowId,
    pub topic: String,
    pub participants: Vec<InstanceId>,
    pub responses: BTreeMap<InstanceId, ConsensusResponse>,
    pub strategy: ConsensusStrategy,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Bumped on every mutation
    pub version: u64,
    /// Immutable once set
    pub result: Option<ConsensusOutcome>,
}

impl ConsensusRequest {
    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }

    pub fn pending_participants(&self) -> Vec<InstanceId> {
        self.participants
            .iter()
            .filter(|p| !self.responses.contains_key(p))
            .copied()
            .collect()
    }

    fn finalize(&mut self, outcome: ConsensusOutcome) -> ConsensusOutcome {
        self.result = Some(outcome.clone());
        self.version += 1;
        outcome
    }

    fn reduce(&self) -> ConsensusOutcome {
        let responses: Vec<ConsensusResponse> = self.responses.values().cloned().collect();
        strategy::reduce(self.strategy, &responses)
    }
}

struct Slot {
    request: Mutex<ConsensusRequest>,
    /// Monotonic deadline used for all timing decisions
    deadline: Instant,
    done: watch::Sender<Option<ConsensusOutcome>>,
}

impl Slot {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

pub struct ConsensusCoordinator {
    requests: DashMap<RequestId, Arc<Slot>>,
    default_timeout: Duration,
    notifier: Notifier,
}

impl ConsensusCoordinator {
    pub fn new(default_timeout: Duration, notifier: Notifier) -> Self {
        Self {
            requests: DashMap::new(),
            default_timeout,
            notifier,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Open a request; duplicate participants are collapsed
    pub fn create_request(
        &self,
        workflow_id: WorkflowId,
        topic: impl Into<String>,
        participants: Vec<InstanceId>,
        strategy: ConsensusStrategy,
        timeout: Duration,
    ) -> Result<ConsensusRequest> {
        if participants.is_empty() {
            return Err(EngineError::Validation(
                "consensus request needs at least one participant".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(EngineError::Validation(
                "consensus timeout must be greater than zero".to_string(),
            ));
        }

        let mut unique = Vec::with_capacity(participants.len());
        for participant in participants {
            if !unique.contains(&participant) {
                unique.push(participant);
            }
        }

        let now = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .map(|d| now + d)
            .map_err(|_| EngineError::Validation(format!("consensus timeout {:?} is too large", timeout)))?;

        let request = ConsensusRequest {
            id: RequestId::new(),
            workflow_id,
            topic: topic.into(),
            participants: unique,
            responses: BTreeMap::new(),
            strategy,
            created_at: now,
            deadline,
            version: 0,
            result: None,
        };

        info!(
            "Opened consensus {} on '{}' ({} participants, {}, {:?})",
            request.id,
            request.topic,
            request.participants.len(),
            strategy,
            timeout
        );

        let (done, _) = watch::channel(None);
        let slot = Slot {
            request: Mutex::new(request.clone()),
            deadline: Instant::now() + timeout,
            done,
        };
        self.requests.insert(request.id, Arc::new(slot));
        Ok(request)
    }

    /// Record one participant's decision
    pub fn submit_response(
        &self,
        request_id: RequestId,
        agent_id: InstanceId,
        decision: impl Into<String>,
        confidence: Option<f64>,
    ) -> Result<ConsensusRequest> {
        let confidence = confidence.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::Validation(format!(
                "confidence {} must lie in [0, 1]",
                confidence
            )));
        }

        let slot = self.slot(request_id)?;
        let (snapshot, finalized, late) = {
            let mut request = slot.request.lock();

            if !request.participants.contains(&agent_id) {
                return Err(EngineError::UnknownParticipant {
                    request_id: request_id.to_string(),
                    agent_id: agent_id.to_string(),
                });
            }
            if request.is_finalized() {
                return Err(EngineError::AlreadyFinalized(request_id.to_string()));
            }

            if slot.is_expired() {
                let outcome = request.reduce().with_timed_out();
                let outcome = request.finalize(outcome);
                (request.clone(), Some(outcome), true)
            } else {
                if request.responses.contains_key(&agent_id) {
                    return Err(EngineError::ConcurrencyConflict(format!(
                        "{} already responded to {}",
                        agent_id, request_id
                    )));
                }

                request.responses.insert(
                    agent_id,
                    ConsensusResponse {
                        agent_id,
                        decision: decision.into(),
                        confidence,
                        responded_at: Utc::now(),
                    },
                );
                request.version += 1;
                debug!(
                    "Consensus {}: {}/{} responses",
                    request_id,
                    request.responses.len(),
                    request.participants.len()
                );

                let finalized = if request.pending_participants().is_empty() {
                    let outcome = request.reduce();
                    Some(request.finalize(outcome))
                } else {
                    None
                };
                (request.clone(), finalized, false)
            }
        };

        if let Some(outcome) = finalized {
            self.publish(&slot, &snapshot, outcome);
        }

        if late {
            warn!("Late response from {} to consensus {}", agent_id, request_id);
            return Err(EngineError::ConsensusTimeout(request_id.to_string()));
        }
        Ok(snapshot)
    }

    /// Finalize as cancelled
    pub fn cancel(&self, request_id: RequestId) -> Result<ConsensusOutcome> {
        let slot = self.slot(request_id)?;
        let (snapshot, outcome) = {
            let mut request = slot.request.lock();
            if request.is_finalized() {
                return Err(EngineError::AlreadyFinalized(request_id.to_string()));
            }
            let outcome = ConsensusOutcome::cancelled(request.strategy, request.responses.len());
            let outcome = request.finalize(outcome);
            (request.clone(), outcome)
        };

        info!("Cancelled consensus {}", request_id);
        self.publish(&slot, &snapshot, outcome.clone());
        Ok(outcome)
    }

    /// Wait for the verdict, finalizing over the partial set at the deadline
    pub async fn await_result(&self, request_id: RequestId) -> Result<ConsensusOutcome> {
        let slot = self.slot(request_id)?;
        let mut rx = slot.done.subscribe();

        let waited = tokio::time::timeout_at(slot.deadline, async {
            rx.wait_for(|outcome| outcome.is_some())
                .await
                .map(|outcome| outcome.clone())
        })
        .await;

        if let Ok(Ok(Some(outcome))) = waited {
            return Ok(outcome);
        }

        Ok(self.expire(&slot))
    }

    /// Finalize now over the responses received so far
    ///
    /// For callers that know no further response can arrive. Returns the
    /// existing verdict when the request is already final.
    pub fn close(&self, request_id: RequestId) -> Result<ConsensusOutcome> {
        let slot = self.slot(request_id)?;
        Ok(self.settle(&slot, false))
    }

    /// Finalize every request whose deadline has passed
    pub fn sweep_expired(&self) -> Vec<RequestId> {
        let slots: Vec<Arc<Slot>> = self
            .requests
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut expired = Vec::new();
        for slot in slots {
            if slot.request.lock().is_finalized() {
                continue;
            }
            let outcome = self.expire(&slot);
            if outcome.timed_out {
                expired.push(slot.request.lock().id);
            }
        }

        if !expired.is_empty() {
            debug!("Swept {} expired consensus requests", expired.len());
        }
        expired
    }

    /// Drop finalized requests older than `max_age`
    pub fn prune_finalized(&self, max_age: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_age) {
            Ok(age) => Utc::now() - age,
            Err(_) => return 0,
        };

        let before = self.requests.len();
        self.requests.retain(|_, slot| {
            let request = slot.request.lock();
            !(request.is_finalized() && request.deadline < cutoff)
        });
        before - self.requests.len()
    }

    /// Run the deadline sweeper until cancelled
    pub async fn run_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Consensus sweeper started (every {:?})", every);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_expired();
                }
                _ = cancel.cancelled() => {
                    info!("Consensus sweeper stopped");
                    break;
                }
            }
        }
    }

    pub fn get(&self, request_id: RequestId) -> Result<ConsensusRequest> {
        Ok(self.slot(request_id)?.request.lock().clone())
    }

    /// Requests still collecting responses
    pub fn list_open(&self) -> Vec<ConsensusRequest> {
        let mut open: Vec<ConsensusRequest> = self
            .requests
            .iter()
            .map(|e| e.value().request.lock().clone())
            .filter(|r| !r.is_finalized())
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }

    fn slot(&self, request_id: RequestId) -> Result<Arc<Slot>> {
        self.requests
            .get(&request_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| EngineError::not_found("consensus request", request_id))
    }

    /// Finalize over the responses received so far, unless already final
    fn expire(&self, slot: &Slot) -> ConsensusOutcome {
        self.settle(slot, true)
    }

    fn settle(&self, slot: &Slot, timed_out: bool) -> ConsensusOutcome {
        let (snapshot, outcome, newly) = {
            let mut request = slot.request.lock();
            if let Some(existing) = request.result.clone() {
                (request.clone(), existing, false)
            } else {
                let mut outcome = request.reduce();
                if timed_out {
                    outcome = outcome.with_timed_out();
                }
                let outcome = request.finalize(outcome);
                (request.clone(), outcome, true)
            }
        };

        if newly {
            info!(
                "Consensus {} settled with {}/{} responses{}",
                snapshot.id,
                snapshot.responses.len(),
                snapshot.participants.len(),
                if timed_out { " at its deadline" } else { "" }
            );
            self.publish(slot, &snapshot, outcome.clone());
        }
        outcome
    }

    fn publish(&self, slot: &Slot, request: &ConsensusRequest, outcome: ConsensusOutcome) {
        info!(
            "Consensus {} finalized: consensus={} decision={:?} confidence={:.3}",
            request.id, outcome.consensus, outcome.decision, outcome.confidence
        );
        metrics::counter!(observability::CONSENSUS_FINALIZED).increment(1);

        slot.done.send_replace(Some(outcome.clone()));
        self.notifier.notify(StateChange::ConsensusFinalized {
            request_id: request.id,
            workflow_id: request.workflow_id,
            outcome,
        });
    }
}
