// packages/engine/src/consensus/strategy.rs
//! Reduction of independent decisions into one verdict
//!
//! Pure functions over a response set; no locking or timing here.

use crate::utils::ids::InstanceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scores closer than this are a tie
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStrategy {
    /// Every response carries the same decision
    Unanimous,
    /// Most frequent decision wins
    #[default]
    Majority,
    /// Decision with the highest summed confidence wins
    Weighted,
}

impl fmt::Display for ConsensusStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusStrategy::Unanimous => write!(f, "unanimous"),
            ConsensusStrategy::Majority => write!(f, "majority"),
            ConsensusStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

/// One participant's decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResponse {
    pub agent_id: InstanceId,
    pub decision: String,
    /// In [0, 1]
    pub confidence: f64,
    pub responded_at: DateTime<Utc>,
}

/// Final verdict of a consensus request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub consensus: bool,
    pub decision: Option<String>,
    pub confidence: f64,
    pub reason: Option<String>,
    pub strategy: ConsensusStrategy,
    pub response_count: usize,
    /// Count (or summed confidence, when weighted) per decision
    pub tally: BTreeMap<String, f64>,
    /// Finalized at the deadline over a partial response set
    pub timed_out: bool,
    pub finalized_at: DateTime<Utc>,
}

impl ConsensusOutcome {
    fn agreed(strategy: ConsensusStrategy, decision: String, confidence: f64) -> Self {
        Self {
            consensus: true,
            decision: Some(decision),
            confidence,
            reason: None,
            strategy,
            response_count: 0,
            tally: BTreeMap::new(),
            timed_out: false,
            finalized_at: Utc::now(),
        }
    }

    fn rejected(strategy: ConsensusStrategy, reason: impl Into<String>) -> Self {
        Self {
            consensus: false,
            decision: None,
            confidence: 0.0,
            reason: Some(reason.into()),
            strategy,
            response_count: 0,
            tally: BTreeMap::new(),
            timed_out: false,
            finalized_at: Utc::now(),
        }
    }

    /// Verdict for a request cancelled before finalization
    pub fn cancelled(strategy: ConsensusStrategy, response_count: usize) -> Self {
        Self {
            response_count,
            ..Self::rejected(strategy, "cancelled")
        }
    }

    pub fn with_timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }
}

/// Reduce a response set with the given strategy
pub fn reduce(strategy: ConsensusStrategy, responses: &[ConsensusResponse]) -> ConsensusOutcome {
    if responses.is_empty() {
        return ConsensusOutcome::rejected(strategy, "no responses");
    }

    let mut outcome = match strategy {
        ConsensusStrategy::Unanimous => unanimous(responses),
        ConsensusStrategy::Majority => majority(responses),
        ConsensusStrategy::Weighted => weighted(responses),
    };
    outcome.response_count = responses.len();
    outcome
}

fn counts(responses: &[ConsensusResponse]) -> BTreeMap<String, f64> {
    let mut tally = BTreeMap::new();
    for response in responses {
        *tally.entry(response.decision.clone()).or_insert(0.0) += 1.0;
    }
    tally
}

fn unanimous(responses: &[ConsensusResponse]) -> ConsensusOutcome {
    let tally = counts(responses);
    let mut outcome = match tally.len() {
        1 => {
            let decision = responses[0].decision.clone();
            ConsensusOutcome::agreed(ConsensusStrategy::Unanimous, decision, 1.0)
        }
        _ => ConsensusOutcome::rejected(ConsensusStrategy::Unanimous, "decisions differ"),
    };
    outcome.tally = tally;
    outcome
}

fn majority(responses: &[ConsensusResponse]) -> ConsensusOutcome {
    let tally = counts(responses);
    let total = responses.len() as f64;
    let mut outcome = pick_winner(ConsensusStrategy::Majority, &tally, total);
    outcome.tally = tally;
    outcome
}

fn weighted(responses: &[ConsensusResponse]) -> ConsensusOutcome {
    let mut tally = BTreeMap::new();
    for response in responses {
        *tally.entry(response.decision.clone()).or_insert(0.0) += response.confidence;
    }

    let total: f64 = tally.values().sum();
    let mut outcome = if total <= 0.0 {
        ConsensusOutcome::rejected(ConsensusStrategy::Weighted, "zero total weight")
    } else {
        pick_winner(ConsensusStrategy::Weighted, &tally, total)
    };
    outcome.tally = tally;
    outcome
}

/// Highest-scoring decision, or a tie
fn pick_winner(
    strategy: ConsensusStrategy,
    tally: &BTreeMap<String, f64>,
    total: f64,
) -> ConsensusOutcome {
    let best = tally.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let leaders: Vec<&String> = tally
        .iter()
        .filter(|(_, score)| (best - **score).abs() < TIE_EPSILON)
        .map(|(decision, _)| decision)
        .collect();

    match leaders.as_slice() {
        [winner] => ConsensusOutcome::agreed(strategy, (*winner).clone(), best / total),
        _ => ConsensusOutcome::rejected(strategy, "tie"),
    }
}
