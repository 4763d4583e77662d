// packages/engine/src/scaling/history.rs
//! Rolling window of load snapshots per capability

use crate::scaling::policy::LoadMetrics;
use crate::utils::ids::Capability;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Sample {
    recorded_at: Instant,
    metrics: LoadMetrics,
}

/// Load snapshots retained for a bounded period
#[derive(Debug)]
pub struct LoadHistory {
    retention: Duration,
    samples: HashMap<Capability, VecDeque<Sample>>,
}

impl LoadHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, metrics: LoadMetrics) {
        let now = Instant::now();
        self.samples
            .entry(metrics.capability.clone())
            .or_default()
            .push_back(Sample {
                recorded_at: now,
                metrics,
            });
        self.prune(now);
    }

    /// Drop samples older than the retention period
    pub fn prune(&mut self, now: Instant) {
        let retention = self.retention;
        for window in self.samples.values_mut() {
            while window
                .front()
                .is_some_and(|s| now.duration_since(s.recorded_at) > retention)
            {
                window.pop_front();
            }
        }
        self.samples.retain(|_, window| !window.is_empty());
    }

    /// Mean CPU over the samples recorded within `window`
    pub fn trailing_cpu(&self, capability: &Capability, window: Duration) -> Option<f64> {
        let now = Instant::now();
        let samples = self.samples.get(capability)?;

        let recent: Vec<f64> = samples
            .iter()
            .rev()
            .take_while(|s| now.duration_since(s.recorded_at) <= window)
            .map(|s| s.metrics.avg_cpu_percent)
            .collect();

        if recent.is_empty() {
            return None;
        }
        Some(recent.iter().sum::<f64>() / recent.len() as f64)
    }

    pub fn latest(&self, capability: &Capability) -> Option<&LoadMetrics> {
        self.samples
            .get(capability)
            .and_then(|w| w.back())
            .map(|s| &s.metrics)
    }

    /// Retained snapshots of one capability, oldest first
    pub fn snapshots(&self, capability: &Capability) -> Vec<LoadMetrics> {
        self.samples
            .get(capability)
            .map(|w| w.iter().map(|s| s.metrics.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.samples.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
