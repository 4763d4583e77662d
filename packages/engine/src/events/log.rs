// packages/engine/src/events/log.rs
//! Lock-free bounded event log
//!
//! Keeps the most recent state changes in a fixed-capacity ring. When the
//! ring is full the oldest event is evicted.

use crate::events::{StateEvent, StateObserver};
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded log of recent state changes
pub struct EventLog {
    queue: ArrayQueue<StateEvent>,

    /// Events recorded
    push_count: AtomicU64,

    /// Events handed out to readers
    pop_count: AtomicU64,

    /// Events evicted because the ring was full
    evicted_count: AtomicU64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
        }
    }

    /// Record an event, evicting the oldest one if full
    pub fn push(&self, event: StateEvent) {
        if self.queue.force_push(event).is_some() {
            self.evicted_count.fetch_add(1, Ordering::Relaxed);
        }
        self.push_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the oldest event
    pub fn try_pop(&self) -> Option<StateEvent> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Take up to `max` events, oldest first
    pub fn drain(&self, max: usize) -> Vec<StateEvent> {
        let mut events = Vec::with_capacity(max.min(self.queue.len()));
        while events.len() < max {
            match self.try_pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            evicted_count: self.evicted_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

impl StateObserver for EventLog {
    fn on_state_change(&self, event: &StateEvent) {
        self.push(event.clone());
    }
}

/// Event log statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLogStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub evicted_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl EventLogStats {
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}
