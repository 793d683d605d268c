use crate::{FlashError, FlashStatus, OperationRequest, SequencerObserver};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts operations and status polls seen by a sequencer.
#[derive(Debug)]
pub struct OperationMetrics {
    operations: AtomicU64,
    completed: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    polls: AtomicU64,
    busy_polls: AtomicU64,
}

/// Point-in-time copy of [`OperationMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub operations: u64,
    pub completed: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub polls: u64,
    pub busy_polls: u64,
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            operations: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            busy_polls: AtomicU64::new(0),
        }
    }

    pub fn get_operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn get_polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            operations: self.get_operations(),
            completed: self.completed.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            timeouts: self.get_timeouts(),
            polls: self.get_polls(),
            busy_polls: self.busy_polls.load(Ordering::SeqCst),
        }
    }
}

impl SequencerObserver for OperationMetrics {
    fn on_operation_start(&self, _request: &OperationRequest) {
        self.operations.fetch_add(1, Ordering::SeqCst);
    }

    fn on_poll(&self, status: FlashStatus) {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if status == FlashStatus::Busy {
            self.busy_polls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_operation_end(&self, _request: &OperationRequest, result: &Result<(), FlashError>) {
        let counter = match result {
            Ok(()) => &self.completed,
            Err(FlashError::Timeout) => &self.timeouts,
            Err(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}
