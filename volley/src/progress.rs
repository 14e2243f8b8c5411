//! Per-executor counters.
//!
//! Each executor owns one [`ExecutorProgress`] and is the only writer; the scheduler and
//! any observer read it through [`ExecutorProgress::snapshot`] without locking.
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    sample::IterationOutcome,
    state::{RunState, StateCell},
};

#[derive(Debug)]
pub struct ExecutorProgress {
    name: Arc<str>,
    kind: &'static str,
    state: StateCell,
    active_workers: AtomicUsize,
    in_flight: AtomicUsize,
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    forced: AtomicU64,
    dropped: AtomicU64,
    samples_dropped: AtomicU64,
}

/// Point-in-time copy of an executor's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub executor: String,
    pub kind: String,
    pub state: RunState,
    pub active_workers: usize,
    pub iterations_in_flight: usize,
    pub iterations_started: u64,
    pub iterations_succeeded: u64,
    pub iterations_failed: u64,
    pub iterations_timed_out: u64,
    /// Iterations cut off by graceful-stop deadlines or cancellation.
    pub iterations_forced: u64,
    /// Arrivals that found no free worker.
    pub iterations_dropped: u64,
    /// Samples the sink did not accept in time.
    pub samples_dropped: u64,
}

impl ProgressSnapshot {
    /// Iterations that ran to an outcome, whatever it was.
    pub fn iterations_completed(&self) -> u64 {
        self.iterations_succeeded
            + self.iterations_failed
            + self.iterations_timed_out
            + self.iterations_forced
    }
}

impl ExecutorProgress {
    pub fn new(name: Arc<str>, kind: &'static str) -> Self {
        Self {
            name,
            kind,
            state: StateCell::new(RunState::Pending),
            active_workers: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            forced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: RunState) -> RunState {
        self.state.set(state)
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_stopped(&self) {
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn iteration_started(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn iteration_ended(&self, outcome: &IterationOutcome) {
        let counter = match outcome {
            IterationOutcome::Success => &self.succeeded,
            IterationOutcome::Failed(_) => &self.failed,
            IterationOutcome::TimedOut => &self.timed_out,
            IterationOutcome::Forced => &self.forced,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn iteration_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            executor: self.name.to_string(),
            kind: self.kind.to_string(),
            state: self.state(),
            active_workers: self.active_workers(),
            iterations_in_flight: self.in_flight.load(Ordering::Acquire),
            iterations_started: self.started.load(Ordering::Acquire),
            iterations_succeeded: self.succeeded.load(Ordering::Acquire),
            iterations_failed: self.failed.load(Ordering::Acquire),
            iterations_timed_out: self.timed_out.load(Ordering::Acquire),
            iterations_forced: self.forced.load(Ordering::Acquire),
            iterations_dropped: self.dropped.load(Ordering::Acquire),
            samples_dropped: self.samples_dropped.load(Ordering::Acquire),
        }
    }
}

/// Broadcast whenever an executor changes state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorEvent {
    pub executor: Arc<str>,
    pub state: RunState,
}
