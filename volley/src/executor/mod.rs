//! Executor: orchestration of one load shape's timeline
//!
//! Every executor variant drives the same state machine
//! (`Pending -> Starting -> Running -> GracefulStop -> Finished | Stopped`) and shares the
//! same plumbing, bundled in an [`ExecutionContext`]:
//!
//! - the [`WorkerSlotPool`] every worker must hold a slot from,
//! - the [`IterationRunner`] that runs one script iteration,
//! - the [`SampleSink`] each finished iteration is emitted to,
//! - the executor's own [`ExecutorProgress`] counters,
//! - three cancellation tokens, from softest to hardest:
//!   - `stop`: no new iterations may start,
//!   - `force`: in-flight iterations are cut off and recorded as forced,
//!   - `cancel`: the whole run was cancelled (implies both of the above).
//!
//! # Variants
//!
//! | kind | drives | iteration trigger |
//! |---|---|---|
//! | [`ConstantVus`] | fixed worker count | workers loop back-to-back |
//! | [`RampingVus`] | worker count over time | ticks spawn/retire workers |
//! | [`PerVuIterations`] | fixed workers × fixed iterations | each worker runs N then retires |
//! | [`SharedIterations`] | fixed workers, shared budget | workers pull from a shared counter |
//! | [`ConstantArrivalRate`] | iterations per time unit | ticks start iterations on free slots |
//! | [`RampingArrivalRate`] | iterations per time unit over time | same, rate from the stages |
//! | [`ExternallyControlled`] | externally set worker count | workers loop back-to-back |
//!
//! # Graceful stop
//! When an executor's timeline ends it cancels `stop` and gives in-flight iterations up
//! to `graceful_stop` to finish. Past that it cancels `force` and ends as
//! [`RunState::Stopped`]; otherwise [`RunState::Finished`]. Run cancellation skips the
//! grace period entirely.
mod arrival_rate;
mod constant_arrival_rate;
mod constant_vus;
mod externally_controlled;
mod per_vu_iterations;
mod ramping_arrival_rate;
mod ramping_vus;
mod shared_iterations;
mod vu;

pub use arrival_rate::arrivals_due;
pub use constant_arrival_rate::ConstantArrivalRate;
pub use constant_vus::ConstantVus;
pub use externally_controlled::{ControlState, ExternalController, ExternallyControlled};
pub use per_vu_iterations::PerVuIterations;
pub use ramping_arrival_rate::RampingArrivalRate;
pub use ramping_vus::RampingVus;
pub use shared_iterations::SharedIterations;

use std::{
    any::Any,
    collections::BTreeMap,
    future::{pending, Future},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    sync::broadcast,
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::{ExecutorConfig, ExecutorKind},
    error::{Error, Result},
    pool::{NoopHooks, SlotHooks, WorkerSlot, WorkerSlotPool},
    progress::{ExecutorEvent, ExecutorProgress},
    runner::{IterationContext, IterationRunner},
    sample::{IterationOutcome, IterationRecord, Sample, SampleSink},
    state::RunState,
};

/// One load shape. Implementations own their timeline; shared plumbing comes in through
/// the [`ExecutionContext`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn config(&self) -> &ExecutorConfig;

    fn progress(&self) -> &Arc<ExecutorProgress>;

    fn name(&self) -> &str {
        &self.config().name
    }

    /// Length of the main phase, graceful stop excluded.
    fn planned_duration(&self) -> Duration {
        self.config().kind.planned_duration()
    }

    fn graceful_stop(&self) -> Duration {
        self.config().graceful_stop
    }

    /// Handle for executors that accept commands at run time.
    fn controller(&self) -> Option<ExternalController> {
        None
    }

    /// Drives the executor to a terminal state, which is also returned.
    async fn run(&self, ctx: ExecutionContext) -> Result<RunState>;
}

/// Builds the executor variant matching `config.kind`.
pub fn build(config: &ExecutorConfig) -> Arc<dyn Executor> {
    match &config.kind {
        ExecutorKind::ConstantVus { .. } => Arc::new(ConstantVus::new(config.clone())),
        ExecutorKind::RampingVus { .. } => Arc::new(RampingVus::new(config.clone())),
        ExecutorKind::PerVuIterations { .. } => Arc::new(PerVuIterations::new(config.clone())),
        ExecutorKind::SharedIterations { .. } => Arc::new(SharedIterations::new(config.clone())),
        ExecutorKind::ConstantArrivalRate { .. } => {
            Arc::new(ConstantArrivalRate::new(config.clone()))
        }
        ExecutorKind::RampingArrivalRate { .. } => {
            Arc::new(RampingArrivalRate::new(config.clone()))
        }
        ExecutorKind::ExternallyControlled { .. } => {
            Arc::new(ExternallyControlled::new(config.clone()))
        }
    }
}

/// Run-wide tunables.
#[derive(Clone, TypedBuilder)]
pub struct RunOptions {
    /// How often ramping and arrival-rate executors re-sample their targets.
    #[builder(default = Duration::from_millis(10))]
    pub tick: Duration,
    /// Upper bound on a single sink emit.
    #[builder(default = Duration::from_millis(100))]
    pub emit_timeout: Duration,
    /// How long a starting executor waits for its initial worker slots.
    #[builder(default = Duration::from_secs(60))]
    pub allocation_timeout: Duration,
    #[builder(default = Arc::new(NoopHooks))]
    pub slot_hooks: Arc<dyn SlotHooks>,
    /// Buffered executor events per subscriber.
    #[builder(default = 256)]
    pub event_capacity: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("tick", &self.tick)
            .field("emit_timeout", &self.emit_timeout)
            .field("allocation_timeout", &self.allocation_timeout)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

/// Shared state handed to an executor's coordinating task and all its workers.
#[derive(Clone)]
pub struct ExecutionContext {
    pub(crate) name: Arc<str>,
    pub(crate) tags: Arc<BTreeMap<String, String>>,
    pub(crate) graceful_stop: Duration,
    pub(crate) pool: WorkerSlotPool,
    pub(crate) runner: Arc<dyn IterationRunner>,
    pub(crate) sink: Arc<dyn SampleSink>,
    pub(crate) progress: Arc<ExecutorProgress>,
    pub(crate) events: broadcast::Sender<ExecutorEvent>,
    pub(crate) options: RunOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) force: CancellationToken,
    pub(crate) stop: CancellationToken,
}

pub(crate) struct ContextParts {
    pub pool: WorkerSlotPool,
    pub runner: Arc<dyn IterationRunner>,
    pub sink: Arc<dyn SampleSink>,
    pub events: broadcast::Sender<ExecutorEvent>,
    pub options: RunOptions,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(executor: &dyn Executor, parts: ContextParts) -> Self {
        let config = executor.config();
        let mut tags = config.tags.clone();
        tags.insert("executor".to_string(), config.name.clone());
        tags.insert("executor_kind".to_string(), config.kind.label().to_string());

        let force = parts.cancel.child_token();
        let stop = force.child_token();
        Self {
            name: config.name.as_str().into(),
            tags: Arc::new(tags),
            graceful_stop: config.graceful_stop,
            pool: parts.pool,
            runner: parts.runner,
            sink: parts.sink,
            progress: Arc::clone(executor.progress()),
            events: parts.events,
            options: parts.options,
            cancel: parts.cancel,
            force,
            stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn set_state(&self, state: RunState) {
        let previous = self.progress.set_state(state);
        if previous == state {
            return;
        }
        tracing::info!(executor = %self.name, %previous, %state, "Executor state changed");
        // nobody listening is fine
        let _ = self.events.send(ExecutorEvent {
            executor: Arc::clone(&self.name),
            state,
        });
    }

    /// Marks the executor as stopped without having run to completion.
    pub(crate) fn stopped(&self) -> RunState {
        self.set_state(RunState::Stopped);
        RunState::Stopped
    }

    pub(crate) fn finished(&self) -> RunState {
        self.set_state(RunState::Finished);
        RunState::Finished
    }

    /// Waits for `n` slots, polling the pool once per tick. `Ok(None)` means the run was
    /// cancelled while waiting.
    pub(crate) async fn acquire_initial(&self, n: usize) -> Result<Option<Vec<WorkerSlot>>> {
        let deadline = Instant::now() + self.options.allocation_timeout;
        loop {
            if let Some(slots) = self.pool.try_acquire_many(n) {
                return Ok(Some(slots));
            }
            if Instant::now() >= deadline {
                return Err(Error::SlotsUnavailable {
                    executor: self.name.to_string(),
                    needed: n,
                });
            }
            tracing::debug!(executor = %self.name, needed = n, busy = self.pool.busy(), "Waiting for worker slots");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.options.tick) => {}
            }
        }
    }

    /// Runs one iteration on `slot` and emits its sample.
    ///
    /// The iteration is cut off (and recorded as [`IterationOutcome::Forced`]) when the
    /// executor is force-stopped or when `cutoff` resolves.
    pub(crate) async fn run_iteration(
        &self,
        slot: &WorkerSlot,
        cutoff: impl Future<Output = ()>,
    ) -> IterationOutcome {
        let start = self.begin_iteration(slot);
        self.run_begun(slot, start, cutoff).await
    }

    /// Claims the next iteration number on `slot` and counts it as started.
    ///
    /// Callers that hand the run to another task claim here first, so that start order
    /// follows the order of the calls.
    pub(crate) fn begin_iteration(&self, slot: &WorkerSlot) -> IterationStart {
        self.progress.iteration_started();
        IterationStart {
            iteration: slot.begin_iteration(),
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    /// Runs an iteration claimed with [`begin_iteration`](Self::begin_iteration).
    pub(crate) async fn run_begun(
        &self,
        slot: &WorkerSlot,
        start: IterationStart,
        cutoff: impl Future<Output = ()>,
    ) -> IterationOutcome {
        let IterationStart {
            iteration,
            started_at,
            started,
        } = start;
        let cancel = self.force.child_token();

        let ctx = IterationContext {
            executor: Arc::clone(&self.name),
            slot: slot.index(),
            iteration,
            cancel: cancel.clone(),
        };
        let run = AssertUnwindSafe(self.runner.run_iteration(ctx)).catch_unwind();
        let outcome = tokio::select! {
            res = run => res.unwrap_or_else(|panic| {
                let reason = panic_message(panic.as_ref());
                tracing::error!(executor = %self.name, slot = slot.index(), iteration, %reason, "Iteration panicked");
                IterationOutcome::failed(format!("panicked: {reason}"))
            }),
            _ = self.force.cancelled() => IterationOutcome::Forced,
            _ = cutoff => IterationOutcome::Forced,
        };
        cancel.cancel();
        self.progress.iteration_ended(&outcome);
        if outcome == IterationOutcome::Forced {
            tracing::debug!(executor = %self.name, slot = slot.index(), iteration, "Iteration force-terminated");
        }

        let sample = Sample {
            record: IterationRecord {
                executor: Arc::clone(&self.name),
                slot: slot.index(),
                iteration,
                started_at,
                duration: started.elapsed(),
                outcome: outcome.clone(),
            },
            tags: Arc::clone(&self.tags),
        };
        if tokio::time::timeout(self.options.emit_timeout, self.sink.emit(sample))
            .await
            .is_err()
        {
            self.progress.sample_dropped();
            tracing::warn!(executor = %self.name, "Sample sink too slow, sample dropped");
        }
        outcome
    }

    /// Ends the main phase: no new iterations, in-flight ones get `graceful_stop` to
    /// finish before they are forced.
    pub(crate) async fn graceful_stop(&self, workers: &mut JoinSet<()>) -> RunState {
        self.stop.cancel();
        if self.cancel.is_cancelled() {
            // force is a child of cancel: in-flight iterations are already unwinding
            drain(workers).await;
            return self.stopped();
        }

        self.set_state(RunState::GracefulStop);
        let drained = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = tokio::time::timeout(self.graceful_stop, drain(workers)) => res.is_ok(),
        };
        if drained {
            return self.finished();
        }

        let in_flight = self.progress.snapshot().iterations_in_flight;
        if !self.cancel.is_cancelled() {
            tracing::warn!(
                executor = %self.name,
                in_flight,
                graceful_stop = ?self.graceful_stop,
                "Graceful stop expired, forcing remaining iterations"
            );
        }
        self.force.cancel();
        drain(workers).await;
        self.stopped()
    }
}

/// An iteration that has been numbered and counted but not run yet.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IterationStart {
    pub(crate) iteration: u64,
    started_at: SystemTime,
    started: Instant,
}

/// Waits for every task in `workers`, logging panics.
pub(crate) async fn drain(workers: &mut JoinSet<()>) {
    while let Some(res) = workers.join_next().await {
        log_join_error(res);
    }
}

/// Collects already finished workers without waiting.
pub(crate) fn reap(workers: &mut JoinSet<()>) {
    while let Some(Some(res)) = workers.join_next().now_or_never() {
        log_join_error(res);
    }
}

fn log_join_error(res: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            tracing::error!("Worker panicked with error: {e}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Harness for driving a single executor outside the scheduler.
    use super::*;
    use crate::{aggregate::BasicAggregate, sample::AggregateSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Harness {
        pub ctx: ExecutionContext,
        pub sink: Arc<AggregateSink<BasicAggregate>>,
        pub pool: WorkerSlotPool,
    }

    pub(crate) fn harness(executor: &dyn Executor, ceiling: usize, runner: impl IterationRunner) -> Harness {
        let pool = WorkerSlotPool::new(ceiling);
        let sink = Arc::new(AggregateSink::<BasicAggregate>::new());
        let (events, _) = broadcast::channel(64);
        let ctx = ExecutionContext::new(
            executor,
            ContextParts {
                pool: pool.clone(),
                runner: Arc::new(runner),
                sink: sink.clone(),
                events,
                options: RunOptions::default(),
                cancel: CancellationToken::new(),
            },
        );
        Harness { ctx, sink, pool }
    }

    /// Runner that sleeps for `duration` and tracks how many iterations overlap.
    pub(crate) fn sleeper(
        duration: Duration,
    ) -> (
        impl IterationRunner,
        Arc<AtomicUsize>,
    ) {
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak_out = peak.clone();
        let runner = move |_ctx: IterationContext| {
            let peak = peak.clone();
            let current = current.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                current.fetch_sub(1, Ordering::SeqCst);
                IterationOutcome::Success
            }
        };
        (runner, peak_out)
    }
}
