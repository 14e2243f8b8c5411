//! Execution scheduler: runs a whole [`LoadProfile`].
//!
//! The scheduler validates the profile up front, builds one executor per entry over a
//! shared [`WorkerSlotPool`], starts every executor at its planned offset from the run
//! start and folds the executors' states into the state of the run.
//!
//! Cancellation is a single [`CancellationToken`]: every executor context derives its
//! tokens from it, so cancelling it stops all executors at once. The scheduler then waits
//! up to the profile's `shutdown_timeout` for them to unwind and aborts whatever is left.
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use tokio::{sync::broadcast, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{LoadProfile, Plan},
    error::{ConfigError, Error, Result},
    executor::{
        self, sleep_until_opt, ContextParts, ExecutionContext, Executor, ExternalController,
        RunOptions,
    },
    pool::WorkerSlotPool,
    progress::{ExecutorEvent, ProgressSnapshot},
    runner::IterationRunner,
    sample::SampleSink,
    state::{aggregate_run_state, RunState, StateCell},
};

/// Checks `profile` without running anything.
pub fn validate(profile: &LoadProfile) -> Result<Plan, ConfigError> {
    profile.validate()
}

pub struct Scheduler {
    profile: LoadProfile,
    plan: Plan,
    executors: Vec<Arc<dyn Executor>>,
    pool: WorkerSlotPool,
    runner: Arc<dyn IterationRunner>,
    sink: Arc<dyn SampleSink>,
    options: RunOptions,
    events: broadcast::Sender<ExecutorEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
    done: AtomicBool,
    outcome: StateCell,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("plan", &self.plan)
            .field("pool", &self.pool)
            .field("state", &self.current_run_state())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Validates `profile` and prepares a run with default [`RunOptions`].
    pub fn new<R, S>(profile: LoadProfile, runner: R, sink: Arc<S>) -> Result<Self, ConfigError>
    where
        R: IterationRunner,
        S: SampleSink + 'static,
    {
        Self::with_options(profile, runner, sink, RunOptions::default())
    }

    pub fn with_options<R, S>(
        profile: LoadProfile,
        runner: R,
        sink: Arc<S>,
        options: RunOptions,
    ) -> Result<Self, ConfigError>
    where
        R: IterationRunner,
        S: SampleSink + 'static,
    {
        let plan = profile.validate()?;
        let executors = profile.executors.iter().map(executor::build).collect();
        let pool =
            WorkerSlotPool::with_hooks(plan.ceiling, plan.preallocate, options.slot_hooks.clone());
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        Ok(Self {
            profile,
            plan,
            executors,
            pool,
            runner: Arc::new(runner),
            sink,
            options,
            events,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            outcome: StateCell::new(RunState::Pending),
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn profile(&self) -> &LoadProfile {
        &self.profile
    }

    pub fn pool(&self) -> &WorkerSlotPool {
        &self.pool
    }

    /// Stream of executor state transitions. Subscribe before [`start`](Self::start) to
    /// see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    /// Control handle of the externally controlled executor called `name`.
    pub fn controller(&self, name: &str) -> Option<ExternalController> {
        self.executors
            .iter()
            .find(|e| e.name() == name)
            .and_then(|e| e.controller())
    }

    /// Cancels the run. Same as cancelling the token passed to [`start`](Self::start).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Per-executor counters. Never blocks.
    pub fn progress_snapshot(&self) -> Vec<ProgressSnapshot> {
        self.executors
            .iter()
            .map(|e| e.progress().snapshot())
            .collect()
    }

    pub fn current_run_state(&self) -> RunState {
        if self.done.load(Ordering::Acquire) {
            return self.outcome.get();
        }
        aggregate_run_state(
            &self.executor_states(),
            self.started.load(Ordering::Acquire),
            self.cancel.is_cancelled(),
        )
    }

    fn executor_states(&self) -> Vec<RunState> {
        self.executors.iter().map(|e| e.progress().state()).collect()
    }

    /// Runs the profile to completion.
    ///
    /// Resolves to the final run state once every executor is done, or to
    /// [`Error::Cancelled`] when `cancel` (or [`Scheduler::cancel`]) stopped the run.
    /// A scheduler runs once.
    pub async fn start(&self, cancel: CancellationToken) -> Result<RunState> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let link = tokio::spawn({
            let external = cancel;
            let run = self.cancel.clone();
            async move {
                tokio::select! {
                    _ = external.cancelled() => run.cancel(),
                    _ = run.cancelled() => {}
                }
            }
        });

        tracing::info!(
            executors = self.executors.len(),
            ceiling = self.plan.ceiling,
            peak_workers = self.plan.peak_workers,
            "Starting run"
        );
        let run_start = Instant::now();
        let mut tasks = JoinSet::new();
        for (executor, planned) in self.executors.iter().zip(&self.plan.executors) {
            let ctx = ExecutionContext::new(
                executor.as_ref(),
                ContextParts {
                    pool: self.pool.clone(),
                    runner: Arc::clone(&self.runner),
                    sink: Arc::clone(&self.sink),
                    events: self.events.clone(),
                    options: self.options.clone(),
                    cancel: self.cancel.clone(),
                },
            );
            let executor = Arc::clone(executor);
            let start_at = run_start.checked_add(planned.start);
            tasks.spawn(run_executor(executor, ctx, start_at));
        }

        tokio::select! {
            _ = wait_all(&mut tasks) => {}
            _ = self.cancel.cancelled() => {
                tracing::info!("Run cancelled, waiting for executors to unwind");
                let shutdown = self.profile.shutdown_timeout;
                if tokio::time::timeout(shutdown, wait_all(&mut tasks)).await.is_err() {
                    tracing::warn!(?shutdown, "Executors did not unwind in time, aborting");
                    tasks.abort_all();
                    wait_all(&mut tasks).await;
                }
            }
        }
        link.abort();

        // aborted or panicked executors never reached a terminal state themselves
        for executor in &self.executors {
            if !executor.progress().state().is_terminal() {
                executor.progress().set_state(RunState::Stopped);
            }
        }
        self.pool.teardown();

        let cancelled = self.cancel.is_cancelled();
        let state = aggregate_run_state(&self.executor_states(), true, cancelled);
        self.outcome.set(state);
        self.done.store(true, Ordering::Release);
        tracing::info!(%state, elapsed = ?run_start.elapsed(), "Run complete");

        if cancelled {
            Err(Error::Cancelled)
        } else {
            Ok(state)
        }
    }
}

async fn run_executor(executor: Arc<dyn Executor>, ctx: ExecutionContext, start_at: Option<Instant>) {
    let waited = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => false,
        _ = sleep_until_opt(start_at) => true,
    };
    if !waited {
        ctx.stopped();
        return;
    }

    tracing::info!(executor = %ctx.name, kind = executor.config().kind.label(), "Starting executor");
    let res = AssertUnwindSafe(executor.run(ctx.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(Error::ExecutorPanicked {
                executor: ctx.name.to_string(),
            })
        });
    match res {
        Ok(state) => tracing::info!(executor = %ctx.name, %state, "Executor done"),
        Err(e) => {
            // only this executor stops, siblings carry on
            tracing::error!(executor = %ctx.name, error = %e, "Executor failed");
            ctx.force.cancel();
            ctx.stopped();
        }
    }
}

async fn wait_all(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                tracing::error!("Executor task panicked with error: {e}");
            }
        }
    }
}
