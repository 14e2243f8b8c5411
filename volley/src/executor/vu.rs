//! Looping workers shared by the VU-driven executors.
//!
//! A worker owns one [`WorkerSlot`] for its whole life and runs iterations back-to-back
//! until its budget runs out, the executor stops, or it is retired by a ramp-down.
use std::{
    future::pending,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::{drain, reap, ExecutionContext};
use crate::{error::Result, pool::WorkerSlot, state::RunState};

/// How many iterations a worker may still start.
#[derive(Debug, Clone)]
pub(crate) enum Budget {
    Unlimited,
    PerWorker(u64),
    Shared(Arc<AtomicU64>),
}

impl Budget {
    pub(crate) fn shared(total: u64) -> Self {
        Self::Shared(Arc::new(AtomicU64::new(total)))
    }

    /// Claims one iteration. `false` once the budget is spent.
    fn take(&mut self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::PerWorker(left) => match left.checked_sub(1) {
                Some(rest) => {
                    *left = rest;
                    true
                }
                None => false,
            },
            Self::Shared(left) => left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok(),
        }
    }
}

pub(crate) struct WorkerSpec {
    pub budget: Budget,
    /// Cancelled when a ramp-down no longer needs this worker.
    pub retire: CancellationToken,
    /// Grace an in-flight iteration gets after `retire`. `None` lets it finish.
    pub ramp_down_grace: Option<Duration>,
    pub paused: Option<watch::Receiver<bool>>,
}

impl WorkerSpec {
    pub(crate) fn with_budget(budget: Budget) -> Self {
        Self {
            budget,
            retire: CancellationToken::new(),
            ramp_down_grace: None,
            paused: None,
        }
    }
}

pub(crate) fn spawn_worker(
    ctx: &ExecutionContext,
    workers: &mut JoinSet<()>,
    slot: WorkerSlot,
    spec: WorkerSpec,
) {
    workers.spawn(worker_loop(ctx.clone(), slot, spec));
}

async fn worker_loop(ctx: ExecutionContext, slot: WorkerSlot, mut spec: WorkerSpec) {
    ctx.progress.worker_started();
    tracing::debug!(executor = %ctx.name, slot = slot.index(), "Worker started");

    loop {
        if ctx.stop.is_cancelled() || spec.retire.is_cancelled() {
            break;
        }
        if let Some(paused) = spec.paused.as_mut() {
            let is_paused = *paused.borrow_and_update();
            if is_paused {
                // the sender outlives every worker of the executor
                tokio::select! {
                    _ = ctx.stop.cancelled() => break,
                    _ = spec.retire.cancelled() => break,
                    _ = paused.changed() => continue,
                }
            }
        }
        if !spec.budget.take() {
            break;
        }
        ctx.run_iteration(&slot, retire_cutoff(&spec.retire, spec.ramp_down_grace))
            .await;
        tokio::task::yield_now().await;
    }

    tracing::debug!(executor = %ctx.name, slot = slot.index(), iterations = slot.iterations(), "Worker stopped");
    ctx.progress.worker_stopped();
}

async fn retire_cutoff(retire: &CancellationToken, grace: Option<Duration>) {
    match grace {
        Some(grace) => {
            retire.cancelled().await;
            tokio::time::sleep(grace).await;
        }
        None => pending().await,
    }
}

/// Runs `vus` workers until every budget is spent or `max_duration` is up, whichever
/// comes first. Running out of iterations finishes the executor without a graceful stop
/// phase.
pub(crate) async fn run_budgeted(
    ctx: &ExecutionContext,
    vus: usize,
    max_duration: Duration,
    budget: impl Fn() -> Budget,
) -> Result<RunState> {
    ctx.set_state(RunState::Starting);
    let Some(slots) = ctx.acquire_initial(vus).await? else {
        return Ok(ctx.stopped());
    };

    tracing::info!(executor = %ctx.name, vus, "Spawning workers...");
    let mut workers = JoinSet::new();
    for slot in slots {
        spawn_worker(ctx, &mut workers, slot, WorkerSpec::with_budget(budget()));
    }
    ctx.set_state(RunState::Running);

    let exhausted = tokio::select! {
        _ = drain(&mut workers) => true,
        _ = tokio::time::sleep(max_duration) => false,
        _ = ctx.cancel.cancelled() => false,
    };
    if exhausted && !ctx.cancel.is_cancelled() {
        tracing::info!(executor = %ctx.name, "All iterations done");
        return Ok(ctx.finished());
    }
    if !ctx.cancel.is_cancelled() {
        tracing::warn!(executor = %ctx.name, ?max_duration, "Max duration reached before all iterations ran");
    }
    Ok(ctx.graceful_stop(&mut workers).await)
}

/// Grows and shrinks a set of looping workers towards a target count.
pub(crate) struct VuScaler {
    ctx: ExecutionContext,
    workers: JoinSet<()>,
    /// Retire tokens of live workers, oldest first.
    active: Vec<CancellationToken>,
    ramp_down_grace: Option<Duration>,
    paused: Option<watch::Receiver<bool>>,
    starved: bool,
}

impl VuScaler {
    pub(crate) fn new(
        ctx: &ExecutionContext,
        ramp_down_grace: Option<Duration>,
        paused: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            ctx: ctx.clone(),
            workers: JoinSet::new(),
            active: Vec::new(),
            ramp_down_grace,
            paused,
            starved: false,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.len()
    }

    /// Starts a worker on a slot the executor already holds.
    pub(crate) fn adopt(&mut self, slot: WorkerSlot) {
        let retire = CancellationToken::new();
        self.active.push(retire.clone());
        let spec = WorkerSpec {
            budget: Budget::Unlimited,
            retire,
            ramp_down_grace: self.ramp_down_grace,
            paused: self.paused.clone(),
        };
        spawn_worker(&self.ctx, &mut self.workers, slot, spec);
    }

    /// Spawns or retires workers so that `target` are live. Growth is capped by what
    /// the pool can hand out right now; the shortfall is retried on the next call.
    pub(crate) fn scale_to(&mut self, target: usize) {
        reap(&mut self.workers);

        while self.active.len() > target {
            if let Some(retire) = self.active.pop() {
                retire.cancel();
            }
        }

        while self.active.len() < target {
            match self.ctx.pool.try_acquire() {
                Some(slot) => {
                    self.starved = false;
                    self.adopt(slot);
                }
                None => {
                    if !self.starved {
                        tracing::warn!(
                            executor = %self.ctx.name,
                            target,
                            active = self.active.len(),
                            "Worker pool exhausted, running below target"
                        );
                        self.starved = true;
                    }
                    break;
                }
            }
        }
    }

    pub(crate) fn into_workers(self) -> JoinSet<()> {
        self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_worker_budget_runs_out() {
        let mut budget = Budget::PerWorker(2);
        assert!(budget.take());
        assert!(budget.take());
        assert!(!budget.take());
        assert!(!budget.take());
    }

    #[test]
    fn shared_budget_is_split_between_clones() {
        let mut a = Budget::shared(3);
        let mut b = a.clone();
        assert!(a.take());
        assert!(b.take());
        assert!(b.take());
        assert!(!a.take());
        assert!(!b.take());
    }

    #[test]
    fn shared_budget_never_underflows_across_threads() {
        let budget = Budget::shared(1_000);
        let taken: u64 = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let mut budget = budget.clone();
                    s.spawn(move || {
                        let mut n = 0;
                        while budget.take() {
                            n += 1;
                        }
                        n
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(taken, 1_000);
    }
}
