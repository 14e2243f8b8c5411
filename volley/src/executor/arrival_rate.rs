//! Shared driver for the arrival-rate executors.
//!
//! Instead of a fixed worker population, a governor loop ticks every `tick` and works out
//! how many iterations should have been started so far by integrating the rate curve.
//! Each due arrival is handed to an idle worker slot from the executor's reserve:
//!
//! - `pre_allocated_vus` slots are taken from the pool when the executor starts,
//! - the reserve may grow on demand up to `max_vus` while the pool has room,
//! - an arrival that finds no slot is dropped and counted, never queued.
//!
//! Slots go back to the reserve as soon as their iteration ends.
use std::{future::pending, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};

use super::{reap, ExecutionContext};
use crate::{error::Result, pool::WorkerSlot, stage::RampSequencer, state::RunState};

/// Number of arrivals due between the start of the timeline and `elapsed`, for a rate
/// expressed per `time_unit`.
///
/// The fractional remainder is never lost: it is carried implicitly by integrating from
/// zero every time, so the long-run count converges on `rate * elapsed / time_unit`.
pub fn arrivals_due(rate: &RampSequencer, elapsed: Duration, time_unit: Duration) -> u64 {
    let unit = time_unit.as_secs_f64();
    if unit <= 0.0 {
        return 0;
    }
    let due = rate.area_until(elapsed) / unit;
    if !due.is_finite() || due <= 0.0 {
        return 0;
    }
    // absorbs float error on exact boundaries
    (due + 1e-9).floor().min(u64::MAX as f64) as u64
}

pub(crate) struct ArrivalSchedule {
    pub rate: RampSequencer,
    pub time_unit: Duration,
    pub duration: Duration,
    pub pre_allocated: usize,
    pub max_vus: usize,
}

/// Slots owned by one arrival-rate executor.
struct Reserve {
    idle: Vec<WorkerSlot>,
    held: usize,
    max: usize,
    returns: mpsc::UnboundedReceiver<WorkerSlot>,
}

impl Reserve {
    fn take(&mut self, ctx: &ExecutionContext) -> Option<WorkerSlot> {
        if let Some(slot) = self.idle.pop() {
            return Some(slot);
        }
        if self.held >= self.max {
            return None;
        }
        let slot = ctx.pool.try_acquire()?;
        self.held += 1;
        tracing::debug!(executor = %ctx.name, held = self.held, "Reserve grew");
        Some(slot)
    }

    fn collect_returns(&mut self) {
        while let Ok(slot) = self.returns.try_recv() {
            self.idle.push(slot);
        }
    }
}

pub(crate) async fn drive(ctx: &ExecutionContext, schedule: &ArrivalSchedule) -> Result<RunState> {
    ctx.set_state(RunState::Starting);
    let Some(slots) = ctx.acquire_initial(schedule.pre_allocated).await? else {
        return Ok(ctx.stopped());
    };

    let (returns_tx, returns) = mpsc::unbounded_channel();
    let mut reserve = Reserve {
        held: slots.len(),
        idle: slots,
        max: schedule.max_vus.max(schedule.pre_allocated),
        returns,
    };
    let mut workers = JoinSet::new();

    tracing::info!(
        executor = %ctx.name,
        pre_allocated = schedule.pre_allocated,
        max_vus = reserve.max,
        "Spawning token governor..."
    );
    ctx.set_state(RunState::Running);

    let started = Instant::now();
    let mut ticker = tokio::time::interval(ctx.options.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut issued: u64 = 0;
    let mut dropped_total: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let elapsed = started.elapsed().min(schedule.duration);

        reap(&mut workers);
        reserve.collect_returns();

        let due = arrivals_due(&schedule.rate, elapsed, schedule.time_unit);
        let mut dropped = 0;
        while issued < due && !ctx.stop.is_cancelled() {
            issued += 1;
            match reserve.take(ctx) {
                Some(slot) => {
                    let start = ctx.begin_iteration(&slot);
                    let ctx = ctx.clone();
                    let returns = returns_tx.clone();
                    workers.spawn(async move {
                        ctx.run_begun(&slot, start, pending()).await;
                        // the governor is gone once the main phase ended, the slot then
                        // simply drops back into the pool
                        let _ = returns.send(slot);
                    });
                }
                None => {
                    ctx.progress.iteration_dropped();
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            if dropped_total == 0 {
                tracing::warn!(
                    executor = %ctx.name,
                    held = reserve.held,
                    "Insufficient workers, dropping iterations"
                );
            }
            dropped_total += dropped;
        }

        if elapsed >= schedule.duration {
            break;
        }
    }

    tracing::info!(executor = %ctx.name, issued, dropped = dropped_total, "Arrival schedule done");
    // idle slots go back to the pool right away
    drop(reserve);
    drop(returns_tx);
    Ok(ctx.graceful_stop(&mut workers).await)
}
