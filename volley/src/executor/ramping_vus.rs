use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};

use super::{vu::VuScaler, ExecutionContext, Executor};
use crate::{
    config::{vus_for, ExecutorConfig, ExecutorKind},
    error::Result,
    progress::ExecutorProgress,
    stage::RampSequencer,
    state::RunState,
};

/// Worker count follows the ramp stages.
///
/// Every tick the target is re-sampled from the [`RampSequencer`] and floored to whole
/// workers. Extra workers are spawned right away (as far as the pool allows); surplus
/// workers stop picking up iterations and their in-flight one gets `graceful_ramp_down`
/// to finish before it is forced.
pub struct RampingVus {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    start_vus: usize,
    sequencer: RampSequencer,
    stages: usize,
    graceful_ramp_down: Duration,
}

impl RampingVus {
    pub fn new(config: ExecutorConfig) -> Self {
        let (start_vus, sequencer, stages, graceful_ramp_down) = match &config.kind {
            ExecutorKind::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            } => (
                *start_vus,
                RampSequencer::new(*start_vus as f64, stages),
                stages.len(),
                *graceful_ramp_down,
            ),
            _ => (0, RampSequencer::constant(0.0), 0, Duration::ZERO),
        };
        let progress = Arc::new(ExecutorProgress::new(
            config.name.as_str().into(),
            config.kind.label(),
        ));
        Self {
            config,
            progress,
            start_vus,
            sequencer,
            stages,
            graceful_ramp_down,
        }
    }
}

#[async_trait]
impl Executor for RampingVus {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    fn planned_duration(&self) -> Duration {
        self.sequencer.total_duration()
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        ctx.set_state(RunState::Starting);
        let Some(slots) = ctx.acquire_initial(self.start_vus).await? else {
            return Ok(ctx.stopped());
        };

        let mut scaler = VuScaler::new(&ctx, Some(self.graceful_ramp_down), None);
        for slot in slots {
            scaler.adopt(slot);
        }
        ctx.set_state(RunState::Running);

        let total = self.sequencer.total_duration();
        let started = Instant::now();
        let mut ticker = tokio::time::interval(ctx.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stage = None;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let elapsed = started.elapsed();
            if elapsed >= total {
                break;
            }

            let current = self.sequencer.stage_at(elapsed);
            if current != stage {
                if let Some(index) = current {
                    tracing::info!(
                        executor = %ctx.name,
                        "Starting stage {}/{}",
                        index + 1,
                        self.stages
                    );
                }
                stage = current;
            }
            scaler.scale_to(vus_for(self.sequencer.value_at(elapsed)));
        }

        let mut workers = scaler.into_workers();
        Ok(ctx.graceful_stop(&mut workers).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DEFAULT_GRACEFUL_RAMP_DOWN,
        executor::testing::{harness, sleeper},
        stage::Stage,
    };

    fn config(start_vus: usize, stages: Vec<Stage>, graceful_ramp_down: Duration) -> ExecutorConfig {
        ExecutorConfig::builder()
            .name("ramp")
            .kind(ExecutorKind::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            })
            .graceful_stop(Duration::from_secs(5))
            .build()
    }

    async fn active_at(progress: Arc<ExecutorProgress>, at: Duration) -> usize {
        tokio::time::sleep(at).await;
        progress.active_workers()
    }

    #[tokio::test(start_paused = true)]
    async fn follows_the_ramp_up_and_down() {
        let executor = RampingVus::new(config(
            0,
            vec![
                Stage::new(Duration::from_secs(10), 10.0),
                Stage::new(Duration::from_secs(10), 0.0),
            ],
            DEFAULT_GRACEFUL_RAMP_DOWN,
        ));
        let (runner, _) = sleeper(Duration::from_millis(100));
        let h = harness(&executor, 10, runner);

        let watchers: Vec<_> = [5_500, 10_500, 15_500]
            .into_iter()
            .map(|ms| {
                tokio::spawn(active_at(
                    executor.progress().clone(),
                    Duration::from_millis(ms),
                ))
            })
            .collect();

        let started = Instant::now();
        let state = executor.run(h.ctx.clone()).await.unwrap();
        let took = started.elapsed();

        let mut seen = Vec::new();
        for watcher in watchers {
            seen.push(watcher.await.unwrap());
        }
        assert_eq!(state, RunState::Finished);
        assert_eq!(seen, [5, 9, 4]);
        assert!(took >= Duration::from_secs(20) && took < Duration::from_secs(21));
        assert_eq!(executor.progress().active_workers(), 0);
        assert_eq!(h.pool.busy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_down_grace_forces_long_iterations() {
        let executor = RampingVus::new(config(
            2,
            vec![
                Stage::new(Duration::ZERO, 1.0),
                Stage::new(Duration::from_secs(10), 1.0),
            ],
            Duration::from_secs(1),
        ));
        let (runner, _) = sleeper(Duration::from_secs(60));
        let h = harness(&executor, 2, runner);

        let state = executor.run(h.ctx.clone()).await.unwrap();

        let snap = executor.progress().snapshot();
        // one worker retired at the step and was forced 1s later, the other hit the
        // graceful stop deadline
        assert_eq!(snap.iterations_forced, 2);
        assert_eq!(state, RunState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_shortage_caps_growth() {
        let executor = RampingVus::new(config(
            1,
            vec![Stage::new(Duration::from_secs(4), 8.0)],
            DEFAULT_GRACEFUL_RAMP_DOWN,
        ));
        let (runner, peak) = sleeper(Duration::from_millis(100));
        let h = harness(&executor, 3, runner);

        let state = executor.run(h.ctx.clone()).await.unwrap();

        assert_eq!(state, RunState::Finished);
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(h.pool.created(), 3);
    }
}
