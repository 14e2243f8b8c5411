//! Executor whose worker count is set from outside while the run is in progress.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{sleep_until_opt, vu::VuScaler, ExecutionContext, Executor};
use crate::{
    config::{ExecutorConfig, ExecutorKind},
    error::{ControlError, Result},
    progress::ExecutorProgress,
    state::RunState,
};

/// Target the controller asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub vus: usize,
    pub paused: bool,
}

struct ControlShared {
    state: watch::Sender<ControlState>,
    max_vus: usize,
    stop: CancellationToken,
    closed: CancellationToken,
}

/// Cloneable handle to an [`ExternallyControlled`] executor.
///
/// Commands issued before the executor starts are picked up when it does. Once it has
/// ended every command fails with [`ControlError::Closed`].
#[derive(Clone)]
pub struct ExternalController {
    shared: Arc<ControlShared>,
}

impl std::fmt::Debug for ExternalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalController")
            .field("status", &self.status())
            .field("max_vus", &self.shared.max_vus)
            .finish()
    }
}

impl ExternalController {
    fn new(vus: usize, max_vus: usize) -> Self {
        let (state, _) = watch::channel(ControlState { vus, paused: false });
        Self {
            shared: Arc::new(ControlShared {
                state,
                max_vus,
                stop: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.shared.closed.is_cancelled() {
            return Err(ControlError::Closed);
        }
        Ok(())
    }

    pub fn set_vus(&self, vus: usize) -> Result<(), ControlError> {
        self.ensure_open()?;
        if vus > self.shared.max_vus {
            return Err(ControlError::ExceedsMaxVus {
                requested: vus,
                max: self.shared.max_vus,
            });
        }
        self.shared.state.send_modify(|s| s.vus = vus);
        Ok(())
    }

    /// Workers finish their current iteration and then wait for [`resume`](Self::resume).
    pub fn pause(&self) -> Result<(), ControlError> {
        self.ensure_open()?;
        self.shared.state.send_modify(|s| s.paused = true);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        self.ensure_open()?;
        self.shared.state.send_modify(|s| s.paused = false);
        Ok(())
    }

    /// Ends the executor's main phase now; in-flight iterations get the usual graceful stop.
    pub fn stop(&self) -> Result<(), ControlError> {
        self.ensure_open()?;
        self.shared.stop.cancel();
        Ok(())
    }

    pub fn status(&self) -> ControlState {
        *self.shared.state.borrow()
    }

    pub fn max_vus(&self) -> usize {
        self.shared.max_vus
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

/// Loops iterations on a worker count that an [`ExternalController`] sets at run time,
/// for `duration` (or until stopped when the duration is zero).
pub struct ExternallyControlled {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    duration: Duration,
    controller: ExternalController,
}

impl ExternallyControlled {
    pub fn new(config: ExecutorConfig) -> Self {
        let (vus, max_vus, duration) = match config.kind {
            ExecutorKind::ExternallyControlled {
                vus,
                max_vus,
                duration,
            } => (vus, max_vus.unwrap_or(vus).max(vus), duration),
            _ => (0, 0, Duration::ZERO),
        };
        let progress = Arc::new(ExecutorProgress::new(
            config.name.as_str().into(),
            config.kind.label(),
        ));
        Self {
            config,
            progress,
            duration,
            controller: ExternalController::new(vus, max_vus),
        }
    }

    async fn drive(&self, ctx: &ExecutionContext) -> Result<RunState> {
        let shared = &self.controller.shared;
        let mut commands = shared.state.subscribe();
        let initial = *commands.borrow_and_update();

        ctx.set_state(RunState::Starting);
        let Some(slots) = ctx.acquire_initial(initial.vus).await? else {
            return Ok(ctx.stopped());
        };

        let (paused_tx, paused_rx) = watch::channel(initial.paused);
        let mut scaler = VuScaler::new(ctx, None, Some(paused_rx));
        for slot in slots {
            scaler.adopt(slot);
        }
        ctx.set_state(RunState::Running);

        let deadline = (!self.duration.is_zero()).then(|| Instant::now() + self.duration);
        let mut target = initial.vus;
        let mut ticker = tokio::time::interval(ctx.options.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                _ = shared.stop.cancelled() => {
                    tracing::info!(executor = %ctx.name, "Stop requested by controller");
                    break;
                }
                _ = sleep_until_opt(deadline) => break,
                changed = commands.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let command = *commands.borrow_and_update();
                    tracing::info!(executor = %ctx.name, vus = command.vus, paused = command.paused, "Applying control command");
                    paused_tx.send_replace(command.paused);
                    target = command.vus;
                    scaler.scale_to(target);
                }
                // picks up slots that were busy when the target was raised
                _ = ticker.tick(), if scaler.active() < target => scaler.scale_to(target),
            }
        }

        let mut workers = scaler.into_workers();
        let state = ctx.graceful_stop(&mut workers).await;
        drop(paused_tx);
        Ok(state)
    }
}

#[async_trait]
impl Executor for ExternallyControlled {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    fn controller(&self) -> Option<ExternalController> {
        Some(self.controller.clone())
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        let res = self.drive(&ctx).await;
        self.controller.shared.closed.cancel();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{harness, sleeper};

    fn config(vus: usize, max_vus: usize, duration: Duration) -> ExecutorConfig {
        ExecutorConfig::builder()
            .name("ext")
            .kind(ExecutorKind::ExternallyControlled {
                vus,
                max_vus: Some(max_vus),
                duration,
            })
            .graceful_stop(Duration::from_secs(1))
            .build()
    }

    #[test]
    fn rejects_targets_above_max() {
        let executor = ExternallyControlled::new(config(1, 3, Duration::ZERO));
        let controller = executor.controller().unwrap();
        assert_eq!(
            controller.set_vus(4),
            Err(ControlError::ExceedsMaxVus {
                requested: 4,
                max: 3
            })
        );
        controller.set_vus(3).unwrap();
        assert_eq!(controller.status(), ControlState { vus: 3, paused: false });
    }

    #[tokio::test(start_paused = true)]
    async fn scales_pauses_and_stops_on_command() {
        let executor = ExternallyControlled::new(config(1, 4, Duration::ZERO));
        let controller = executor.controller().unwrap();
        let (runner, _) = sleeper(Duration::from_millis(100));
        let h = harness(&executor, 4, runner);
        let progress = executor.progress().clone();

        let script = tokio::spawn({
            let controller = controller.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(1050)).await;
                let before = progress.active_workers();
                controller.set_vus(4).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
                let scaled = progress.active_workers();

                controller.pause().unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
                let paused_at = progress.snapshot().iterations_started;
                tokio::time::sleep(Duration::from_secs(1)).await;
                let still_paused = progress.snapshot().iterations_started;
                controller.resume().unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
                let resumed = progress.snapshot().iterations_started;

                controller.set_vus(2).unwrap();
                tokio::time::sleep(Duration::from_millis(500)).await;
                let shrunk = progress.active_workers();
                controller.stop().unwrap();
                (before, scaled, paused_at, still_paused, resumed, shrunk)
            }
        });

        let state = executor.run(h.ctx.clone()).await.unwrap();
        let (before, scaled, paused_at, still_paused, resumed, shrunk) = script.await.unwrap();

        assert_eq!(state, RunState::Finished);
        assert_eq!(before, 1);
        assert_eq!(scaled, 4);
        assert_eq!(paused_at, still_paused);
        assert!(resumed > still_paused);
        assert_eq!(shrunk, 2);
        assert!(controller.is_closed());
        assert_eq!(controller.set_vus(1), Err(ControlError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_duration_ends_the_run() {
        let executor = ExternallyControlled::new(config(2, 2, Duration::from_secs(3)));
        let (runner, _) = sleeper(Duration::from_millis(400));
        let h = harness(&executor, 2, runner);

        let started = Instant::now();
        let state = executor.run(h.ctx.clone()).await.unwrap();

        assert_eq!(state, RunState::Finished);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(executor.progress().snapshot().iterations_succeeded, 16);
    }
}
