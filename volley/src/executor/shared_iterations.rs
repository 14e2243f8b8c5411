use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    vu::{run_budgeted, Budget},
    ExecutionContext, Executor,
};
use crate::{
    config::{ExecutorConfig, ExecutorKind},
    error::Result,
    progress::ExecutorProgress,
    state::RunState,
};

/// `vus` workers pull from one shared budget of `iterations` until it is spent or
/// `max_duration` is up. Faster workers end up running more iterations.
pub struct SharedIterations {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    vus: usize,
    iterations: u64,
    max_duration: Duration,
}

impl SharedIterations {
    pub fn new(config: ExecutorConfig) -> Self {
        let (vus, iterations, max_duration) = match config.kind {
            ExecutorKind::SharedIterations {
                vus,
                iterations,
                max_duration,
            } => (vus, iterations, max_duration),
            _ => (0, 0, Duration::ZERO),
        };
        let progress = Arc::new(ExecutorProgress::new(
            config.name.as_str().into(),
            config.kind.label(),
        ));
        Self {
            config,
            progress,
            vus,
            iterations,
            max_duration,
        }
    }
}

#[async_trait]
impl Executor for SharedIterations {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        let budget = Budget::shared(self.iterations);
        run_budgeted(&ctx, self.vus, self.max_duration, || budget.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::{executor::testing::harness, runner::IterationContext, sample::IterationOutcome};

    fn config(vus: usize, iterations: u64) -> ExecutorConfig {
        ExecutorConfig::builder()
            .name("shared")
            .kind(ExecutorKind::SharedIterations {
                vus,
                iterations,
                max_duration: Duration::from_secs(600),
            })
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_exactly_the_shared_budget() {
        let executor = SharedIterations::new(config(3, 100));
        let slow_slot = Arc::new(AtomicU64::new(0));
        let counted = slow_slot.clone();
        let h = harness(&executor, 3, move |ctx: IterationContext| {
            let counted = counted.clone();
            async move {
                // slot 0 is ten times slower than the others
                let ms = if ctx.slot == 0 {
                    counted.fetch_add(1, Ordering::SeqCst);
                    100
                } else {
                    10
                };
                tokio::time::sleep(Duration::from_millis(ms)).await;
                IterationOutcome::Success
            }
        });

        let state = executor.run(h.ctx.clone()).await.unwrap();

        assert_eq!(state, RunState::Finished);
        let snap = executor.progress().snapshot();
        assert_eq!(snap.iterations_started, 100);
        assert_eq!(snap.iterations_succeeded, 100);
        assert!(slow_slot.load(Ordering::SeqCst) < 10);
        assert_eq!(h.pool.busy(), 0);
    }
}
