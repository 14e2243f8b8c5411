use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinSet;

use super::{
    vu::{spawn_worker, Budget, WorkerSpec},
    ExecutionContext, Executor,
};
use crate::{
    config::{ExecutorConfig, ExecutorKind},
    error::Result,
    progress::ExecutorProgress,
    state::RunState,
};

/// A fixed number of workers looping iterations back-to-back for a fixed duration.
pub struct ConstantVus {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    vus: usize,
    duration: Duration,
}

impl ConstantVus {
    pub fn new(config: ExecutorConfig) -> Self {
        let (vus, duration) = match config.kind {
            ExecutorKind::ConstantVus { vus, duration } => (vus, duration),
            _ => (0, Duration::ZERO),
        };
        let progress = Arc::new(ExecutorProgress::new(
            config.name.as_str().into(),
            config.kind.label(),
        ));
        Self {
            config,
            progress,
            vus,
            duration,
        }
    }
}

#[async_trait]
impl Executor for ConstantVus {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        ctx.set_state(RunState::Starting);
        let Some(slots) = ctx.acquire_initial(self.vus).await? else {
            return Ok(ctx.stopped());
        };

        tracing::info!(executor = %ctx.name, vus = self.vus, "Spawning workers...");
        let mut workers = JoinSet::new();
        for slot in slots {
            spawn_worker(&ctx, &mut workers, slot, WorkerSpec::with_budget(Budget::Unlimited));
        }
        ctx.set_state(RunState::Running);

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = ctx.cancel.cancelled() => {}
        }
        Ok(ctx.graceful_stop(&mut workers).await)
    }
}
