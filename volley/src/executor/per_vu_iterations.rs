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

/// Each of `vus` workers runs exactly `iterations` iterations, bounded by `max_duration`.
pub struct PerVuIterations {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    vus: usize,
    iterations: u64,
    max_duration: Duration,
}

impl PerVuIterations {
    pub fn new(config: ExecutorConfig) -> Self {
        let (vus, iterations, max_duration) = match config.kind {
            ExecutorKind::PerVuIterations {
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
impl Executor for PerVuIterations {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        let iterations = self.iterations;
        run_budgeted(&ctx, self.vus, self.max_duration, || {
            Budget::PerWorker(iterations)
        })
        .await
    }
}
