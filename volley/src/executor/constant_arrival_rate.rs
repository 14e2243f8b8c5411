use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    arrival_rate::{drive, ArrivalSchedule},
    ExecutionContext, Executor,
};
use crate::{
    config::{ExecutorConfig, ExecutorKind, DEFAULT_TIME_UNIT},
    error::Result,
    progress::ExecutorProgress,
    stage::RampSequencer,
    state::RunState,
};

/// Starts `rate` iterations every `time_unit` for `duration`, independently of how long
/// each iteration takes.
pub struct ConstantArrivalRate {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    schedule: ArrivalSchedule,
}

impl ConstantArrivalRate {
    pub fn new(config: ExecutorConfig) -> Self {
        let schedule = match config.kind {
            ExecutorKind::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => ArrivalSchedule {
                rate: RampSequencer::constant(rate),
                time_unit,
                duration,
                pre_allocated: pre_allocated_vus,
                max_vus: max_vus.unwrap_or(pre_allocated_vus),
            },
            _ => ArrivalSchedule {
                rate: RampSequencer::constant(0.0),
                time_unit: DEFAULT_TIME_UNIT,
                duration: Duration::ZERO,
                pre_allocated: 0,
                max_vus: 0,
            },
        };
        let progress = Arc::new(ExecutorProgress::new(
            config.name.as_str().into(),
            config.kind.label(),
        ));
        Self {
            config,
            progress,
            schedule,
        }
    }
}

#[async_trait]
impl Executor for ConstantArrivalRate {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        drive(&ctx, &self.schedule).await
    }
}
