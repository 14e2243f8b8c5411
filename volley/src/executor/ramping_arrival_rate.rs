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

/// Iterations started per `time_unit` follow the ramp stages, starting from `start_rate`.
pub struct RampingArrivalRate {
    config: ExecutorConfig,
    progress: Arc<ExecutorProgress>,
    schedule: ArrivalSchedule,
}

impl RampingArrivalRate {
    pub fn new(config: ExecutorConfig) -> Self {
        let schedule = match &config.kind {
            ExecutorKind::RampingArrivalRate {
                start_rate,
                time_unit,
                stages,
                pre_allocated_vus,
                max_vus,
            } => {
                let rate = RampSequencer::new(*start_rate, stages);
                ArrivalSchedule {
                    duration: rate.total_duration(),
                    rate,
                    time_unit: *time_unit,
                    pre_allocated: *pre_allocated_vus,
                    max_vus: max_vus.unwrap_or(*pre_allocated_vus),
                }
            }
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
impl Executor for RampingArrivalRate {
    fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn progress(&self) -> &Arc<ExecutorProgress> {
        &self.progress
    }

    fn planned_duration(&self) -> Duration {
        self.schedule.duration
    }

    async fn run(&self, ctx: ExecutionContext) -> Result<RunState> {
        drive(&ctx, &self.schedule).await
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        executor::testing::harness, runner::IterationContext, sample::IterationOutcome,
        stage::Stage,
    };

    #[tokio::test(start_paused = true)]
    async fn start_times_follow_the_ramp() {
        let config = ExecutorConfig::builder()
            .name("rar")
            .kind(ExecutorKind::RampingArrivalRate {
                start_rate: 0.0,
                time_unit: Duration::from_secs(1),
                stages: vec![
                    Stage::new(Duration::from_secs(10), 20.0),
                    Stage::new(Duration::from_secs(10), 20.0),
                ],
                pre_allocated_vus: 4,
                max_vus: None,
            })
            .build();
        let executor = RampingArrivalRate::new(config);
        assert_eq!(executor.planned_duration(), Duration::from_secs(20));

        let starts = Arc::new(Mutex::new(Vec::new()));
        let recorded = starts.clone();
        let origin = tokio::time::Instant::now();
        let h = harness(&executor, 4, move |_ctx: IterationContext| {
            recorded.lock().push(origin.elapsed());
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                IterationOutcome::Success
            }
        });

        let state = executor.run(h.ctx.clone()).await.unwrap();

        assert_eq!(state, RunState::Finished);
        let starts = starts.lock();
        // 100 during the ramp, 200 while holding
        assert_eq!(starts.len(), 300);
        let ramp = starts.iter().filter(|t| **t <= Duration::from_secs(10)).count();
        assert_eq!(ramp, 100);
        let first_half = starts.iter().filter(|t| **t <= Duration::from_secs(5)).count();
        assert_eq!(first_half, 25);
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));
    }
}
