//! Runs a JSON load profile against a synthetic iteration runner.
//!
//! ```sh
//! cargo run --example profile -- volley/demos/profile.json
//! VOLLEY_LOG_FORMAT=json cargo run --example profile
//! ```
use std::{sync::Arc, time::Duration};

use volley::{
    aggregate::{aggregator_task, BasicAggregate},
    logging::{self, LogFormat},
    runner::IterationContext,
    sample::{ChannelSink, IterationOutcome},
    CancellationToken, LoadProfile, Scheduler,
};

const DEFAULT_PROFILE: &str = include_str!("profile.json");

/// Pretends to call a service whose latency drifts with the slot and iteration number.
async fn fake_request(ctx: IterationContext) -> IterationOutcome {
    let latency = Duration::from_millis(20 + (ctx.slot as u64 * 7 + ctx.iteration * 13) % 80);
    tokio::select! {
        _ = tokio::time::sleep(latency) => {}
        _ = ctx.cancel.cancelled() => return IterationOutcome::Forced,
    }
    if ctx.iteration % 50 == 49 {
        IterationOutcome::failed("HTTP 503")
    } else {
        IterationOutcome::Success
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("VOLLEY_LOG_FORMAT")
        .ok()
        .map(|f| f.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();
    logging::init(format, false)?;

    let profile = match std::env::args().nth(1) {
        Some(path) => LoadProfile::from_json(&std::fs::read_to_string(path)?)?,
        None => LoadProfile::from_json(DEFAULT_PROFILE)?,
    };

    let (sink, rx) = ChannelSink::new(4096);
    let aggregator = tokio::spawn(aggregator_task::<BasicAggregate>(rx, 256));

    let scheduler = Arc::new(Scheduler::new(profile, fake_request, Arc::new(sink))?);
    tracing::info!(plan = ?scheduler.plan(), "Profile validated");

    let progress = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(2));
            loop {
                ticker.tick().await;
                for snap in scheduler.progress_snapshot() {
                    tracing::info!(
                        executor = %snap.executor,
                        state = %snap.state,
                        workers = snap.active_workers,
                        completed = snap.iterations_completed(),
                        dropped = snap.iterations_dropped,
                        "Progress"
                    );
                }
            }
        }
    });

    let outcome = scheduler.start(CancellationToken::new()).await;
    progress.abort();
    let _ = progress.await;
    tracing::info!(state = %scheduler.current_run_state(), "Run over");

    // the scheduler holds the last sender
    drop(scheduler);
    let aggregate = aggregator.await?;
    println!("{}", serde_json::to_string_pretty(&aggregate)?);
    println!("success ratio: {:.3}", aggregate.success_ratio());

    outcome?;
    Ok(())
}
