//! Volley, the execution scheduler of a load-testing engine.
//!
//! Volley turns a declarative [`LoadProfile`] (a list of executors with start offsets,
//! durations and scaling curves) into a live population of workers that run script
//! iterations, while enforcing timing, a global concurrency ceiling, graceful ramp-down
//! and coordinated shutdown.
//!
//! Volley does not know how to run a script. You plug that in through an
//! [`IterationRunner`], and you decide where finished iterations go through a
//! [`SampleSink`].
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`LoadProfile`]: plain, serde-friendly description of the run. Validating it yields a
//!   [`Plan`](config::Plan) with every executor placed on the run timeline.
//! - [`Scheduler`]: glue that ties everything together. It starts each executor at its
//!   offset, propagates cancellation and folds executor states into one [`RunState`].
//! - [`Executor`]: owns one load shape's timeline. Seven variants cover fixed and ramping
//!   worker counts, iteration budgets, fixed and ramping arrival rates, and external
//!   control.
//! - [`RampSequencer`](stage::RampSequencer): pure `elapsed -> target` function built
//!   from ramp [`Stage`]s.
//! - [`WorkerSlotPool`]: the only resource shared across executors. Every in-flight
//!   iteration holds one slot, so the pool ceiling bounds concurrency run-wide.
//! - [`SampleSink`]: where each finished iteration is emitted. [`Aggregate`]s fold samples
//!   into compact, mergeable data.
//!
//! # Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use volley::{
//!     aggregate::BasicAggregate,
//!     config::{ExecutorConfig, ExecutorKind},
//!     runner::IterationContext,
//!     sample::{AggregateSink, IterationOutcome},
//!     CancellationToken, LoadProfile, RunState, Scheduler, Stage,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let profile = LoadProfile::new(vec![ExecutorConfig::builder()
//!         .name("warm-up")
//!         .kind(ExecutorKind::RampingVus {
//!             start_vus: 0,
//!             stages: vec![
//!                 Stage::new(Duration::from_millis(200), 4.0),
//!                 Stage::new(Duration::from_millis(200), 0.0),
//!             ],
//!             graceful_ramp_down: Duration::from_millis(50),
//!         })
//!         .graceful_stop(Duration::from_millis(100))
//!         .build()]);
//!
//!     let sink = Arc::new(AggregateSink::<BasicAggregate>::new());
//!     let scheduler = Scheduler::new(
//!         profile,
//!         |_ctx: IterationContext| async move {
//!             // talk to the system under test here
//!             tokio::time::sleep(Duration::from_millis(10)).await;
//!             IterationOutcome::Success
//!         },
//!         sink.clone(),
//!     )
//!     .unwrap();
//!
//!     let state = scheduler.start(CancellationToken::new()).await.unwrap();
//!     assert_eq!(state, RunState::Finished);
//!     println!("{:?}", sink.snapshot());
//! }
//! ```
//!
//! # Where to start
//!
//! - [`config`] for every executor kind and its parameters.
//! - [`executor`] for the state machine every executor goes through.
//! - `demos/profile.rs` runs a JSON load profile against a synthetic runner.

/// Mergeable sample aggregates
pub mod aggregate;
/// Load profiles and their validation
pub mod config;
pub mod error;
/// Load shapes and the machinery they share
pub mod executor;
pub mod logging;
pub mod pool;
pub mod progress;
/// Seam to the script-execution runtime
pub mod runner;
pub mod sample;
/// Main module that glues everything together
pub mod scheduler;
pub mod stage;
pub mod state;

pub use aggregate::Aggregate;
pub use config::{ExecutorConfig, ExecutorKind, LoadProfile};
pub use error::{ConfigError, ControlError, Error, Result};
pub use executor::{Executor, ExternalController, RunOptions};
pub use pool::{SlotHooks, WorkerSlot, WorkerSlotPool};
pub use progress::{ExecutorEvent, ProgressSnapshot};
pub use runner::IterationRunner;
pub use sample::{Sample, SampleSink};
pub use scheduler::{validate, Scheduler};
pub use stage::Stage;
pub use state::RunState;
pub use tokio_util::sync::CancellationToken;

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use volley_macros::*;
}
