//! Seam to whatever actually runs a script iteration.
use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::sample::IterationOutcome;

/// What a runner gets to know about the iteration it is asked to run.
#[derive(Clone, Debug)]
pub struct IterationContext {
    pub executor: Arc<str>,
    pub slot: usize,
    /// Sequence number of this iteration on its slot.
    pub iteration: u64,
    /// Cancelled when the scheduler gives up on the iteration. Runners should select on
    /// it around anything that can block for long.
    pub cancel: CancellationToken,
}

/// Runs one iteration of the user script.
///
/// Must be safe to call concurrently for distinct slots. The scheduler drops the
/// returned future once `ctx.cancel` fires and records the iteration as
/// [`IterationOutcome::Forced`], so runners do not have to report cancellation
/// themselves.
///
/// Closures returning a future implement this trait:
///
/// ```rust
/// use volley::{runner::IterationContext, sample::IterationOutcome, IterationRunner};
///
/// fn assert_runner<R: IterationRunner>(_: R) {}
///
/// assert_runner(|ctx: IterationContext| async move {
///     if ctx.iteration % 10 == 9 {
///         IterationOutcome::failed("every tenth iteration fails")
///     } else {
///         IterationOutcome::Success
///     }
/// });
/// ```
#[async_trait]
pub trait IterationRunner: Send + Sync + 'static {
    async fn run_iteration(&self, ctx: IterationContext) -> IterationOutcome;
}

#[async_trait]
impl<F, Fut> IterationRunner for F
where
    F: Fn(IterationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = IterationOutcome> + Send,
{
    async fn run_iteration(&self, ctx: IterationContext) -> IterationOutcome {
        (self)(ctx).await
    }
}
