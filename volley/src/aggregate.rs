use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tokio::sync::mpsc;

use crate::sample::Sample;

/// The `Aggregate` trait defines how [`Sample`]s are collected and combined into an
/// intermediate, mergeable representation.
///
/// Aggregates store compact raw data (counts, sums, per-executor tallies) rather than
/// final statistics, so that several of them (one per consumer task, or one per
/// engine) can be merged without losing information.
///
/// # Example
/// ```rust
/// use volley::{macros::aggregate, sample::Sample, Aggregate};
///
/// #[aggregate]
/// struct Successes(u64);
///
/// impl Aggregate for Successes {
///     fn new() -> Self {
///         Self(0)
///     }
///
///     fn consume(&mut self, sample: &Sample) {
///         if sample.record.outcome.is_success() {
///             self.0 += 1;
///         }
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.0 += other.0;
///     }
/// }
/// ```
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: aggregates are merged in
///   arbitrary order.
/// - Samples arrive in completion order, not start order.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple samples into the current instance.
    fn aggregate(&mut self, samples: &[Sample]) {
        samples.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single sample into the aggregate.
    fn consume(&mut self, sample: &Sample);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Drains `rx` in batches of up to `batch_size` samples and returns the aggregate once
/// every sender is gone.
pub async fn aggregator_task<A: Aggregate>(mut rx: mpsc::Receiver<Sample>, batch_size: usize) -> A {
    let mut agg = A::new();
    let mut batch = Vec::with_capacity(batch_size);

    // wait for the first sample, then grab whatever else is already queued
    while let Some(sample) = rx.recv().await {
        batch.push(sample);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(sample) => batch.push(sample),
                Err(_) => break,
            }
        }
        agg.aggregate(&batch);
        batch.clear();
    }
    agg
}

pub use builtins::*;

mod builtins {
    use std::{collections::BTreeMap, time::Duration};

    use super::*;
    use crate::sample::IterationOutcome;
    use volley_macros::aggregate;

    /// General-purpose accumulator: outcome counts, per-executor counts and total
    /// iteration time.
    #[aggregate]
    #[derive(Default)]
    pub struct BasicAggregate {
        pub total_duration: Duration,
        pub success_count: u64,
        pub failure_count: u64,
        pub timeout_count: u64,
        pub forced_count: u64,
        pub count: u64,
        pub per_executor: BTreeMap<String, u64>,
    }

    impl BasicAggregate {
        pub fn success_ratio(&self) -> f64 {
            if self.count == 0 {
                return 0.0;
            }
            self.success_count as f64 / self.count as f64
        }
    }

    impl Aggregate for BasicAggregate {
        fn new() -> Self {
            BasicAggregate::default()
        }

        fn consume(&mut self, sample: &Sample) {
            let record = &sample.record;
            self.total_duration += record.duration;
            match record.outcome {
                IterationOutcome::Success => self.success_count += 1,
                IterationOutcome::Failed(_) => self.failure_count += 1,
                IterationOutcome::TimedOut => self.timeout_count += 1,
                IterationOutcome::Forced => self.forced_count += 1,
            }
            self.count += 1;
            *self
                .per_executor
                .entry(record.executor.to_string())
                .or_default() += 1;
        }

        fn merge(&mut self, other: Self) {
            self.total_duration += other.total_duration;
            self.success_count += other.success_count;
            self.failure_count += other.failure_count;
            self.timeout_count += other.timeout_count;
            self.forced_count += other.forced_count;
            self.count += other.count;
            for (executor, count) in other.per_executor {
                *self.per_executor.entry(executor).or_default() += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{tests::sample, IterationOutcome};

    #[tokio::test]
    async fn aggregator_task_drains_everything() {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(aggregator_task::<BasicAggregate>(rx, 4));
        for i in 0..10 {
            let outcome = if i % 5 == 0 {
                IterationOutcome::failed("nope")
            } else {
                IterationOutcome::Success
            };
            tx.send(sample(if i < 7 { "a" } else { "b" }, outcome))
                .await
                .unwrap();
        }
        drop(tx);

        let agg = handle.await.unwrap();
        assert_eq!(agg.count, 10);
        assert_eq!(agg.failure_count, 2);
        assert_eq!(agg.per_executor["a"], 7);
        assert_eq!(agg.per_executor["b"], 3);
        assert_eq!(agg.total_duration, std::time::Duration::from_millis(100));
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = BasicAggregate::new();
        a.consume(&sample("x", IterationOutcome::Success));
        let mut b = BasicAggregate::new();
        b.consume(&sample("y", IterationOutcome::Forced));
        b.consume(&sample("x", IterationOutcome::Success));

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.count, 3);
        assert_eq!(ab.forced_count, 1);
        assert_eq!(ab.success_ratio(), 2.0 / 3.0);
    }
}
