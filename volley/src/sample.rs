//! Iteration records, samples and the sink they are emitted to.
use std::{collections::BTreeMap, sync::Arc, time::Duration, time::SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::aggregate::Aggregate;

/// How one iteration ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationOutcome {
    Success,
    /// The script reported a failure.
    Failed(String),
    /// The script gave up on its own timeout.
    TimedOut,
    /// The scheduler cut the iteration off (graceful-stop deadline or cancellation).
    Forced,
}

impl IterationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Everything known about one finished iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationRecord {
    pub executor: Arc<str>,
    pub slot: usize,
    /// Sequence number of the iteration on its slot.
    pub iteration: u64,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub outcome: IterationOutcome,
}

/// Unit emitted to a [`SampleSink`].
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub record: IterationRecord,
    /// Always carries `executor`, plus the executor's configured tags.
    pub tags: Arc<BTreeMap<String, String>>,
}

/// Ingress for samples. Shared by every executor, so implementations handle their own
/// synchronization.
///
/// The scheduler bounds each `emit` call; an emit that does not finish in time is
/// abandoned and counted as a dropped sample.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn emit(&self, sample: Sample);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl SampleSink for NullSink {
    async fn emit(&self, _sample: Sample) {}
}

/// Forwards samples into a bounded channel. Pair the receiver with
/// [`aggregator_task`](crate::aggregate::aggregator_task).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Sample>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SampleSink for ChannelSink {
    async fn emit(&self, sample: Sample) {
        if self.tx.send(sample).await.is_err() {
            tracing::trace!("Sample receiver is gone, discarding sample");
        }
    }
}

/// Folds samples straight into an [`Aggregate`] behind a lock.
#[derive(Debug)]
pub struct AggregateSink<A: Aggregate> {
    aggregate: Mutex<A>,
}

impl<A: Aggregate> Default for AggregateSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> AggregateSink<A> {
    pub fn new() -> Self {
        Self {
            aggregate: Mutex::new(A::new()),
        }
    }

    /// Copy of what has been aggregated so far.
    pub fn snapshot(&self) -> A {
        self.aggregate.lock().clone()
    }

    pub fn into_inner(self) -> A {
        self.aggregate.into_inner()
    }
}

#[async_trait]
impl<A: Aggregate> SampleSink for AggregateSink<A> {
    async fn emit(&self, sample: Sample) {
        self.aggregate.lock().consume(&sample);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::aggregate::BasicAggregate;

    pub(crate) fn sample(executor: &str, outcome: IterationOutcome) -> Sample {
        let executor: Arc<str> = executor.into();
        let tags = BTreeMap::from([("executor".to_string(), executor.to_string())]);
        Sample {
            record: IterationRecord {
                executor,
                slot: 0,
                iteration: 0,
                started_at: SystemTime::UNIX_EPOCH,
                duration: Duration::from_millis(10),
                outcome,
            },
            tags: Arc::new(tags),
        }
    }

    #[tokio::test]
    async fn channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.emit(sample("a", IterationOutcome::Success)).await;
        drop(sink);

        let got = rx.recv().await.unwrap();
        assert_eq!(got.record.executor.as_ref(), "a");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn channel_sink_ignores_closed_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        sink.emit(sample("a", IterationOutcome::Success)).await;
    }

    #[tokio::test]
    async fn aggregate_sink_consumes_in_place() {
        let sink = AggregateSink::<BasicAggregate>::new();
        sink.emit(sample("a", IterationOutcome::Success)).await;
        sink.emit(sample("a", IterationOutcome::TimedOut)).await;

        let agg = sink.into_inner();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.success_count, 1);
        assert_eq!(agg.timeout_count, 1);
    }
}
