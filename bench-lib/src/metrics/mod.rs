use std::time::Duration;

use hdrhistogram::Histogram;
use rama::{
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::Instant,
};

pub mod reporter;
mod stats_file;

pub use self::stats_file::write_stats_file;

use self::reporter::Reporter;

/// Terminal outcome of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    TimedOut,
    Errored(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connect failure, reset, or the connection went away while waiting.
    Connection,
    /// The server reported an error for the request.
    Server,
    /// The run was cancelled before the request could finish.
    Incomplete,
}

/// One recorded outcome for a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub client: usize,
    pub id: u64,
    pub issued: Instant,
    pub finished: Instant,
    pub outcome: Outcome,
}

impl Sample {
    pub fn latency(&self) -> Duration {
        self.finished.saturating_duration_since(self.issued)
    }
}

/// Cloneable handle used by the virtual clients to submit samples.
///
/// Submitting never blocks or awaits.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: UnboundedSender<Sample>,
}

impl SampleSink {
    pub fn submit(&self, sample: Sample) {
        if let Err(err) = self.tx.send(sample) {
            tracing::error!("metrics recorder is gone, sample lost: {:?}", err.0);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub connection_errors: u64,
    pub server_errors: u64,
    pub incomplete: u64,
}

impl Counters {
    pub fn apply(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::TimedOut => self.timed_out += 1,
            Outcome::Errored(FailureKind::Connection) => self.connection_errors += 1,
            Outcome::Errored(FailureKind::Server) => self.server_errors += 1,
            Outcome::Errored(FailureKind::Incomplete) => self.incomplete += 1,
        }
    }

    pub fn failed(&self) -> u64 {
        self.total - self.completed
    }
}

/// Latency distribution of the completed requests, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min_us: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    fn from_histogram(histogram: &Histogram<u64>) -> Option<Self> {
        if histogram.is_empty() {
            return None;
        }
        Some(Self {
            min_us: histogram.min(),
            mean_us: histogram.mean(),
            p50_us: histogram.value_at_quantile(0.50),
            p90_us: histogram.value_at_quantile(0.90),
            p95_us: histogram.value_at_quantile(0.95),
            p99_us: histogram.value_at_quantile(0.99),
            p999_us: histogram.value_at_quantile(0.999),
            max_us: histogram.max(),
        })
    }
}

/// Aggregate statistics of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub runtime_secs: f64,
    pub counts: Counters,
    pub latency: Option<LatencySummary>,
    /// Request attempts per second.
    pub offered_rps: f64,
    /// Completed requests per second.
    pub achieved_rps: f64,
}

struct Aggregate {
    counts: Counters,
    histogram: Histogram<u64>,
}

impl Aggregate {
    fn record(&mut self, sample: &Sample) {
        self.counts.apply(sample.outcome);
        if sample.outcome == Outcome::Completed {
            let micros = sample.latency().as_micros().min(u64::MAX as u128) as u64;
            self.histogram.saturating_record(micros.max(1));
        }
    }

    fn summarize(&self, runtime: Duration) -> Summary {
        let secs = runtime.as_secs_f64();
        let per_sec = |n: u64| if secs > 0. { n as f64 / secs } else { 0. };
        Summary {
            runtime_secs: secs,
            counts: self.counts,
            latency: LatencySummary::from_histogram(&self.histogram),
            offered_rps: per_sec(self.counts.total),
            achieved_rps: per_sec(self.counts.completed),
        }
    }
}

/// Owned aggregator of [`Sample`]s.
///
/// Samples reach the aggregator task only through message passing,
/// the task feeds every sample to the configured [`Reporter`] as well.
pub struct MetricsRecorder {
    sink: SampleSink,
    worker: JoinHandle<(Aggregate, Box<dyn Reporter>)>,
}

impl MetricsRecorder {
    pub fn spawn(reporter: Box<dyn Reporter>, report_interval: Duration) -> Result<Self, BoxError> {
        let histogram =
            Histogram::<u64>::new(3).context("create latency histogram (3 significant digits)")?;
        let aggregate = Aggregate {
            counts: Counters::default(),
            histogram,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(aggregate_worker(aggregate, reporter, rx, report_interval));

        Ok(Self {
            sink: SampleSink { tx },
            worker,
        })
    }

    pub fn sink(&self) -> SampleSink {
        self.sink.clone()
    }

    /// Wait for all sinks to be dropped and all samples to be aggregated.
    pub async fn finish(self, runtime: Duration) -> Result<Summary, BoxError> {
        let Self { sink, worker } = self;
        drop(sink);

        let (aggregate, mut reporter) = worker.await.context("join metrics aggregate worker")?;
        let summary = aggregate.summarize(runtime);
        reporter.finish(&summary);
        Ok(summary)
    }
}

async fn aggregate_worker(
    mut aggregate: Aggregate,
    mut reporter: Box<dyn Reporter>,
    mut rx: UnboundedReceiver<Sample>,
    report_interval: Duration,
) -> (Aggregate, Box<dyn Reporter>) {
    let start = Instant::now();
    let mut ticker = tokio::time::interval_at(start + report_interval, report_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_sample = rx.recv() => {
                let Some(sample) = maybe_sample else {
                    tracing::debug!("exit metrics aggregate worker: all sample sinks dropped");
                    return (aggregate, reporter);
                };
                aggregate.record(&sample);
                reporter.on_sample(start.elapsed(), &sample);
            }
            _ = ticker.tick() => {
                reporter.on_tick(start.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NoopReporter;

    impl Reporter for NoopReporter {
        fn on_sample(&mut self, _elapsed: Duration, _sample: &Sample) {}
        fn on_tick(&mut self, _now: Duration) {}
        fn finish(&mut self, _summary: &Summary) {}
    }

    fn sample(client: usize, id: u64, latency_ms: u64, outcome: Outcome) -> Sample {
        let issued = Instant::now();
        Sample {
            client,
            id,
            issued,
            finished: issued + Duration::from_millis(latency_ms),
            outcome,
        }
    }

    #[tokio::test]
    async fn summary_counts_every_outcome() {
        let recorder =
            MetricsRecorder::spawn(Box::new(NoopReporter), Duration::from_secs(1)).unwrap();
        let sink = recorder.sink();

        for (i, outcome) in [
            Outcome::Completed,
            Outcome::Completed,
            Outcome::TimedOut,
            Outcome::Errored(FailureKind::Connection),
            Outcome::Errored(FailureKind::Server),
            Outcome::Errored(FailureKind::Incomplete),
        ]
        .into_iter()
        .enumerate()
        {
            sink.submit(sample(0, i as u64, 10, outcome));
        }
        drop(sink);

        let summary = recorder.finish(Duration::from_secs(2)).await.unwrap();
        assert_eq!(
            summary.counts,
            Counters {
                total: 6,
                completed: 2,
                timed_out: 1,
                connection_errors: 1,
                server_errors: 1,
                incomplete: 1,
            }
        );
        assert_eq!(summary.counts.failed(), 4);
        assert_eq!(summary.offered_rps, 3.);
        assert_eq!(summary.achieved_rps, 1.);
    }

    #[tokio::test]
    async fn latency_distribution_only_covers_completed() {
        let recorder =
            MetricsRecorder::spawn(Box::new(NoopReporter), Duration::from_secs(1)).unwrap();
        let sink = recorder.sink();

        for i in 1..=100 {
            sink.submit(sample(0, i, i, Outcome::Completed));
        }
        sink.submit(sample(0, 101, 60_000, Outcome::TimedOut));
        drop(sink);

        let summary = recorder.finish(Duration::from_secs(1)).await.unwrap();
        let latency = summary.latency.unwrap();
        assert!((999..=1001).contains(&latency.min_us), "{latency:?}");
        assert!((49_900..=50_100).contains(&latency.p50_us), "{latency:?}");
        assert!((98_900..=99_100).contains(&latency.p99_us), "{latency:?}");
        assert!((99_900..=100_100).contains(&latency.max_us), "{latency:?}");
    }

    #[tokio::test]
    async fn empty_run_has_no_latency() {
        let recorder =
            MetricsRecorder::spawn(Box::new(NoopReporter), Duration::from_secs(1)).unwrap();
        let summary = recorder.finish(Duration::ZERO).await.unwrap();
        assert_eq!(summary.counts, Counters::default());
        assert!(summary.latency.is_none());
        assert_eq!(summary.offered_rps, 0.);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_are_neither_lost_nor_duplicated() {
        let recorder =
            MetricsRecorder::spawn(Box::new(NoopReporter), Duration::from_millis(5)).unwrap();

        let mut handles = Vec::new();
        for client in 0..32 {
            let sink = recorder.sink();
            handles.push(tokio::spawn(async move {
                for id in 0..500 {
                    sink.submit(sample(client, id, 1, Outcome::Completed));
                    if id % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let summary = recorder.finish(Duration::from_secs(1)).await.unwrap();
        assert_eq!(summary.counts.total, 32 * 500);
        assert_eq!(summary.counts.completed, 32 * 500);
    }
}
