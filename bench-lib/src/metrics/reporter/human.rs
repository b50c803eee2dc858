use std::{io::Write, time::Duration};

use rama::telemetry::tracing;

use super::Reporter;
use crate::metrics::{Counters, Sample, Summary};

pub struct HumanReporter<W> {
    interval: Duration,
    last_tick: Duration,
    interval_counts: Counters,
    total_counts: Counters,
    out: W,
}

impl HumanReporter<std::io::Stdout> {
    pub fn stdout(interval: Duration) -> Self {
        Self::new(interval, std::io::stdout())
    }
}

impl<W: Write> HumanReporter<W> {
    pub fn new(interval: Duration, out: W) -> Self {
        Self {
            interval,
            last_tick: Duration::ZERO,
            interval_counts: Counters::default(),
            total_counts: Counters::default(),
            out,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Err(err) = self.out.write_fmt(line).and_then(|_| self.out.flush()) {
            tracing::debug!("failed to write human report line: {err}");
        }
    }
}

impl<W: Write + Send + 'static> Reporter for HumanReporter<W> {
    fn on_sample(&mut self, _elapsed: Duration, sample: &Sample) {
        self.interval_counts.apply(sample.outcome);
        self.total_counts.apply(sample.outcome);
    }

    fn on_tick(&mut self, now: Duration) {
        if now.saturating_sub(self.last_tick) < self.interval {
            return;
        }
        self.last_tick = now;

        let rps = self.interval_counts.total as f64 / self.interval.as_secs_f64();
        let interval = self.interval_counts;
        let total = self.total_counts;

        self.emit(format_args!(
            "t={:.1}s rps={:.1} ok={} timeout={} conn_fail={} server_fail={} total_ok={} total_fail={}\n",
            now.as_secs_f64(),
            rps,
            interval.completed,
            interval.timed_out,
            interval.connection_errors,
            interval.server_errors,
            total.completed,
            total.failed(),
        ));

        self.interval_counts = Counters::default();
    }

    fn finish(&mut self, summary: &Summary) {
        let c = summary.counts;
        self.emit(format_args!(
            "done in {} total={} ok={} timeout={} conn_fail={} server_fail={} incomplete={}\n",
            humantime::format_duration(Duration::from_millis(
                (summary.runtime_secs * 1000.).round() as u64
            )),
            c.total,
            c.completed,
            c.timed_out,
            c.connection_errors,
            c.server_errors,
            c.incomplete,
        ));
        self.emit(format_args!(
            "throughput offered={:.1}rps achieved={:.1}rps\n",
            summary.offered_rps, summary.achieved_rps,
        ));
        match summary.latency {
            Some(l) => self.emit(format_args!(
                "latency(us) min={} mean={:.1} p50={} p90={} p95={} p99={} p99.9={} max={}\n",
                l.min_us, l.mean_us, l.p50_us, l.p90_us, l.p95_us, l.p99_us, l.p999_us, l.max_us,
            )),
            None => self.emit(format_args!("latency(us) n/a: no request completed\n")),
        }
    }
}
