use std::{io::Write, time::Duration};

use rama::telemetry::tracing;

use super::Reporter;
use crate::metrics::{Counters, Sample, Summary};

/// Reports as JSON lines: optional per-sample events,
/// periodic summaries and one final object.
pub struct JsonlReporter<W> {
    interval: Duration,
    last_tick: Duration,
    interval_counts: Counters,
    total_counts: Counters,
    emit_events: bool,
    out: W,
}

impl JsonlReporter<std::io::Stdout> {
    pub fn stdout(interval: Duration, emit_events: bool) -> Self {
        Self::new(interval, emit_events, std::io::stdout())
    }
}

impl<W: Write> JsonlReporter<W> {
    pub fn new(interval: Duration, emit_events: bool, out: W) -> Self {
        Self {
            interval,
            last_tick: Duration::ZERO,
            interval_counts: Counters::default(),
            total_counts: Counters::default(),
            emit_events,
            out,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, line: serde_json::Value) {
        if let Err(err) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            tracing::debug!("failed to write json report line: {err}");
        }
    }
}

impl<W: Write + Send + 'static> Reporter for JsonlReporter<W> {
    fn on_sample(&mut self, elapsed: Duration, sample: &Sample) {
        self.interval_counts.apply(sample.outcome);
        self.total_counts.apply(sample.outcome);

        if self.emit_events {
            self.emit(serde_json::json!({
                "type": "event",
                "t_ms": elapsed.as_millis() as u64,
                "client": sample.client,
                "id": sample.id,
                "latency_us": sample.latency().as_micros() as u64,
                "outcome": sample.outcome,
            }));
        }
    }

    fn on_tick(&mut self, now: Duration) {
        if now.saturating_sub(self.last_tick) < self.interval {
            return;
        }
        self.last_tick = now;

        let interval_secs = self.interval.as_secs_f64();
        let rps = if interval_secs == 0. {
            0.
        } else {
            self.interval_counts.total as f64 / interval_secs
        };

        self.emit(serde_json::json!({
            "type": "summary",
            "t_ms": now.as_millis() as u64,
            "interval_ms": self.interval.as_millis() as u64,
            "rps": rps,
            "interval": self.interval_counts,
            "total": self.total_counts,
        }));

        self.interval_counts = Counters::default();
    }

    fn finish(&mut self, summary: &Summary) {
        let mut line = serde_json::json!({ "type": "final" });
        match serde_json::to_value(summary) {
            Ok(serde_json::Value::Object(fields)) => {
                if let serde_json::Value::Object(obj) = &mut line {
                    obj.extend(fields);
                }
            }
            Ok(_) => (),
            Err(err) => tracing::error!("failed to serialize final summary: {err}"),
        }
        self.emit(line);
    }
}
