use std::{fmt, time::Duration};

use rama::telemetry::tracing;

use crate::{
    config::{ConfigError, FailureRates, LatencyProfile, Strategy},
    protocol::{Request, Status},
    work::Work,
};

/// Lifecycle of a single request on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Processing,
    Completed,
    TimedOut,
    Errored,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Errored)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        })
    }
}

/// Terminal result of processing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub state: RequestState,
    /// Close the connection instead of answering.
    pub drop_connection: bool,
}

impl Processed {
    fn respond(state: RequestState) -> Self {
        Self {
            state,
            drop_connection: false,
        }
    }

    /// Status to answer with, `None` if no answer has to be written.
    pub fn status(&self) -> Option<Status> {
        if self.drop_connection {
            return None;
        }
        Some(match self.state {
            RequestState::Completed => Status::Completed,
            RequestState::TimedOut => Status::TimedOut,
            _ => Status::Errored,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Drop,
    Stall,
    Error,
    None,
}

/// Executes requests according to the configured [`Strategy`],
/// each bounded by the per request timeout.
#[derive(Debug, Clone)]
pub struct RequestProcessor {
    strategy: Strategy,
    timeout: Duration,
}

impl RequestProcessor {
    pub fn try_new(strategy: Strategy, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }
        Ok(Self { strategy, timeout })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Process a single request, returning its terminal state.
    ///
    /// Work exceeding the timeout is aborted (dropped) and reported as
    /// [`RequestState::TimedOut`]; it never reports `Completed`.
    pub async fn process(&self, req: Request) -> Processed {
        tracing::trace!(request.id = req.id, state = %RequestState::Received, work = %req.work);

        tracing::trace!(request.id = req.id, state = %RequestState::Processing);
        let processed = match tokio::time::timeout(self.timeout, self.handle(req.work)).await {
            Ok(processed) => processed,
            Err(_) => Processed::respond(RequestState::TimedOut),
        };

        debug_assert!(processed.state.is_terminal());
        tracing::debug!(
            request.id = req.id,
            state = %processed.state,
            drop_connection = processed.drop_connection,
            "request processed",
        );
        processed
    }

    async fn handle(&self, work: Work) -> Processed {
        match self.strategy {
            Strategy::Vanilla => {}
            Strategy::Latency(latency) => delay(latency).await,
            Strategy::Flaky { latency, rates } => {
                delay(latency).await;
                match pick_fault(rates, rand::random()) {
                    Fault::Drop => {
                        return Processed {
                            state: RequestState::Errored,
                            drop_connection: true,
                        };
                    }
                    Fault::Stall => std::future::pending::<()>().await,
                    Fault::Error => return Processed::respond(RequestState::Errored),
                    Fault::None => {}
                }
            }
        }
        work.execute().await;
        Processed::respond(RequestState::Completed)
    }
}

async fn delay(latency: LatencyProfile) {
    let delay = latency.delay_for(rand::random());
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// `r` is expected to be within `[0, 1)`.
fn pick_fault(rates: FailureRates, r: f32) -> Fault {
    let t_drop = rates.drop.clamp(0., 1.);
    let t_stall = t_drop + rates.stall.clamp(0., 1.);
    let t_error = t_stall + rates.error.clamp(0., 1.);

    if r < t_drop {
        Fault::Drop
    } else if r < t_stall {
        Fault::Stall
    } else if r < t_error {
        Fault::Error
    } else {
        Fault::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(work: Work) -> Request {
        Request {
            id: 7,
            send_time: 0,
            work,
        }
    }

    fn flaky(rates: FailureRates) -> Strategy {
        Strategy::Flaky {
            latency: LatencyProfile::default(),
            rates,
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(RequestProcessor::try_new(Strategy::Vanilla, Duration::ZERO).is_err());
    }

    #[test]
    fn fault_thresholds() {
        let rates = FailureRates {
            error: 0.25,
            drop: 0.25,
            stall: 0.25,
        };
        assert_eq!(pick_fault(rates, 0.0), Fault::Drop);
        assert_eq!(pick_fault(rates, 0.3), Fault::Stall);
        assert_eq!(pick_fault(rates, 0.6), Fault::Error);
        assert_eq!(pick_fault(rates, 0.8), Fault::None);
        assert_eq!(pick_fault(FailureRates::default(), 0.0), Fault::None);
    }

    #[tokio::test(start_paused = true)]
    async fn vanilla_completes() {
        let processor = RequestProcessor::try_new(Strategy::Vanilla, Duration::from_secs(1)).unwrap();
        let processed = processor
            .process(request(Work::Sleep { micros: 500_000 }))
            .await;
        assert_eq!(processed.state, RequestState::Completed);
        assert_eq!(processed.status(), Some(Status::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_work_times_out() {
        let processor = RequestProcessor::try_new(Strategy::Vanilla, Duration::from_secs(1)).unwrap();
        let start = tokio::time::Instant::now();
        let processed = processor
            .process(request(Work::Sleep { micros: 5_000_000 }))
            .await;
        assert_eq!(processed.state, RequestState::TimedOut);
        assert_eq!(processed.status(), Some(Status::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_counts_against_timeout() {
        let strategy = Strategy::Latency(LatencyProfile {
            base: Duration::from_millis(800),
            jitter: Duration::ZERO,
        });
        let processor = RequestProcessor::try_new(strategy, Duration::from_secs(1)).unwrap();

        let processed = processor.process(request(Work::Noop)).await;
        assert_eq!(processed.state, RequestState::Completed);

        let processed = processor
            .process(request(Work::Sleep { micros: 300_000 }))
            .await;
        assert_eq!(processed.state, RequestState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_faults() {
        let timeout = Duration::from_secs(1);

        let processor = RequestProcessor::try_new(
            flaky(FailureRates {
                error: 1.,
                ..Default::default()
            }),
            timeout,
        )
        .unwrap();
        let processed = processor.process(request(Work::Noop)).await;
        assert_eq!(processed.status(), Some(Status::Errored));

        let processor = RequestProcessor::try_new(
            flaky(FailureRates {
                drop: 1.,
                ..Default::default()
            }),
            timeout,
        )
        .unwrap();
        let processed = processor.process(request(Work::Noop)).await;
        assert!(processed.drop_connection);
        assert_eq!(processed.status(), None);

        let processor = RequestProcessor::try_new(
            flaky(FailureRates {
                stall: 1.,
                ..Default::default()
            }),
            timeout,
        )
        .unwrap();
        let processed = processor.process(request(Work::Noop)).await;
        assert_eq!(processed.state, RequestState::TimedOut);
    }

    #[tokio::test]
    async fn busy_work_is_cancelled_on_timeout() {
        let processor =
            RequestProcessor::try_new(Strategy::Vanilla, Duration::from_millis(20)).unwrap();
        let processed = processor
            .process(request(Work::Busy {
                iterations: u64::MAX,
            }))
            .await;
        assert_eq!(processed.state, RequestState::TimedOut);
    }
}
