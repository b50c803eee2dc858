use std::{net::SocketAddr, sync::Arc, time::Duration};

use rama::{
    error::BoxError,
    telemetry::tracing::{self, Instrument as _},
};
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{Instant, sleep_until},
};

use crate::{
    config::{ConfigError, LoopKind},
    metrics::{
        FailureKind, MetricsRecorder, Outcome, Sample, SampleSink, Summary, reporter::Reporter,
    },
    protocol::{Request, Status, unix_time_nanos},
    work::Work,
    workload::WorkloadSpec,
};

mod closed_loop;
mod open_loop;
pub mod transport;

use self::transport::{Backoff, BackoffConfig, Connection, TransportError};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time on top of runtime and grace before virtual clients get aborted.
const BACKSTOP_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub addr: SocketAddr,
    pub discipline: LoopKind,
    /// Period in which new requests are issued.
    pub runtime: Duration,
    /// Per request timeout, also used as drain grace period.
    pub timeout: Duration,
    pub num_clients: usize,
    pub workload: WorkloadSpec,
    pub work: Work,
    pub backoff: BackoffConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_clients == 0 {
            return Err(ConfigError::invalid("num-clients", "must be at least 1"));
        }
        if self.runtime.is_zero() {
            return Err(ConfigError::invalid("runtime", "must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }
        if self.workload.interval().is_zero() {
            return Err(ConfigError::invalid(
                "workload interval",
                "must be greater than zero",
            ));
        }
        if self.run_deadlines(Instant::now()).is_none() {
            return Err(ConfigError::invalid(
                "runtime",
                format!(
                    "runtime {:?} plus timeout {:?} is too large",
                    self.runtime, self.timeout
                ),
            ));
        }
        Ok(())
    }

    /// Deadline and backstop of a run starting at `start`,
    /// `None` when they can not be represented.
    fn run_deadlines(&self, start: Instant) -> Option<(Instant, Instant)> {
        let deadline = start.checked_add(self.runtime)?;
        let backstop = deadline
            .checked_add(self.timeout)?
            .checked_add(BACKSTOP_SLACK)?;
        Some((deadline, backstop))
    }
}

/// Per virtual client bookkeeping of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientReport {
    pub client: usize,
    pub issued: u64,
    pub connects: u64,
    pub connect_failures: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: Summary,
    pub clients: Vec<ClientReport>,
}

impl RunReport {
    pub fn issued(&self) -> u64 {
        self.clients.iter().map(|c| c.issued).sum()
    }
}

#[derive(Debug)]
pub struct ClientEngine {
    cfg: Arc<EngineConfig>,
}

impl ClientEngine {
    pub fn try_new(cfg: EngineConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg: Arc::new(cfg) })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Drive all virtual clients for the configured runtime and report.
    ///
    /// Resolving `shutdown` stops issuing immediately; requests still
    /// in flight at that point are finalized as incomplete.
    pub async fn run<F>(self, shutdown: F, reporter: Box<dyn Reporter>) -> Result<RunReport, BoxError>
    where
        F: Future + Send,
    {
        let cfg = self.cfg;
        let recorder = MetricsRecorder::spawn(reporter, REPORT_INTERVAL)?;

        let start = Instant::now();
        let (deadline, backstop) = cfg
            .run_deadlines(start)
            .ok_or_else(|| BoxError::from("run deadlines overflow the clock"))?;

        tracing::info!(
            addr = %cfg.addr,
            discipline = %cfg.discipline,
            shape = %cfg.workload.shape(),
            interval = ?cfg.workload.interval(),
            runtime = ?cfg.runtime,
            timeout = ?cfg.timeout,
            num_clients = cfg.num_clients,
            work = %cfg.work,
            "client engine started",
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut clients = JoinSet::new();
        for index in 0..cfg.num_clients {
            let client = VirtualClient::new(index, cfg.clone(), recorder.sink(), deadline, stop_rx.clone());
            let span = tracing::debug_span!("virtual_client", client.id = index);
            clients.spawn(client.run().instrument(span));
        }
        drop(stop_rx);

        let mut shutdown = std::pin::pin!(shutdown);
        let mut stopped_at = None;
        let mut reports = Vec::with_capacity(cfg.num_clients);

        loop {
            tokio::select! {
                _ = shutdown.as_mut(), if stopped_at.is_none() => {
                    tracing::warn!("client engine: shutdown requested, stop issuing");
                    stopped_at = Some(Instant::now());
                    let _ = stop_tx.send(true);
                }
                maybe_report = clients.join_next() => match maybe_report {
                    None => break,
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(err)) => tracing::error!("virtual client task failed: {err}"),
                },
                _ = sleep_until(backstop) => {
                    tracing::error!(
                        remaining = clients.len(),
                        "virtual clients did not finish in time: abort",
                    );
                    clients.abort_all();
                    while let Some(result) = clients.join_next().await {
                        if let Ok(report) = result {
                            reports.push(report);
                        }
                    }
                    break;
                }
            }
        }

        reports.sort_by_key(|r| r.client);

        let issue_window = stopped_at
            .map(|t| t.saturating_duration_since(start))
            .unwrap_or(cfg.runtime)
            .min(cfg.runtime);
        let summary = recorder.finish(issue_window).await?;

        let report = RunReport {
            summary,
            clients: reports,
        };
        if report.issued() != report.summary.counts.total {
            tracing::error!(
                issued = report.issued(),
                samples = report.summary.counts.total,
                "sample count does not match issued requests",
            );
        }
        tracing::info!(
            issued = report.issued(),
            elapsed = ?start.elapsed(),
            "client engine finished",
        );
        Ok(report)
    }
}

/// One simulated user, driving requests over its own connection.
struct VirtualClient {
    id: usize,
    cfg: Arc<EngineConfig>,
    sink: SampleSink,
    /// No new requests are issued from this instant onwards.
    deadline: Instant,
    stop: watch::Receiver<bool>,
    backoff: Backoff,
    next_id: u64,
    issued: u64,
    connects: u64,
    connect_failures: u64,
}

impl VirtualClient {
    fn new(
        id: usize,
        cfg: Arc<EngineConfig>,
        sink: SampleSink,
        deadline: Instant,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let backoff = Backoff::new(cfg.backoff);
        Self {
            id,
            cfg,
            sink,
            deadline,
            stop,
            backoff,
            next_id: 0,
            issued: 0,
            connects: 0,
            connect_failures: 0,
        }
    }

    async fn run(self) -> ClientReport {
        match self.cfg.discipline {
            LoopKind::Closed => closed_loop::run(self).await,
            LoopKind::Open => open_loop::run(self).await,
        }
    }

    fn report(&self) -> ClientReport {
        ClientReport {
            client: self.id,
            issued: self.issued,
            connects: self.connects,
            connect_failures: self.connect_failures,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Allocate the next request. Every request returned here
    /// must be finalized with exactly one [`VirtualClient::record`].
    fn next_request(&mut self) -> Request {
        let id = self.next_id;
        self.next_id += 1;
        self.issued += 1;
        Request {
            id,
            send_time: unix_time_nanos(),
            work: self.cfg.work,
        }
    }

    fn record(&self, id: u64, issued: Instant, outcome: Outcome) {
        self.sink.submit(Sample {
            client: self.id,
            id,
            issued,
            finished: Instant::now(),
            outcome,
        });
    }

    /// Try to connect, respecting the reconnect backoff.
    ///
    /// Fails fast with [`TransportError::Closed`] while backing off.
    async fn connect(&mut self) -> Result<Connection, TransportError> {
        if !self.backoff.ready(Instant::now()) {
            return Err(TransportError::Closed);
        }
        match Connection::connect(self.cfg.addr, self.cfg.timeout).await {
            Ok(conn) => {
                self.connects += 1;
                self.backoff.reset();
                Ok(conn)
            }
            Err(err) => {
                self.connection_lost(&err);
                Err(err)
            }
        }
    }

    fn connection_lost(&mut self, err: &TransportError) {
        self.connect_failures += 1;
        let delay = self.backoff.failed(Instant::now());
        tracing::debug!(addr = %self.cfg.addr, "connection failure, back off {delay:?}: {err}");
    }
}

fn response_outcome(status: Status) -> Outcome {
    match status {
        Status::Completed => Outcome::Completed,
        Status::TimedOut => Outcome::TimedOut,
        Status::Errored => Outcome::Errored(FailureKind::Server),
    }
}

/// Resolves once the engine requested a stop.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        // engine is gone without requesting a stop
        std::future::pending::<()>().await;
    }
}
