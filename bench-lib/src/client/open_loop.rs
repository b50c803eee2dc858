use std::collections::BTreeMap;

use rama::telemetry::tracing;
use tokio::time::{Instant, sleep_until};

use super::{
    ClientReport, VirtualClient, response_outcome, stopped,
    transport::{Connection, TransportError},
};
use crate::{
    metrics::{FailureKind, Outcome},
    protocol::Response,
    workload::ScheduleState,
};

/// Issue on schedule, independent of outstanding responses.
pub(super) async fn run(client: VirtualClient) -> ClientReport {
    let schedule = client.cfg.workload.start(client.id);
    let mut stop = client.stop.clone();
    let mut state = OpenLoop {
        next_issue: Some(Instant::now()),
        schedule: Some(schedule),
        conn: None,
        pending: BTreeMap::new(),
        client,
    };

    loop {
        if state.next_issue.is_none() && state.pending.is_empty() {
            break;
        }

        // request ids and issue instants grow together,
        // so the first pending entry is always the oldest
        let expires_at = state
            .pending
            .first_key_value()
            .map(|(_, issued)| *issued + state.client.cfg.timeout);

        tokio::select! {
            _ = stopped(&mut stop) => {
                state.next_issue = None;
                state.fail_pending(Outcome::Errored(FailureKind::Incomplete));
                break;
            }
            result = recv(&mut state.conn) => state.on_response(result),
            _ = sleep_until_opt(expires_at), if expires_at.is_some() => state.expire(Instant::now()),
            _ = sleep_until_opt(state.next_issue), if state.next_issue.is_some() => state.issue().await,
        }
    }

    if let Some(conn) = state.conn.take() {
        conn.close().await;
    }
    tracing::debug!(issued = state.client.issued, "open loop client done");
    state.client.report()
}

struct OpenLoop {
    client: VirtualClient,
    /// Scheduled instant of the next issue, `None` once the deadline passed.
    next_issue: Option<Instant>,
    schedule: Option<ScheduleState>,
    /// Invariant: empty whenever `conn` is `None`.
    conn: Option<Connection>,
    /// Outstanding requests: id -> issue instant.
    pending: BTreeMap<u64, Instant>,
}

impl OpenLoop {
    async fn issue(&mut self) {
        let Some(scheduled) = self.next_issue else {
            return;
        };

        let req = self.client.next_request();
        let issued = Instant::now();

        if self.conn.is_none() {
            match self.client.connect().await {
                Ok(conn) => self.conn = Some(conn),
                Err(err) => {
                    tracing::trace!(request.id = req.id, "request not sent: {err}");
                    self.client.record(req.id, issued, Outcome::Errored(FailureKind::Connection));
                }
            }
        }

        if let Some(conn) = self.conn.as_mut() {
            let result = tokio::time::timeout_at(issued + self.client.cfg.timeout, conn.send(&req))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            match result {
                Ok(()) => {
                    self.pending.insert(req.id, issued);
                }
                Err(err) => {
                    self.client.record(req.id, issued, Outcome::Errored(FailureKind::Connection));
                    self.lose_connection(err);
                }
            }
        }

        self.next_issue = None;
        if let Some(schedule) = self.schedule.take() {
            let (interval, schedule) = self.client.cfg.workload.next(schedule);
            self.schedule = Some(schedule);
            // absolute schedule: a late issue does not shift the ones after it
            self.next_issue = scheduled
                .checked_add(interval)
                .filter(|next| *next < self.client.deadline);
        }
        if self.next_issue.is_none() {
            tracing::trace!(pending = self.pending.len(), "stop issuing: drain outstanding requests");
        }
    }

    fn on_response(&mut self, result: Result<Response, TransportError>) {
        match result {
            Ok(resp) => match self.pending.remove(&resp.id) {
                Some(issued) => self.client.record(resp.id, issued, response_outcome(resp.status)),
                None => tracing::trace!(response.id = resp.id, "late response of finalized request"),
            },
            Err(err) => self.lose_connection(err),
        }
    }

    /// Finalize all requests that ran out of time as `TimedOut`.
    fn expire(&mut self, now: Instant) {
        let timeout = self.client.cfg.timeout;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.get() + timeout > now {
                break;
            }
            let (id, issued) = entry.remove_entry();
            self.client.record(id, issued, Outcome::TimedOut);
        }
    }

    fn lose_connection(&mut self, err: TransportError) {
        self.conn = None;
        self.client.connection_lost(&err);
        self.fail_pending(Outcome::Errored(FailureKind::Connection));
    }

    fn fail_pending(&mut self, outcome: Outcome) {
        for (id, issued) in std::mem::take(&mut self.pending) {
            self.client.record(id, issued, outcome);
        }
    }
}

async fn recv(conn: &mut Option<Connection>) -> Result<Response, TransportError> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
