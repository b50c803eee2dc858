use rama::telemetry::tracing;
use tokio::time::{Instant, sleep_until};

use super::{
    ClientReport, VirtualClient, response_outcome, stopped,
    transport::{Connection, TransportError},
};
use crate::{
    metrics::{FailureKind, Outcome},
    protocol::Request,
};

/// At most one outstanding request: issue, await the outcome, think, repeat.
pub(super) async fn run(mut client: VirtualClient) -> ClientReport {
    let spec = client.cfg.workload;
    let mut schedule = spec.start(client.id);
    let mut stop = client.stop.clone();
    let mut conn = None;

    while Instant::now() < client.deadline && !client.is_stopped() {
        let req = client.next_request();
        let issued = Instant::now();
        let outcome = exchange(&mut client, &mut conn, &req, issued).await;
        client.record(req.id, issued, outcome);
        if outcome == Outcome::Errored(FailureKind::Incomplete) {
            break;
        }

        let (think, next) = spec.next(schedule);
        schedule = next;

        let Some(mut wake) = Instant::now().checked_add(think) else {
            break;
        };
        if conn.is_none()
            && let Some(not_before) = client.backoff.not_before()
        {
            wake = wake.max(not_before);
        }
        if wake >= client.deadline {
            break;
        }

        tokio::select! {
            _ = sleep_until(wake) => {}
            _ = stopped(&mut stop) => break,
        }
    }

    if let Some(conn) = conn {
        conn.close().await;
    }
    tracing::debug!(issued = client.issued, "closed loop client done");
    client.report()
}

async fn exchange(
    client: &mut VirtualClient,
    conn: &mut Option<Connection>,
    req: &Request,
    issued: Instant,
) -> Outcome {
    let mut stop = client.stop.clone();

    let mut connection = match conn.take() {
        Some(connection) => connection,
        None => {
            let result = tokio::select! {
                result = client.connect() => result,
                _ = stopped(&mut stop) => return Outcome::Errored(FailureKind::Incomplete),
            };
            match result {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::trace!(request.id = req.id, "request not sent: {err}");
                    return Outcome::Errored(FailureKind::Connection);
                }
            }
        }
    };

    let deadline = issued + client.cfg.timeout;
    let result = tokio::select! {
        result = connection.call(req, deadline) => result,
        _ = stopped(&mut stop) => return Outcome::Errored(FailureKind::Incomplete),
    };

    match result {
        Ok(resp) => {
            *conn = Some(connection);
            response_outcome(resp.status)
        }
        Err(TransportError::Timeout) => {
            // the server might still be busy with the request, start over
            tracing::debug!(request.id = req.id, "request timed out: drop connection");
            Outcome::TimedOut
        }
        Err(err) => {
            client.connection_lost(&err);
            err.outcome()
        }
    }
}
