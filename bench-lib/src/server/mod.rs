use std::{net::SocketAddr, time::Duration};

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    graceful::ShutdownGuard,
    telemetry::tracing::{self, Instrument as _},
};
use tokio::net::{TcpListener, TcpStream};

mod connection;
mod processor;

pub use self::{
    connection::{ConnectionHandler, ConnectionStats},
    processor::{Processed, RequestProcessor, RequestState},
};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct ServerListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ServerListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, BoxError> {
        let listener = TcpListener::bind(addr)
            .await
            .context("bind tcp listener")
            .context_field("address", addr)?;
        let local_addr = listener
            .local_addr()
            .context("fetch local addr of bound tcp listener")?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the guard is cancelled.
    ///
    /// Every connection is served in its own graceful task,
    /// so a slow connection never holds up another.
    pub async fn serve<S>(self, guard: ShutdownGuard, handler: S)
    where
        S: Service<TcpStream, Output = ConnectionStats, Error = BoxError> + Clone,
    {
        tracing::info!(address = %self.local_addr, "server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = guard.cancelled() => {
                    tracing::info!("stop accepting connections: guard shutdown");
                    return;
                }
                result = self.listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("failed to accept connection: {err}");
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                        continue;
                    }
                }
            };

            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(%peer, "failed to set TCP_NODELAY: {err}");
            }

            let handler = handler.clone();
            let span = tracing::debug_span!(
                "connection",
                network.peer.address = %peer.ip(),
                network.peer.port = peer.port(),
            );
            guard.spawn_task_fn(move |guard| serve_connection(guard, handler, stream).instrument(span));
        }
    }
}

async fn serve_connection<S>(guard: ShutdownGuard, handler: S, stream: TcpStream)
where
    S: Service<TcpStream, Output = ConnectionStats, Error = BoxError>,
{
    tracing::trace!("connection accepted");
    tokio::select! {
        _ = guard.cancelled() => {
            tracing::debug!("close connection: guard shutdown");
        }
        result = handler.serve(stream) => match result {
            Ok(stats) => tracing::debug!(
                requests = stats.requests,
                answered = stats.answered,
                dropped = stats.dropped,
                "connection closed",
            ),
            Err(err) => tracing::debug!("connection closed with error: {err}"),
        }
    }
}
