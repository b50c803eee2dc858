use std::{fmt, io, net::SocketAddr, time::Duration};

use rama::telemetry::tracing;
use tokio::{
    io::AsyncWriteExt as _,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};

use crate::{
    metrics::{FailureKind, Outcome},
    protocol::{Request, Response},
};

/// Amount of decoded responses buffered between the reader task and the client.
const RESPONSE_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum TransportError {
    /// Connection could not be established.
    Connect(io::Error),
    /// Reading from or writing to an established connection failed.
    Io(io::Error),
    /// The server closed the connection.
    Closed,
    /// The server sent a frame that could not be decoded.
    Protocol(io::Error),
    /// No (matching) response in time.
    Timeout,
}

impl TransportError {
    /// Outcome recorded for a request that failed with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Timeout => Outcome::TimedOut,
            Self::Connect(_) | Self::Io(_) | Self::Closed | Self::Protocol(_) => {
                Outcome::Errored(FailureKind::Connection)
            }
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "connect: {err}"),
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Closed => f.write_str("connection closed by peer"),
            Self::Protocol(err) => write!(f, "protocol violation: {err}"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Client side connection, owned by exactly one virtual client.
///
/// Responses are decoded by a dedicated reader task so that
/// [`Connection::recv`] is cancel safe and can be used within `tokio::select!`.
pub struct Connection {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    responses: mpsc::Receiver<io::Result<Response>>,
    reader: JoinHandle<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;

        let (read_half, writer) = stream.into_split();
        let (tx, responses) = mpsc::channel(RESPONSE_BUFFER);
        let reader = tokio::spawn(read_responses(read_half, tx));

        tracing::trace!(%addr, "connection established");
        Ok(Self {
            peer: addr,
            writer,
            responses,
            reader,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&mut self, req: &Request) -> Result<(), TransportError> {
        req.write_to(&mut self.writer)
            .await
            .map_err(TransportError::Io)
    }

    /// Receive the next response. Cancel safe.
    pub async fn recv(&mut self) -> Result<Response, TransportError> {
        match self.responses.recv().await {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                Err(TransportError::Protocol(err))
            }
            Some(Err(err)) => Err(TransportError::Io(err)),
            None => Err(TransportError::Closed),
        }
    }

    /// Send a request and wait for its response, both bounded by `deadline`.
    ///
    /// Responses for other (older, abandoned) requests are skipped.
    pub async fn call(
        &mut self,
        req: &Request,
        deadline: Instant,
    ) -> Result<Response, TransportError> {
        tokio::time::timeout_at(deadline, async {
            self.send(req).await?;
            loop {
                let resp = self.recv().await?;
                if resp.id == req.id {
                    return Ok(resp);
                }
                tracing::debug!(
                    request.id = req.id,
                    response.id = resp.id,
                    "skip response of abandoned request"
                );
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    pub async fn close(mut self) {
        if let Err(err) = self.writer.shutdown().await {
            tracing::trace!("shutdown write half of connection: {err}");
        }
        self.reader.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(mut reader: OwnedReadHalf, tx: mpsc::Sender<io::Result<Response>>) {
    loop {
        match Response::read_from(&mut reader).await {
            Ok(Some(resp)) => {
                if tx.send(Ok(resp)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::trace!("connection closed by server");
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

/// Exponential reconnect backoff, bounded by a maximum delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    not_before: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        let initial = cfg.initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: cfg.max.max(initial),
            current: initial,
            not_before: None,
        }
    }

    /// Whether a (re)connect attempt is allowed at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| now >= t)
    }

    pub fn not_before(&self) -> Option<Instant> {
        self.not_before
    }

    /// Register a failed attempt, returns the delay until the next attempt.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.not_before = Some(now + delay);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.not_before = None;
    }
}
