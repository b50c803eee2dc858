use std::sync::Arc;

use rama::{
    Service,
    error::{BoxError, ErrorContext as _},
    telemetry::tracing,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};

use super::processor::RequestProcessor;
use crate::protocol::{Request, Response, Status};

/// Serves all requests of a single connection, strictly in arrival order.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    processor: Arc<RequestProcessor>,
}

impl ConnectionHandler {
    pub fn new(processor: RequestProcessor) -> Self {
        Self {
            processor: Arc::new(processor),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub requests: u64,
    pub answered: u64,
    /// Connection was closed on purpose without answering the last request.
    pub dropped: bool,
}

impl<S> Service<S> for ConnectionHandler
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Output = ConnectionStats;
    type Error = BoxError;

    async fn serve(&self, mut stream: S) -> Result<Self::Output, Self::Error> {
        let mut stats = ConnectionStats::default();

        loop {
            let Some(decoded) = Request::read_from(&mut stream)
                .await
                .context("read request frame")?
            else {
                tracing::trace!("connection closed by client");
                break;
            };
            stats.requests += 1;

            let resp = match decoded {
                Ok(req) => {
                    let processed = self.processor.process(req).await;
                    let Some(status) = processed.status() else {
                        tracing::debug!(request.id = req.id, "drop connection without answer");
                        stats.dropped = true;
                        break;
                    };
                    Response { id: req.id, status }
                }
                Err(unknown) => {
                    tracing::debug!(
                        request.id = unknown.id,
                        work.id = unknown.work_id,
                        "unknown work id: answer with error"
                    );
                    Response {
                        id: unknown.id,
                        status: Status::Errored,
                    }
                }
            };

            resp.write_to(&mut stream)
                .await
                .context("write response frame")?;
            stats.answered += 1;
        }

        if let Err(err) = stream.shutdown().await {
            tracing::trace!("shutdown connection stream: {err}");
        }
        Ok(stats)
    }
}
