use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

/// What the pipeline hands back to the HTTP shell.
#[derive(Debug)]
pub enum GatewayResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        body: StreamBody,
    },
}

impl GatewayResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayResponse::Buffered { status, .. } => *status,
            GatewayResponse::Stream { status, .. } => *status,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            GatewayResponse::Buffered { headers, .. } => headers,
            GatewayResponse::Stream { headers, .. } => headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        match self {
            GatewayResponse::Buffered { headers, .. } => headers,
            GatewayResponse::Stream { headers, .. } => headers,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, GatewayResponse::Stream { .. })
    }
}

/// Totals the streaming tee resolves once the upstream body terminates
/// (`[DONE]` sentinel or EOF). `estimated_completion_tokens` equals the sum
/// of per-chunk estimates; the same value goes out as the
/// `x-aicentral-streaming-tokens` trailer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTotals {
    pub estimated_completion_tokens: u64,
    /// Exact usage seen inside the stream, when the upstream emits one.
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

pub struct StreamBody {
    pub content_type: &'static str,
    pub stream: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
    /// Resolved by the tee at stream end; the pipeline's deferred return
    /// path takes and awaits it for token reconciliation. The HTTP shell
    /// takes the twin for the trailer value.
    pub totals: Option<oneshot::Receiver<StreamTotals>>,
    pub trailer_totals: Option<oneshot::Receiver<StreamTotals>>,
}

impl std::fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBody")
            .field("content_type", &self.content_type)
            .field("stream", &"<opaque>")
            .finish()
    }
}

impl StreamBody {
    pub fn new<S>(
        content_type: &'static str,
        stream: S,
        totals: oneshot::Receiver<StreamTotals>,
        trailer_totals: oneshot::Receiver<StreamTotals>,
    ) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Self {
            content_type,
            stream: Box::pin(stream),
            totals: Some(totals),
            trailer_totals: Some(trailer_totals),
        }
    }
}
