use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use aicentral_endpoint_core::{StreamBody, StreamTotals};

/// Minimal SSE scanner for the tee: collects `data:` payloads across chunk
/// boundaries. Event names and comments are irrelevant to token accounting
/// and are skipped.
#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: String,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("data:") {
                payloads.push(value.trim_start().to_string());
            }
        }

        payloads
    }

    pub fn finish(&mut self) -> Vec<String> {
        let mut line = std::mem::take(&mut self.buffer);
        if line.ends_with('\r') {
            line.pop();
        }
        match line.strip_prefix("data:") {
            Some(value) => vec![value.trim_start().to_string()],
            None => Vec::new(),
        }
    }
}

/// Incremental completion-token estimate over streamed chat deltas.
///
/// Heuristic: one token per four UTF-8 bytes of `choices[*].delta.content`,
/// rounded up, at least one per non-empty delta. Deterministic and good
/// enough for budgeting; exact counts from an in-stream `usage` object
/// (when the upstream emits one) take precedence downstream.
#[derive(Debug, Default)]
pub struct CompletionEstimator {
    estimated: u64,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    done: bool,
}

impl CompletionEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, data: &str) {
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
            return;
        };
        if let Some(choices) = value.get("choices").and_then(|v| v.as_array()) {
            for choice in choices {
                let content = choice
                    .get("delta")
                    .and_then(|delta| delta.get("content"))
                    .and_then(|content| content.as_str());
                if let Some(content) = content
                    && !content.is_empty()
                {
                    self.estimated += (content.len() as u64).div_ceil(4).max(1);
                }
            }
        }
        if let Some(usage) = value.get("usage") {
            self.prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64());
            self.completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64());
            self.total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64());
        }
    }

    pub fn saw_done(&self) -> bool {
        self.done
    }

    pub fn totals(&self) -> StreamTotals {
        StreamTotals {
            estimated_completion_tokens: self.estimated,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// Wrap an upstream chunk stream in a tee: bytes are forwarded to the
/// caller untouched and unbuffered, while a side task scans SSE frames and
/// keeps the running token estimate. When the upstream terminates (`[DONE]`
/// or EOF) the totals resolve both receivers carried by the returned body:
/// one for the pipeline's return path, one for the response trailer.
pub fn tee_upstream_stream(
    mut upstream: mpsc::Receiver<Bytes>,
    content_type: &'static str,
) -> StreamBody {
    let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(16);
    let (totals_tx, totals_rx) = oneshot::channel::<StreamTotals>();
    let (trailer_tx, trailer_rx) = oneshot::channel::<StreamTotals>();

    tokio::spawn(async move {
        let mut scanner = SseScanner::new();
        let mut estimator = CompletionEstimator::new();

        while let Some(chunk) = upstream.recv().await {
            for data in scanner.push(&chunk) {
                estimator.observe(&data);
            }
            if chunk_tx.send(chunk).await.is_err() {
                // Caller went away; dropping the receiver aborts the
                // upstream read promptly.
                break;
            }
        }
        for data in scanner.finish() {
            estimator.observe(&data);
        }

        let totals = estimator.totals();
        let _ = totals_tx.send(totals);
        let _ = trailer_tx.send(totals);
    });

    let stream = ReceiverStream::new(chunk_rx).map(Ok::<_, std::io::Error>);
    StreamBody::new(content_type, stream, totals_rx, trailer_rx)
}
