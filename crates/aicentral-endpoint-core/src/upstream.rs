use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One fully-built outbound request. Dispatchers construct these; the
/// `UpstreamClient` performs the IO.
#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    /// Ask the client to hand the body back as a chunk stream rather than
    /// buffering it. Error statuses are always buffered.
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Connect,
    Dns,
    Tls,
    Timeout,
    ReadTimeout,
    Other,
}

/// Network-level failure. Upstream HTTP error *statuses* are not failures;
/// they come back as `UpstreamHttpResponse` and are forwarded or retried
/// per selector policy.
#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
}

impl UpstreamFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            UpstreamFailure::Transport {
                kind: UpstreamTransportErrorKind::Timeout
                    | UpstreamTransportErrorKind::ReadTimeout,
                ..
            }
        )
    }

    pub fn message(&self) -> &str {
        match self {
            UpstreamFailure::Transport { message, .. } => message,
        }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}
