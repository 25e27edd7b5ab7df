use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};

/// Terminal pipeline error: a status plus body returned to the caller
/// before (or instead of) dispatch. Limiter rejections carry `Retry-After`.
#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayError {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn method_not_allowed(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    pub fn service_unavailable(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn too_many_requests(message: impl Into<Bytes>, retry_after_secs: u64) -> Self {
        let mut err = Self::new(StatusCode::TOO_MANY_REQUESTS, message);
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            err.headers.insert(http::header::RETRY_AFTER, value);
        }
        err
    }
}
