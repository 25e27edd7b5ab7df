//! HTTP shell for the AICentral gateway: hostname-based pipeline dispatch,
//! body buffering, and conversion of pipeline responses into axum
//! responses, including streamed bodies with the token-estimate trailer.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use http_body::Frame;
use http_body_util::StreamBody as FrameStreamBody;

use aicentral_core::Pipeline;
use aicentral_endpoint_core::{GatewayResponse, StreamTotals};

pub const STREAMING_TOKENS_TRAILER: &str = "x-aicentral-streaming-tokens";

#[derive(Clone)]
struct RouterState {
    pipelines: Arc<Vec<Arc<Pipeline>>>,
}

/// One router serving every configured pipeline; the pipeline is picked by
/// the request's `Host` header.
pub fn gateway_router(pipelines: Vec<Arc<Pipeline>>) -> Router {
    let state = RouterState {
        pipelines: Arc::new(pipelines),
    };
    Router::new()
        .route("/", any(gateway_handler))
        .route("/{*path}", any(gateway_handler))
        .with_state(state)
}

async fn gateway_handler(
    State(state): State<RouterState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let Some(pipeline) = pick_pipeline(&state.pipelines, host) else {
        return (StatusCode::NOT_FOUND, "no pipeline for host").into_response();
    };

    let response = pipeline.handle(&method, uri.path(), &headers, body).await;
    to_axum_response(response)
}

fn pick_pipeline<'a>(
    pipelines: &'a [Arc<Pipeline>],
    host: &str,
) -> Option<&'a Arc<Pipeline>> {
    pipelines
        .iter()
        .find(|pipeline| pipeline.matches_host(host))
        // A single-pipeline gateway serves any hostname.
        .or_else(|| match pipelines {
            [only] => Some(only),
            _ => None,
        })
}

fn to_axum_response(response: GatewayResponse) -> Response {
    match response {
        GatewayResponse::Buffered {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            copy_headers(&headers, resp.headers_mut());
            resp
        }
        GatewayResponse::Stream {
            status,
            headers,
            mut body,
        } => {
            let trailer_rx = body.trailer_totals.take();
            let content_type = body.content_type;

            let data = body
                .stream
                .map(|item| item.map(Frame::data));
            let trailers = futures_util::stream::once(async move {
                let totals = match trailer_rx {
                    Some(rx) => rx.await.ok(),
                    None => None,
                };
                totals.map(|totals| Ok::<_, io::Error>(trailer_frame(&totals)))
            })
            .filter_map(|item| async move { item });

            let frames = data.chain(trailers);
            let mut resp = Response::new(Body::new(FrameStreamBody::new(frames)));
            *resp.status_mut() = status;
            copy_headers(&headers, resp.headers_mut());

            let out = resp.headers_mut();
            if !out.contains_key(header::CONTENT_TYPE) {
                out.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_type),
                );
            }
            out.insert(
                header::TRAILER,
                HeaderValue::from_static(STREAMING_TOKENS_TRAILER),
            );
            if content_type == "text/event-stream" {
                // Hint common reverse proxies to avoid buffering SSE.
                out.entry(header::CACHE_CONTROL)
                    .or_insert(HeaderValue::from_static("no-cache"));
                out.entry(HeaderName::from_static("x-accel-buffering"))
                    .or_insert(HeaderValue::from_static("no"));
            }
            resp
        }
    }
}

fn trailer_frame(totals: &StreamTotals) -> Frame<Bytes> {
    let mut map = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&totals.estimated_completion_tokens.to_string()) {
        map.insert(
            HeaderName::from_static(STREAMING_TOKENS_TRAILER),
            value,
        );
    }
    Frame::trailers(map)
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        // Drop hop-by-hop and framing headers; hyper sets framing itself.
        if is_hop_by_hop_or_framing_header(name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("upgrade")
}
