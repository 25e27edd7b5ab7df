use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::Semaphore;
use tracing::warn;

use aicentral_endpoint_core::{
    CallDetails, CallKind, EndpointAuth, EndpointDescriptor, EndpointKind, GatewayResponse,
    Headers, UpstreamBody, UpstreamClient, UpstreamHttpRequest, UsageInformation, header_set,
    header_u64,
};

use crate::tee::tee_upstream_stream;

/// Per-request context threaded into dispatch for logging.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub trace_id: String,
}

/// Result of one dispatch attempt. Failures are values: the response always
/// carries something forwardable and `usage.success` reflects the outcome.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub usage: UsageInformation,
    pub response: GatewayResponse,
}

impl DispatchOutcome {
    /// Whether a cascade selector may try another endpoint: network-level
    /// failures (surfaced locally as 502/504), upstream 5xx, and 429.
    /// Everything else halts fail-over and is returned verbatim, an
    /// unmapped model's local 404 included.
    pub fn is_transient_failure(&self) -> bool {
        if self.usage.success {
            return false;
        }
        let status = self.response.status();
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }
}

/// Executes one upstream HTTP call for a single configured endpoint:
/// resolve the model through the descriptor map, rewrite URL and body,
/// inject auth, forward, and account for usage on the way back.
pub struct EndpointDispatcher {
    descriptor: EndpointDescriptor,
    client: Arc<dyn UpstreamClient>,
    /// Endpoint-level bulk-head, present when the descriptor caps
    /// concurrency. For streamed responses the permit rides with the body
    /// stream and releases when the stream is dropped.
    concurrency: Option<Arc<Semaphore>>,
    dispatch_timeout: Duration,
}

const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);

impl EndpointDispatcher {
    pub fn new(descriptor: EndpointDescriptor, client: Arc<dyn UpstreamClient>) -> Self {
        let concurrency = descriptor
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            descriptor,
            client,
            concurrency,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub async fn dispatch(&self, details: &CallDetails, ctx: &DispatchContext) -> DispatchOutcome {
        let incoming_model = details.model_or_deployment().map(str::to_string);

        // Model resolution never touches the network on a miss.
        let upstream_model = match incoming_model.as_deref() {
            Some(incoming) => match self.descriptor.upstream_model(incoming) {
                Some(model) => Some(model.to_string()),
                None => {
                    return self.local_failure(
                        details,
                        StatusCode::NOT_FOUND,
                        format!("no mapping for model {incoming}"),
                    );
                }
            },
            None => None,
        };

        let url = self.build_url(details, upstream_model.as_deref());
        let body = rewrite_model_field(&details.raw_body, upstream_model.as_deref());
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "content-type", "application/json");
        self.apply_auth(&mut headers);

        let request = UpstreamHttpRequest {
            method: details.method,
            url,
            headers,
            body,
            is_stream: details.is_streaming(),
        };

        let permit = match &self.concurrency {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let started_wall = SystemTime::now();
        let started = Instant::now();
        let sent = tokio::time::timeout(self.dispatch_timeout, self.client.send(request)).await;
        let elapsed = started.elapsed();

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(failure)) => {
                warn!(
                    event = "upstream_transport_error",
                    trace_id = %ctx.trace_id,
                    endpoint = %self.descriptor.id,
                    error = %failure.message(),
                );
                let status = if failure.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                return self.local_failure(details, status, failure.message().to_string());
            }
            Err(_) => {
                warn!(
                    event = "upstream_deadline_exceeded",
                    trace_id = %ctx.trace_id,
                    endpoint = %self.descriptor.id,
                    elapsed_ms = elapsed.as_millis(),
                );
                return self.local_failure(
                    details,
                    StatusCode::GATEWAY_TIMEOUT,
                    "upstream deadline exceeded".to_string(),
                );
            }
        };

        let status =
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let success = status.is_success();

        let mut usage = UsageInformation {
            endpoint_id: self.descriptor.id.clone(),
            upstream_host: self.descriptor.host().to_string(),
            deployment_or_model: upstream_model
                .or(incoming_model)
                .unwrap_or_else(|| "none".to_string()),
            call_kind: details.call_kind,
            streaming: details.is_streaming(),
            success,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            estimated_completion_tokens: None,
            upstream_duration: elapsed,
            started_at: started_wall,
            remaining_requests_hint: header_u64(
                &response.headers,
                "x-ratelimit-remaining-requests",
            ),
            remaining_tokens_hint: header_u64(&response.headers, "x-ratelimit-remaining-tokens"),
        };

        let header_map = headers_to_map(&response.headers);
        match response.body {
            UpstreamBody::Bytes(bytes) => {
                if success {
                    copy_exact_usage(&mut usage, &bytes);
                }
                DispatchOutcome {
                    usage,
                    response: GatewayResponse::Buffered {
                        status,
                        headers: header_map,
                        body: bytes,
                    },
                }
            }
            UpstreamBody::Stream(rx) => {
                let content_type = if header_map
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.contains("text/event-stream"))
                {
                    "text/event-stream"
                } else {
                    "application/octet-stream"
                };
                let mut body = tee_upstream_stream(rx, content_type);
                if let Some(permit) = permit {
                    // Keep the endpoint permit until the forwarded stream
                    // is dropped.
                    body.stream = Box::pin(body.stream.map(move |item| {
                        let _held = &permit;
                        item
                    }));
                }
                DispatchOutcome {
                    usage,
                    response: GatewayResponse::Stream {
                        status,
                        headers: header_map,
                        body,
                    },
                }
            }
        }
    }

    fn local_failure(
        &self,
        details: &CallDetails,
        status: StatusCode,
        message: String,
    ) -> DispatchOutcome {
        let usage = UsageInformation::failure(
            self.descriptor.id.clone(),
            self.descriptor.host().to_string(),
            details
                .model_or_deployment()
                .unwrap_or("none")
                .to_string(),
            details.call_kind,
            details.is_streaming(),
        );
        let body = serde_json::json!({"error": {"message": message}});
        DispatchOutcome {
            usage,
            response: GatewayResponse::Buffered {
                status,
                headers: HeaderMap::new(),
                body: Bytes::from(body.to_string()),
            },
        }
    }

    fn build_url(&self, details: &CallDetails, upstream_model: Option<&str>) -> String {
        let base = self.descriptor.base_url.trim_end_matches('/');
        let tail = openai_tail(details);
        match self.descriptor.kind {
            EndpointKind::AzureOpenAI => {
                let model = upstream_model.unwrap_or("");
                let api_version = self
                    .descriptor
                    .api_version
                    .as_deref()
                    .unwrap_or("2024-02-01");
                if model.is_empty() {
                    // Deployment-less Azure calls (assistants and other
                    // passthrough paths) still live under /openai/.
                    format!("{base}/openai/{tail}?api-version={api_version}")
                } else {
                    format!(
                        "{base}/openai/deployments/{model}/{tail}?api-version={api_version}"
                    )
                }
            }
            EndpointKind::OpenAI => format!("{base}/{tail}"),
        }
    }

    fn apply_auth(&self, headers: &mut Headers) {
        match &self.descriptor.auth {
            EndpointAuth::ApiKey(key) => header_set(headers, "api-key", key),
            EndpointAuth::BearerToken(token) => {
                header_set(headers, "authorization", format!("Bearer {token}"));
            }
            EndpointAuth::OpenAIKey {
                api_key,
                organization,
            } => {
                header_set(headers, "authorization", format!("Bearer {api_key}"));
                if let Some(org) = organization {
                    header_set(headers, "openai-organization", org);
                }
            }
        }
    }
}

/// Canonical operation tail. Azure-shaped and OpenAI-shaped requests both
/// collapse to the same suffix once the deployments prefix is gone;
/// unrecognised calls forward their original path untouched.
fn openai_tail(details: &CallDetails) -> String {
    match details.call_kind {
        CallKind::Chat => "chat/completions".to_string(),
        CallKind::Completion => "completions".to_string(),
        CallKind::Embedding => "embeddings".to_string(),
        CallKind::ImageGeneration => "images/generations".to_string(),
        CallKind::Transcription => "audio/transcriptions".to_string(),
        CallKind::Translation => "audio/translations".to_string(),
        CallKind::AssistantControl | CallKind::Other => {
            details.remaining_path.trim_start_matches('/').to_string()
        }
    }
}

/// Derive a body with the `model` field replaced. The raw body is never
/// mutated; retries always start from the original bytes.
fn rewrite_model_field(raw_body: &Bytes, upstream_model: Option<&str>) -> Option<Bytes> {
    if raw_body.is_empty() {
        return None;
    }
    let Some(model) = upstream_model else {
        return Some(raw_body.clone());
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(raw_body) else {
        return Some(raw_body.clone());
    };
    let Some(object) = value.as_object_mut() else {
        return Some(raw_body.clone());
    };
    object.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    match serde_json::to_vec(&value) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(_) => Some(raw_body.clone()),
    }
}

fn copy_exact_usage(usage: &mut UsageInformation, body: &Bytes) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return;
    };
    let Some(reported) = value.get("usage") else {
        return;
    };
    usage.prompt_tokens = reported.get("prompt_tokens").and_then(|v| v.as_u64());
    usage.completion_tokens = reported.get("completion_tokens").and_then(|v| v.as_u64());
    usage.total_tokens = reported.get("total_tokens").and_then(|v| v.as_u64());
}

fn headers_to_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
