use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use tracing::{info, warn};
use uuid::Uuid;

use aicentral_endpoint_core::{
    GatewayError, GatewayResponse, SharedRecorder, TelemetryTags, UsageInformation,
    flat_gauge_name,
};
use aicentral_endpoints::{DispatchContext, DispatchOutcome, EndpointSelector, LatencyTracker};

use crate::auth::AuthProvider;
use crate::classify::classify_request;
use crate::steps::{Step, StepTicket};

pub const PIPELINE_HEADER: &str = "x-aicentral-pipeline";
pub const REQUEST_ID_HEADER: &str = "x-aicentral-request-id";

/// One configured pipeline: auth, the ordered limiter steps, and the
/// selector that terminates the chain. Steps run `admit` top-down and
/// `settle` bottom-up; for streamed responses settlement is deferred until
/// the stream's totals resolve.
pub struct Pipeline {
    name: String,
    hostnames: Vec<String>,
    diagnostics_enabled: bool,
    auth: Arc<dyn AuthProvider>,
    steps: Arc<Vec<Step>>,
    selector: Arc<EndpointSelector>,
    recorder: SharedRecorder,
    latency: Arc<LatencyTracker>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        hostnames: Vec<String>,
        diagnostics_enabled: bool,
        auth: Arc<dyn AuthProvider>,
        steps: Vec<Step>,
        selector: EndpointSelector,
        recorder: SharedRecorder,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            name: name.into(),
            hostnames,
            diagnostics_enabled,
            auth,
            steps: Arc::new(steps),
            selector: Arc::new(selector),
            recorder,
            latency,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.split(':').next().unwrap_or(host);
        self.hostnames
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(host))
    }

    pub async fn handle(
        self: &Arc<Self>,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> GatewayResponse {
        let trace_id = Uuid::now_v7().to_string();
        let started = Instant::now();

        let mut details = match classify_request(method, path, headers, body) {
            Ok(details) => details,
            Err(err) => {
                warn!(
                    event = "request_rejected",
                    trace_id = %trace_id,
                    pipeline = %self.name,
                    status = err.status.as_u16(),
                    reason = "malformed_request",
                );
                return self.finish_early(err, &trace_id);
            }
        };

        info!(
            event = "downstream_received",
            trace_id = %trace_id,
            pipeline = %self.name,
            call_kind = details.call_kind.as_str(),
            model = details.model_or_deployment(),
            path = %path,
            is_stream = details.is_streaming(),
        );

        let active = ActiveGuard::new(self.recorder.clone(), &self.name);

        match self.auth.authenticate(headers) {
            Ok(ctx) => details.consumer_id = ctx.consumer_id,
            Err(err) => {
                warn!(
                    event = "request_rejected",
                    trace_id = %trace_id,
                    pipeline = %self.name,
                    status = err.status.as_u16(),
                    reason = "unauthorized",
                );
                return self.finish_early(err, &trace_id);
            }
        }

        // Admission, top-down. Tickets stack so a rejection (or a drop on
        // cancellation) unwinds exactly what was taken.
        let mut entered: Vec<(usize, StepTicket)> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            match step.admit(&details).await {
                Ok(ticket) => entered.push((index, ticket)),
                Err(err) => {
                    warn!(
                        event = "request_rejected",
                        trace_id = %trace_id,
                        pipeline = %self.name,
                        status = err.status.as_u16(),
                        reason = "admission",
                        consumer = details.consumer_id.as_deref(),
                    );
                    self.abort_entered(entered);
                    return self.finish_early(err, &trace_id);
                }
            }
        }

        let ctx = DispatchContext {
            trace_id: trace_id.clone(),
        };
        let Some(outcome) = self.selector.dispatch(&details, &ctx).await else {
            self.abort_entered(entered);
            return self.finish_early(
                GatewayError::service_unavailable("no endpoints configured"),
                &trace_id,
            );
        };
        let DispatchOutcome {
            mut usage,
            mut response,
        } = outcome;

        if usage.success {
            self.latency.record(&usage.endpoint_id, usage.upstream_duration);
        }

        info!(
            event = "downstream_responded",
            trace_id = %trace_id,
            pipeline = %self.name,
            endpoint = %usage.endpoint_id,
            status = response.status().as_u16(),
            success = usage.success,
            elapsed_ms = started.elapsed().as_millis(),
            is_stream = response.is_stream(),
        );

        self.decorate(&mut response, &trace_id);

        match &mut response {
            GatewayResponse::Buffered { .. } => {
                self.settle(entered, &usage);
                self.emit_usage(&usage, details.consumer_id.as_deref());
                drop(active);
            }
            GatewayResponse::Stream { body, .. } => {
                // Settlement waits for the stream totals so token
                // reconciliation sees the completion estimate. The active
                // gauge spans the whole stream.
                let totals_rx = body.totals.take();
                let pipeline = self.clone();
                let consumer = details.consumer_id.clone();
                tokio::spawn(async move {
                    if let Some(rx) = totals_rx
                        && let Ok(totals) = rx.await
                    {
                        usage.estimated_completion_tokens =
                            Some(totals.estimated_completion_tokens);
                        if totals.total_tokens.is_some() {
                            usage.prompt_tokens = totals.prompt_tokens;
                            usage.completion_tokens = totals.completion_tokens;
                            usage.total_tokens = totals.total_tokens;
                        }
                    }
                    pipeline.settle(entered, &usage);
                    pipeline.emit_usage(&usage, consumer.as_deref());
                    drop(active);
                });
            }
        }

        response
    }

    fn settle(&self, entered: Vec<(usize, StepTicket)>, usage: &UsageInformation) {
        for (index, ticket) in entered.into_iter().rev() {
            self.steps[index].settle(ticket, usage);
        }
    }

    fn abort_entered(&self, entered: Vec<(usize, StepTicket)>) {
        for (index, ticket) in entered.into_iter().rev() {
            self.steps[index].abort(ticket);
        }
    }

    fn finish_early(&self, err: GatewayError, trace_id: &str) -> GatewayResponse {
        let tags = TelemetryTags {
            pipeline: Some(self.name.clone()),
            success: Some(false),
            ..Default::default()
        };
        self.recorder.up_down("rejected_requests", 1, &tags);
        let mut headers = err.headers;
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        GatewayResponse::Buffered {
            status: err.status,
            headers,
            body: err.body,
        }
    }

    fn decorate(&self, response: &mut GatewayResponse, trace_id: &str) {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if self.diagnostics_enabled
            && let Ok(value) = HeaderValue::from_str(&self.name)
        {
            headers.insert(PIPELINE_HEADER, value);
        }
    }

    fn emit_usage(&self, usage: &UsageInformation, consumer: Option<&str>) {
        let tags = TelemetryTags {
            pipeline: Some(self.name.clone()),
            endpoint: Some(usage.endpoint_id.clone()),
            deployment: Some(usage.deployment_or_model.clone()),
            model: Some(usage.deployment_or_model.clone()),
            call_kind: Some(usage.call_kind),
            streaming: Some(usage.streaming),
            success: Some(usage.success),
            client_name: consumer.map(str::to_string),
        };
        self.recorder.histogram(
            "upstream_duration_seconds",
            usage.upstream_duration.as_secs_f64(),
            &tags,
        );
        if let Some(prompt) = usage.prompt_tokens {
            self.recorder.histogram("prompt_tokens", prompt as f64, &tags);
        }
        if let Some(completion) = usage
            .completion_tokens
            .or(usage.estimated_completion_tokens)
        {
            self.recorder
                .histogram("completion_tokens", completion as f64, &tags);
        }
        if let Some(total) = usage.charged_tokens() {
            self.recorder.histogram("total_tokens", total as f64, &tags);
        }
        if let Some(remaining) = usage.remaining_requests_hint {
            self.recorder.gauge(
                &flat_gauge_name(
                    &usage.upstream_host,
                    &usage.deployment_or_model,
                    "remaining_requests",
                ),
                remaining as f64,
                &tags,
            );
        }
        if let Some(remaining) = usage.remaining_tokens_hint {
            self.recorder.gauge(
                &flat_gauge_name(
                    &usage.upstream_host,
                    &usage.deployment_or_model,
                    "remaining_tokens",
                ),
                remaining as f64,
                &tags,
            );
        }
    }
}

/// Holds the `active_requests` increment for the request lifetime; the
/// decrement rides the drop so every exit path, cancellation included,
/// balances the gauge.
struct ActiveGuard {
    recorder: SharedRecorder,
    tags: TelemetryTags,
}

impl ActiveGuard {
    fn new(recorder: SharedRecorder, pipeline: &str) -> Self {
        let tags = TelemetryTags::for_pipeline(pipeline);
        recorder.up_down("active_requests", 1, &tags);
        Self { recorder, tags }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.recorder.up_down("active_requests", -1, &self.tags);
    }
}
