use std::time::{Duration, SystemTime};

use crate::details::CallKind;

/// Post-call accounting for one request. Exactly one of these is produced
/// per request, success or failure; downstream steps consume it on the
/// return path (token reconciliation, telemetry, latency samples).
#[derive(Debug, Clone)]
pub struct UsageInformation {
    pub endpoint_id: String,
    pub upstream_host: String,
    pub deployment_or_model: String,
    pub call_kind: CallKind,
    pub streaming: bool,
    pub success: bool,
    /// Exact counts when the upstream returned a usage object.
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Incremental estimate for streamed responses; resolved at stream end.
    pub estimated_completion_tokens: Option<u64>,
    pub upstream_duration: Duration,
    pub started_at: SystemTime,
    pub remaining_requests_hint: Option<u64>,
    pub remaining_tokens_hint: Option<u64>,
}

impl UsageInformation {
    pub fn failure(
        endpoint_id: impl Into<String>,
        upstream_host: impl Into<String>,
        deployment_or_model: impl Into<String>,
        call_kind: CallKind,
        streaming: bool,
    ) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            upstream_host: upstream_host.into(),
            deployment_or_model: deployment_or_model.into(),
            call_kind,
            streaming,
            success: false,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            estimated_completion_tokens: None,
            upstream_duration: Duration::ZERO,
            started_at: SystemTime::now(),
            remaining_requests_hint: None,
            remaining_tokens_hint: None,
        }
    }

    /// Best available charge for token-rate accounting: exact totals win,
    /// otherwise exact parts, otherwise the streaming estimate.
    pub fn charged_tokens(&self) -> Option<u64> {
        if let Some(total) = self.total_tokens {
            return Some(total);
        }
        match (self.prompt_tokens, self.completion_tokens) {
            (Some(prompt), Some(completion)) => Some(prompt + completion),
            _ => None,
        }
    }
}
