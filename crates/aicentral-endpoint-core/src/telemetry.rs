use std::sync::Arc;

use crate::details::CallKind;

/// Dimension set attached to every metric emission.
#[derive(Debug, Clone, Default)]
pub struct TelemetryTags {
    pub pipeline: Option<String>,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub model: Option<String>,
    pub call_kind: Option<CallKind>,
    pub streaming: Option<bool>,
    pub success: Option<bool>,
    pub client_name: Option<String>,
}

impl TelemetryTags {
    pub fn for_pipeline(name: &str) -> Self {
        Self {
            pipeline: Some(name.to_string()),
            ..Default::default()
        }
    }
}

/// Sink for gateway metrics. Implementations must never fail the request
/// path; errors are swallowed and logged by the implementation itself.
pub trait TelemetryRecorder: Send + Sync {
    fn histogram(&self, name: &str, value: f64, tags: &TelemetryTags);
    fn up_down(&self, name: &str, delta: i64, tags: &TelemetryTags);
    fn gauge(&self, name: &str, value: f64, tags: &TelemetryTags);
}

pub type SharedRecorder = Arc<dyn TelemetryRecorder>;

#[derive(Debug, Default)]
pub struct NoopRecorder;

impl TelemetryRecorder for NoopRecorder {
    fn histogram(&self, _name: &str, _value: f64, _tags: &TelemetryTags) {}
    fn up_down(&self, _name: &str, _delta: i64, _tags: &TelemetryTags) {}
    fn gauge(&self, _name: &str, _value: f64, _tags: &TelemetryTags) {}
}

/// Emits metrics as structured trace events. Gauges that cannot carry
/// dimensions are flattened to `downstream.{host}.{model}.{metric}` names
/// by the caller before they reach the recorder.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl TelemetryRecorder for LogRecorder {
    fn histogram(&self, name: &str, value: f64, tags: &TelemetryTags) {
        tracing::debug!(
            metric = name,
            kind = "histogram",
            value,
            pipeline = tags.pipeline.as_deref(),
            endpoint = tags.endpoint.as_deref(),
            model = tags.model.as_deref(),
            success = tags.success,
        );
    }

    fn up_down(&self, name: &str, delta: i64, tags: &TelemetryTags) {
        tracing::debug!(
            metric = name,
            kind = "up_down",
            delta,
            pipeline = tags.pipeline.as_deref(),
        );
    }

    fn gauge(&self, name: &str, value: f64, tags: &TelemetryTags) {
        tracing::debug!(
            metric = name,
            kind = "gauge",
            value,
            pipeline = tags.pipeline.as_deref(),
            endpoint = tags.endpoint.as_deref(),
        );
    }
}

/// Flattened metric name for sinks whose gauges cannot carry dimensions.
pub fn flat_gauge_name(host: &str, model_or_deployment: &str, metric: &str) -> String {
    let host = host.replace(['.', ':'], "_");
    format!("downstream.{host}.{model_or_deployment}.{metric}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_gauge_name_normalizes_host() {
        assert_eq!(
            flat_gauge_name("east.openai.azure.com", "gpt4", "remaining_tokens"),
            "downstream.east_openai_azure_com.gpt4.remaining_tokens"
        );
    }
}
