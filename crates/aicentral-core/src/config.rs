use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use aicentral_endpoint_core::{
    EndpointAuth, EndpointDescriptor, EndpointKind, SharedRecorder, UpstreamClient,
};
use aicentral_endpoints::{
    AffinityStore, EndpointDispatcher, EndpointSelector, LatencyTracker,
};

use crate::auth::{AuthProvider, KeySnapshot, MemoryAuth, NoopAuth};
use crate::pipeline::Pipeline;
use crate::steps::{BulkHeadStep, PartitionMode, RequestRateStep, Step, TokenRateStep};

/// Top-level declarative configuration: one gateway process hosts any
/// number of pipelines, matched by hostname.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub diagnostics: bool,
    #[serde(default)]
    pub auth: AuthSpec,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    pub selector: SelectorSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    #[default]
    None,
    ApiKeys {
        clients: Vec<ClientKeysSpec>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientKeysSpec {
    pub name: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSpec {
    #[default]
    PerPipeline,
    PerConsumer,
}

impl From<PartitionSpec> for PartitionMode {
    fn from(spec: PartitionSpec) -> Self {
        match spec {
            PartitionSpec::PerPipeline => PartitionMode::PerPipeline,
            PartitionSpec::PerConsumer => PartitionMode::PerConsumer,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    BulkHead {
        capacity: usize,
        #[serde(default)]
        queue_timeout_ms: u64,
        #[serde(default)]
        partition: PartitionSpec,
    },
    RequestRate {
        requests: u64,
        window_seconds: u64,
        #[serde(default)]
        partition: PartitionSpec,
    },
    TokenRate {
        tokens: u64,
        window_seconds: u64,
        #[serde(default)]
        partition: PartitionSpec,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SelectorSpec {
    Random {
        endpoints: Vec<EndpointSpec>,
    },
    Priority {
        tiers: Vec<Vec<EndpointSpec>>,
    },
    LowestLatency {
        endpoints: Vec<EndpointSpec>,
    },
    Hierarchical {
        children: Vec<SelectorSpec>,
    },
    Affinity {
        ttl_seconds: u64,
        inner: Box<SelectorSpec>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSpec {
    pub id: String,
    pub kind: EndpointKindSpec,
    pub base_url: String,
    pub auth: EndpointAuthSpec,
    #[serde(default)]
    pub model_map: HashMap<String, String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Upstream dispatch deadline; expiry surfaces as 504.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKindSpec {
    AzureOpenai,
    Openai,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointAuthSpec {
    ApiKey { key: String },
    BearerToken { token: String },
    OpenaiKey {
        api_key: String,
        #[serde(default)]
        organization: Option<String>,
    },
}

/// Build every configured pipeline against one shared upstream client and
/// recorder.
pub fn build_pipelines(
    config: &GatewayConfig,
    client: Arc<dyn UpstreamClient>,
    recorder: SharedRecorder,
) -> Vec<Arc<Pipeline>> {
    config
        .pipelines
        .iter()
        .map(|pipeline| Arc::new(build_pipeline(pipeline, client.clone(), recorder.clone())))
        .collect()
}

pub fn build_pipeline(
    config: &PipelineConfig,
    client: Arc<dyn UpstreamClient>,
    recorder: SharedRecorder,
) -> Pipeline {
    let endpoint_ids = collect_endpoint_ids(&config.selector);
    let latency = Arc::new(LatencyTracker::new(endpoint_ids));
    let selector = build_selector(&config.selector, &client, &latency);

    let auth: Arc<dyn AuthProvider> = match &config.auth {
        AuthSpec::None => Arc::new(NoopAuth),
        AuthSpec::ApiKeys { clients } => {
            let entries = clients
                .iter()
                .map(|client| (client.name.as_str(), client.keys.as_slice()));
            Arc::new(MemoryAuth::new(KeySnapshot::from_clients(entries)))
        }
    };

    let steps = config.steps.iter().map(build_step).collect();

    Pipeline::new(
        config.name.clone(),
        config.hosts.clone(),
        config.diagnostics,
        auth,
        steps,
        selector,
        recorder,
        latency,
    )
}

fn build_step(spec: &StepSpec) -> Step {
    match spec {
        StepSpec::BulkHead {
            capacity,
            queue_timeout_ms,
            partition,
        } => Step::BulkHead(BulkHeadStep::new(
            *capacity,
            Duration::from_millis(*queue_timeout_ms),
            (*partition).into(),
        )),
        StepSpec::RequestRate {
            requests,
            window_seconds,
            partition,
        } => Step::RequestRate(RequestRateStep::new(
            *requests,
            Duration::from_secs(*window_seconds),
            (*partition).into(),
        )),
        StepSpec::TokenRate {
            tokens,
            window_seconds,
            partition,
        } => Step::TokenRate(TokenRateStep::new(
            *tokens,
            Duration::from_secs(*window_seconds),
            (*partition).into(),
        )),
    }
}

fn build_selector(
    spec: &SelectorSpec,
    client: &Arc<dyn UpstreamClient>,
    latency: &Arc<LatencyTracker>,
) -> EndpointSelector {
    match spec {
        SelectorSpec::Random { endpoints } => {
            EndpointSelector::Random(build_dispatchers(endpoints, client))
        }
        SelectorSpec::Priority { tiers } => EndpointSelector::Priority(
            tiers
                .iter()
                .map(|tier| build_dispatchers(tier, client))
                .collect(),
        ),
        SelectorSpec::LowestLatency { endpoints } => EndpointSelector::LowestLatency {
            endpoints: build_dispatchers(endpoints, client),
            tracker: latency.clone(),
        },
        SelectorSpec::Hierarchical { children } => EndpointSelector::Hierarchical(
            children
                .iter()
                .map(|child| build_selector(child, client, latency))
                .collect(),
        ),
        SelectorSpec::Affinity { ttl_seconds, inner } => EndpointSelector::Affinity {
            inner: Box::new(build_selector(inner, client, latency)),
            store: Arc::new(AffinityStore::new(Duration::from_secs(*ttl_seconds))),
        },
    }
}

fn build_dispatchers(
    specs: &[EndpointSpec],
    client: &Arc<dyn UpstreamClient>,
) -> Vec<Arc<EndpointDispatcher>> {
    specs
        .iter()
        .map(|spec| {
            let mut dispatcher = EndpointDispatcher::new(build_descriptor(spec), client.clone());
            if let Some(seconds) = spec.timeout_seconds {
                dispatcher = dispatcher.with_dispatch_timeout(Duration::from_secs(seconds.max(1)));
            }
            Arc::new(dispatcher)
        })
        .collect()
}

fn build_descriptor(spec: &EndpointSpec) -> EndpointDescriptor {
    EndpointDescriptor {
        id: spec.id.clone(),
        kind: match spec.kind {
            EndpointKindSpec::AzureOpenai => EndpointKind::AzureOpenAI,
            EndpointKindSpec::Openai => EndpointKind::OpenAI,
        },
        base_url: spec.base_url.clone(),
        auth: match &spec.auth {
            EndpointAuthSpec::ApiKey { key } => EndpointAuth::ApiKey(key.clone()),
            EndpointAuthSpec::BearerToken { token } => EndpointAuth::BearerToken(token.clone()),
            EndpointAuthSpec::OpenaiKey {
                api_key,
                organization,
            } => EndpointAuth::OpenAIKey {
                api_key: api_key.clone(),
                organization: organization.clone(),
            },
        },
        model_map: spec.model_map.clone(),
        max_concurrency: spec.max_concurrency,
        api_version: spec.api_version.clone(),
    }
}

fn collect_endpoint_ids(spec: &SelectorSpec) -> Vec<String> {
    match spec {
        SelectorSpec::Random { endpoints } | SelectorSpec::LowestLatency { endpoints } => {
            endpoints.iter().map(|endpoint| endpoint.id.clone()).collect()
        }
        SelectorSpec::Priority { tiers } => tiers
            .iter()
            .flat_map(|tier| tier.iter().map(|endpoint| endpoint.id.clone()))
            .collect(),
        SelectorSpec::Hierarchical { children } => {
            children.iter().flat_map(collect_endpoint_ids).collect()
        }
        SelectorSpec::Affinity { inner, .. } => collect_endpoint_ids(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_deserializes() {
        let raw = serde_json::json!({
            "pipelines": [{
                "name": "main",
                "hosts": ["gateway.example.com"],
                "diagnostics": true,
                "auth": {
                    "type": "api_keys",
                    "clients": [{"name": "client-1", "keys": ["k1"]}]
                },
                "steps": [
                    {"type": "bulk_head", "capacity": 5},
                    {"type": "request_rate", "requests": 100, "window_seconds": 60,
                     "partition": "per_consumer"},
                    {"type": "token_rate", "tokens": 5000, "window_seconds": 60}
                ],
                "selector": {
                    "strategy": "affinity",
                    "ttl_seconds": 60,
                    "inner": {
                        "strategy": "priority",
                        "tiers": [[{
                            "id": "east",
                            "kind": "azure_openai",
                            "base_url": "https://east.openai.azure.com",
                            "auth": {"type": "api_key", "key": "secret"},
                            "model_map": {"Model1": "gpt-4-prod"},
                            "api_version": "2024-02-01",
                            "timeout_seconds": 60
                        }]]
                    }
                }
            }]
        });
        let config: GatewayConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.pipelines.len(), 1);
        let pipeline = &config.pipelines[0];
        assert!(pipeline.diagnostics);
        assert_eq!(pipeline.steps.len(), 3);
        assert_eq!(
            collect_endpoint_ids(&pipeline.selector),
            vec!["east".to_string()]
        );
        let SelectorSpec::Affinity { inner, .. } = &pipeline.selector else {
            panic!("expected affinity selector");
        };
        let SelectorSpec::Priority { tiers } = inner.as_ref() else {
            panic!("expected priority inner selector");
        };
        assert_eq!(tiers[0][0].timeout_seconds, Some(60));
    }
}
