use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    AzureOpenAI,
    OpenAI,
}

/// Auth material attached to outbound requests, per provider kind.
#[derive(Debug, Clone)]
pub enum EndpointAuth {
    /// Azure `api-key` header.
    ApiKey(String),
    /// Static AAD-style bearer token (`Authorization: Bearer ...`).
    BearerToken(String),
    /// OpenAI key plus optional `OpenAI-Organization`.
    OpenAIKey {
        api_key: String,
        organization: Option<String>,
    },
}

/// Immutable upstream endpoint configuration. Built once at startup and
/// shared across requests; the `id` is the stable metric/partition key.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub id: String,
    pub kind: EndpointKind,
    pub base_url: String,
    pub auth: EndpointAuth,
    /// Incoming model/deployment name -> upstream model/deployment name.
    pub model_map: HashMap<String, String>,
    pub max_concurrency: Option<usize>,
    /// `api-version` query value for AzureOpenAI targets.
    pub api_version: Option<String>,
}

impl EndpointDescriptor {
    pub fn upstream_model(&self, incoming: &str) -> Option<&str> {
        self.model_map.get(incoming).map(String::as_str)
    }

    /// Host portion of `base_url`, used for telemetry tags.
    pub fn host(&self) -> &str {
        let rest = self
            .base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(self.base_url.as_str());
        rest.split('/').next().unwrap_or(rest)
    }
}
