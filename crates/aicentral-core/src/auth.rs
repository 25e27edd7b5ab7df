use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::HeaderMap;

use aicentral_endpoint_core::GatewayError;

/// Result of consumer authentication: the client name becomes the
/// `consumer_id` visible to every later step (per-consumer limiters,
/// affinity, telemetry).
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub consumer_id: Option<String>,
}

pub trait AuthProvider: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, GatewayError>;
}

/// Pipelines configured with `auth: none` admit everything anonymously.
#[derive(Debug, Default)]
pub struct NoopAuth;

impl AuthProvider for NoopAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<AuthContext, GatewayError> {
        Ok(AuthContext::default())
    }
}

#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub client_name: String,
}

/// Key table snapshot, hot-swappable without touching in-flight requests.
#[derive(Debug, Clone, Default)]
pub struct KeySnapshot {
    pub keys_by_value: HashMap<String, ClientEntry>,
}

impl KeySnapshot {
    pub fn from_clients<'a>(
        clients: impl IntoIterator<Item = (&'a str, &'a [String])>,
    ) -> Self {
        let mut keys_by_value = HashMap::new();
        for (name, keys) in clients {
            for key in keys {
                keys_by_value.insert(
                    key.clone(),
                    ClientEntry {
                        client_name: name.to_string(),
                    },
                );
            }
        }
        Self { keys_by_value }
    }
}

#[derive(Debug)]
pub struct MemoryAuth {
    snapshot: ArcSwap<KeySnapshot>,
}

impl MemoryAuth {
    pub fn new(snapshot: KeySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn replace_snapshot(&self, snapshot: KeySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl AuthProvider for MemoryAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, GatewayError> {
        let api_key = extract_api_key(headers)
            .ok_or_else(|| GatewayError::unauthorized("missing api key"))?;

        let snapshot = self.snapshot.load();
        let entry = snapshot
            .keys_by_value
            .get(api_key.as_str())
            .ok_or_else(|| GatewayError::unauthorized("invalid api key"))?;

        Ok(AuthContext {
            consumer_id: Some(entry.client_name.clone()),
        })
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with_key(client: &str, key: &str) -> MemoryAuth {
        let keys = vec![key.to_string()];
        MemoryAuth::new(KeySnapshot::from_clients([(client, keys.as_slice())]))
    }

    #[test]
    fn api_key_header_resolves_consumer() {
        let auth = auth_with_key("client-1", "secret");
        let mut headers = HeaderMap::new();
        headers.insert("api-key", "secret".parse().unwrap());
        let ctx = auth.authenticate(&headers).unwrap();
        assert_eq!(ctx.consumer_id.as_deref(), Some("client-1"));
    }

    #[test]
    fn bearer_token_is_accepted() {
        let auth = auth_with_key("client-1", "secret");
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        let ctx = auth.authenticate(&headers).unwrap();
        assert_eq!(ctx.consumer_id.as_deref(), Some("client-1"));
    }

    #[test]
    fn unknown_key_is_unauthorized() {
        let auth = auth_with_key("client-1", "secret");
        let mut headers = HeaderMap::new();
        headers.insert("api-key", "wrong".parse().unwrap());
        let err = auth.authenticate(&headers).unwrap_err();
        assert_eq!(err.status, http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn snapshot_swap_takes_effect() {
        let auth = auth_with_key("client-1", "old");
        let keys = vec!["new".to_string()];
        auth.replace_snapshot(KeySnapshot::from_clients([("client-1", keys.as_slice())]));
        let mut headers = HeaderMap::new();
        headers.insert("api-key", "old".parse().unwrap());
        assert!(auth.authenticate(&headers).is_err());
    }
}
