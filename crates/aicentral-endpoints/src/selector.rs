use std::sync::Arc;

use http::HeaderValue;
use rand::Rng;
use tracing::debug;

use aicentral_endpoint_core::CallDetails;

use crate::affinity::AffinityStore;
use crate::dispatcher::{DispatchContext, DispatchOutcome, EndpointDispatcher};
use crate::latency::LatencyTracker;

pub type PriorityTier = Vec<Arc<EndpointDispatcher>>;

pub const AFFINITY_HEADER: &str = "x-aicentral-affinity";

/// Strategy tree deciding which dispatcher handles a request.
///
/// Selectors compose: `Hierarchical` nests whole selectors and `Affinity`
/// wraps one. `flatten` recurses through the tree so affinity lookups can
/// target any leaf regardless of nesting depth.
pub enum EndpointSelector {
    Random(Vec<Arc<EndpointDispatcher>>),
    Priority(Vec<PriorityTier>),
    LowestLatency {
        endpoints: Vec<Arc<EndpointDispatcher>>,
        tracker: Arc<LatencyTracker>,
    },
    Hierarchical(Vec<EndpointSelector>),
    Affinity {
        inner: Box<EndpointSelector>,
        store: Arc<AffinityStore>,
    },
}

impl EndpointSelector {
    /// All leaf dispatchers reachable through this selector.
    pub fn flatten(&self) -> Vec<Arc<EndpointDispatcher>> {
        match self {
            EndpointSelector::Random(endpoints) => endpoints.clone(),
            EndpointSelector::Priority(tiers) => {
                tiers.iter().flat_map(|tier| tier.iter().cloned()).collect()
            }
            EndpointSelector::LowestLatency { endpoints, .. } => endpoints.clone(),
            EndpointSelector::Hierarchical(children) => {
                children.iter().flat_map(|child| child.flatten()).collect()
            }
            EndpointSelector::Affinity { inner, .. } => inner.flatten(),
        }
    }

    /// Single pick with no fail-over driving; `None` when the selector has
    /// no endpoints at all.
    pub fn choose(&self, details: &CallDetails) -> Option<Arc<EndpointDispatcher>> {
        match self {
            EndpointSelector::Random(endpoints) => pick_random(endpoints),
            EndpointSelector::Priority(tiers) => {
                tiers.iter().find_map(|tier| pick_random(tier))
            }
            EndpointSelector::LowestLatency { endpoints, tracker } => {
                pick_lowest_latency(endpoints, tracker)
            }
            EndpointSelector::Hierarchical(children) => {
                let index = random_index(children.len())?;
                children[index].choose(details)
            }
            EndpointSelector::Affinity { inner, store } => self
                .preferred_endpoint(details, store)
                .or_else(|| inner.choose(details)),
        }
    }

    /// Drive the request through the strategy, including fail-over. The
    /// worst case returns the last upstream outcome as-is; a status is
    /// never fabricated here.
    pub async fn dispatch(
        &self,
        details: &CallDetails,
        ctx: &DispatchContext,
    ) -> Option<DispatchOutcome> {
        match self {
            EndpointSelector::Random(endpoints) => {
                let endpoint = pick_random(endpoints)?;
                Some(endpoint.dispatch(details, ctx).await)
            }
            EndpointSelector::Priority(tiers) => self.dispatch_cascade(tiers, details, ctx).await,
            EndpointSelector::LowestLatency { endpoints, tracker } => {
                let endpoint = pick_lowest_latency(endpoints, tracker)?;
                Some(endpoint.dispatch(details, ctx).await)
            }
            EndpointSelector::Hierarchical(children) => {
                let index = random_index(children.len())?;
                Box::pin(children[index].dispatch(details, ctx)).await
            }
            EndpointSelector::Affinity { inner, store } => {
                let outcome = match self.preferred_endpoint(details, store) {
                    Some(endpoint) => {
                        debug!(
                            event = "affinity_route",
                            trace_id = %ctx.trace_id,
                            endpoint = %endpoint.id(),
                        );
                        Some(endpoint.dispatch(details, ctx).await)
                    }
                    None => Box::pin(inner.dispatch(details, ctx)).await,
                };
                let mut outcome = outcome?;
                self.remember_affinity(details, store, &mut outcome);
                Some(outcome)
            }
        }
    }

    async fn dispatch_cascade(
        &self,
        tiers: &[PriorityTier],
        details: &CallDetails,
        ctx: &DispatchContext,
    ) -> Option<DispatchOutcome> {
        let mut last = None;
        for tier in tiers {
            let mut remaining: Vec<Arc<EndpointDispatcher>> = tier.clone();
            while !remaining.is_empty() {
                let index = random_index(remaining.len())?;
                let endpoint = remaining.swap_remove(index);
                let outcome = endpoint.dispatch(details, ctx).await;
                if outcome.usage.success {
                    return Some(outcome);
                }
                if !outcome.is_transient_failure() {
                    // 4xx other than 429 halts the cascade.
                    return Some(outcome);
                }
                debug!(
                    event = "cascade_failover",
                    trace_id = %ctx.trace_id,
                    endpoint = %endpoint.id(),
                    status = outcome.response.status().as_u16(),
                );
                last = Some(outcome);
            }
        }
        last
    }

    /// Resolve a sticky target: the explicit affinity header first, then the
    /// recorded `(consumer, assistant)` window. Ids that no longer resolve
    /// to a reachable leaf are ignored, never errors.
    fn preferred_endpoint(
        &self,
        details: &CallDetails,
        store: &AffinityStore,
    ) -> Option<Arc<EndpointDispatcher>> {
        let leaves = self.flatten();
        if let Some(wanted) = details.preferred_endpoint_id.as_deref()
            && let Some(endpoint) = leaves.iter().find(|leaf| leaf.id() == wanted)
        {
            return Some(endpoint.clone());
        }
        let assistant = details.assistant_id.as_deref()?;
        let consumer = details.consumer_id.as_deref().unwrap_or("");
        let recorded = store.lookup(consumer, assistant)?;
        leaves.iter().find(|leaf| leaf.id() == recorded).cloned()
    }

    fn remember_affinity(
        &self,
        details: &CallDetails,
        store: &AffinityStore,
        outcome: &mut DispatchOutcome,
    ) {
        if !outcome.usage.success {
            return;
        }
        let endpoint_id = outcome.usage.endpoint_id.clone();
        if let Some(assistant) = details.assistant_id.as_deref() {
            let consumer = details.consumer_id.as_deref().unwrap_or("");
            store.record(consumer, assistant, &endpoint_id);
        }
        // Advertise the handling endpoint so callers can pin follow-ups.
        if let Ok(value) = HeaderValue::from_str(&endpoint_id) {
            outcome
                .response
                .headers_mut()
                .insert(AFFINITY_HEADER, value);
        }
    }
}

fn random_index(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(rand::rng().random_range(0..len))
}

fn pick_random(endpoints: &[Arc<EndpointDispatcher>]) -> Option<Arc<EndpointDispatcher>> {
    random_index(endpoints.len()).map(|index| endpoints[index].clone())
}

/// Unsampled endpoints win over any sampled one so new endpoints get
/// probed; among sampled, the lowest EWMA wins with random tie-breaking.
fn pick_lowest_latency(
    endpoints: &[Arc<EndpointDispatcher>],
    tracker: &LatencyTracker,
) -> Option<Arc<EndpointDispatcher>> {
    let unsampled: Vec<&Arc<EndpointDispatcher>> = endpoints
        .iter()
        .filter(|endpoint| tracker.sample(endpoint.id()).is_none())
        .collect();
    if !unsampled.is_empty() {
        let index = random_index(unsampled.len())?;
        return Some(unsampled[index].clone());
    }

    let mut best: Vec<&Arc<EndpointDispatcher>> = Vec::new();
    let mut best_latency = None;
    for endpoint in endpoints {
        let Some(sampled) = tracker.sample(endpoint.id()) else {
            continue;
        };
        match best_latency {
            None => {
                best_latency = Some(sampled);
                best.push(endpoint);
            }
            Some(current) if sampled < current => {
                best_latency = Some(sampled);
                best.clear();
                best.push(endpoint);
            }
            Some(current) if sampled == current => best.push(endpoint),
            Some(_) => {}
        }
    }
    let index = random_index(best.len())?;
    Some(best[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use aicentral_endpoint_core::{
        CallKind, EndpointAuth, EndpointDescriptor, EndpointKind, HttpMethod, ResponseShape,
        UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    };
    use bytes::Bytes;

    struct NoopClient;

    impl UpstreamClient for NoopClient {
        fn send<'a>(
            &'a self,
            _req: UpstreamHttpRequest,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>>
                    + Send
                    + 'a,
            >,
        > {
            Box::pin(async { panic!("network must not be reached") })
        }
    }

    fn endpoint(id: &str) -> Arc<EndpointDispatcher> {
        let descriptor = EndpointDescriptor {
            id: id.to_string(),
            kind: EndpointKind::OpenAI,
            base_url: "https://api.example.com/v1".to_string(),
            auth: EndpointAuth::OpenAIKey {
                api_key: "k".to_string(),
                organization: None,
            },
            model_map: HashMap::new(),
            max_concurrency: None,
            api_version: None,
        };
        Arc::new(EndpointDispatcher::new(descriptor, Arc::new(NoopClient)))
    }

    fn details() -> CallDetails {
        CallDetails {
            call_kind: CallKind::Chat,
            method: HttpMethod::Post,
            incoming_model_name: None,
            deployment_name: None,
            assistant_id: None,
            prompt_text: None,
            response_shape: ResponseShape::Buffered,
            remaining_path: "chat/completions".to_string(),
            raw_body: Bytes::new(),
            consumer_id: None,
            preferred_endpoint_id: None,
        }
    }

    #[test]
    fn flatten_recurses_through_nesting() {
        let selector = EndpointSelector::Affinity {
            inner: Box::new(EndpointSelector::Hierarchical(vec![
                EndpointSelector::Random(vec![endpoint("a"), endpoint("b")]),
                EndpointSelector::Priority(vec![vec![endpoint("c")], vec![endpoint("d")]]),
            ])),
            store: Arc::new(AffinityStore::new(Duration::from_secs(60))),
        };
        let ids: Vec<String> = selector
            .flatten()
            .iter()
            .map(|leaf| leaf.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unknown_preferred_endpoint_falls_back_to_strategy() {
        let store = Arc::new(AffinityStore::new(Duration::from_secs(60)));
        let selector = EndpointSelector::Affinity {
            inner: Box::new(EndpointSelector::Random(vec![endpoint("a")])),
            store,
        };
        let mut request = details();
        request.preferred_endpoint_id = Some("not-configured".to_string());
        let chosen = selector.choose(&request).unwrap();
        assert_eq!(chosen.id(), "a");
    }

    #[test]
    fn preferred_endpoint_wins_when_reachable() {
        let store = Arc::new(AffinityStore::new(Duration::from_secs(60)));
        let selector = EndpointSelector::Affinity {
            inner: Box::new(EndpointSelector::Random(vec![endpoint("a"), endpoint("b")])),
            store,
        };
        let mut request = details();
        request.preferred_endpoint_id = Some("b".to_string());
        for _ in 0..20 {
            assert_eq!(selector.choose(&request).unwrap().id(), "b");
        }
    }

    #[test]
    fn lowest_latency_prefers_unsampled() {
        let tracker = Arc::new(LatencyTracker::new(["a".to_string(), "b".to_string()]));
        tracker.record("a", Duration::from_millis(10));
        let selector = EndpointSelector::LowestLatency {
            endpoints: vec![endpoint("a"), endpoint("b")],
            tracker: tracker.clone(),
        };
        for _ in 0..20 {
            assert_eq!(selector.choose(&details()).unwrap().id(), "b");
        }

        tracker.record("b", Duration::from_millis(50));
        for _ in 0..20 {
            assert_eq!(selector.choose(&details()).unwrap().id(), "a");
        }
    }
}
