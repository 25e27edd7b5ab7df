use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

type AffinityKey = (String, String);

/// Sticky-routing table: `(consumer_id, assistant_id) -> endpoint_id` with a
/// TTL. Entries are written on successful responses that carried an
/// assistant id and consulted before the wrapped strategy runs.
///
/// Monotonic clock only; expired entries are dropped lazily on access.
pub struct AffinityStore {
    ttl: Duration,
    entries: Mutex<HashMap<AffinityKey, (String, Instant)>>,
}

impl AffinityStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, consumer_id: &str, assistant_id: &str, endpoint_id: &str) {
        let expires = Instant::now() + self.ttl;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            (consumer_id.to_string(), assistant_id.to_string()),
            (endpoint_id.to_string(), expires),
        );
    }

    pub fn lookup(&self, consumer_id: &str, assistant_id: &str) -> Option<String> {
        let key = (consumer_id.to_string(), assistant_id.to_string());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&key) {
            Some((endpoint_id, expires)) if *expires > Instant::now() => {
                Some(endpoint_id.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_survives_within_ttl() {
        let store = AffinityStore::new(Duration::from_secs(60));
        store.record("client-1", "assistant-123", "east");
        assert_eq!(
            store.lookup("client-1", "assistant-123").as_deref(),
            Some("east")
        );
        assert!(store.lookup("client-2", "assistant-123").is_none());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let store = AffinityStore::new(Duration::ZERO);
        store.record("client-1", "assistant-123", "east");
        assert!(store.lookup("client-1", "assistant-123").is_none());
    }
}
