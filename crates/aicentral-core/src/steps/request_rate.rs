use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use aicentral_endpoint_core::{CallDetails, GatewayError};

use super::{PartitionMode, partition_key};

#[derive(Debug, Clone, Copy)]
struct Window {
    start: Instant,
    count: u64,
}

/// Fixed-window request counter. Tokens are consumed at admission; the
/// return path is a no-op. Rejections carry `Retry-After` equal to the
/// seconds until the window resets.
pub struct RequestRateStep {
    capacity: u64,
    window: Duration,
    mode: PartitionMode,
    state: Mutex<HashMap<String, Window>>,
}

impl RequestRateStep {
    pub fn new(capacity: u64, window: Duration, mode: PartitionMode) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            mode,
            state: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn admit(&self, details: &CallDetails) -> Result<(), GatewayError> {
        let key = partition_key(self.mode, details);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let window = state.entry(key).or_insert(Window {
            start: now,
            count: 0,
        });

        if now.duration_since(window.start) >= self.window {
            window.start = now;
            window.count = 0;
        }

        if window.count >= self.capacity {
            let elapsed = now.duration_since(window.start);
            let remaining = self.window.saturating_sub(elapsed);
            return Err(GatewayError::too_many_requests(
                "request rate limit reached",
                remaining.as_secs().max(1),
            ));
        }

        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aicentral_endpoint_core::{CallKind, HttpMethod, ResponseShape};
    use bytes::Bytes;

    fn details(consumer: Option<&str>) -> CallDetails {
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
            consumer_id: consumer.map(str::to_string),
            preferred_endpoint_id: None,
        }
    }

    #[test]
    fn third_request_in_window_is_rejected() {
        let step = RequestRateStep::new(2, Duration::from_secs(60), PartitionMode::PerConsumer);
        assert!(step.admit(&details(Some("client-1"))).is_ok());
        assert!(step.admit(&details(Some("client-1"))).is_ok());
        let err = step.admit(&details(Some("client-1"))).unwrap_err();
        assert_eq!(err.status, http::StatusCode::TOO_MANY_REQUESTS);
        let retry_after = err
            .headers
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap();
        assert!(retry_after >= 1 && retry_after <= 60);

        // Other consumers are unaffected.
        assert!(step.admit(&details(Some("client-2"))).is_ok());
    }

    #[test]
    fn window_reset_admits_again() {
        let step =
            RequestRateStep::new(1, Duration::from_millis(20), PartitionMode::PerPipeline);
        assert!(step.admit(&details(None)).is_ok());
        assert!(step.admit(&details(None)).is_err());
        std::thread::sleep(Duration::from_millis(30));
        assert!(step.admit(&details(None)).is_ok());
    }

    #[test]
    fn anonymous_requests_share_the_pipeline_partition() {
        let step = RequestRateStep::new(1, Duration::from_secs(60), PartitionMode::PerConsumer);
        assert!(step.admit(&details(None)).is_ok());
        assert!(step.admit(&details(None)).is_err());
    }
}
