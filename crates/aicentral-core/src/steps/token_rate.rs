use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use aicentral_endpoint_core::{CallDetails, GatewayError, UsageInformation};

use super::{PartitionMode, partition_key};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    used: u64,
}

/// What `admit` reserved, needed to reconcile later. The window start pins
/// the reservation to the bucket generation it was taken from; if the
/// window rolled before settlement the reservation is already gone.
#[derive(Debug)]
pub struct TokenReservation {
    key: String,
    amount: u64,
    window_start: Instant,
}

/// Windowed token budget. Admission reserves the prompt estimate; the
/// return path replaces the reservation with exact totals when the
/// upstream reported them, or adds the streamed completion estimate.
/// Over-estimates are refunded, under-estimates charged.
pub struct TokenRateStep {
    capacity: u64,
    window: Duration,
    mode: PartitionMode,
    state: Mutex<HashMap<String, Bucket>>,
}

impl TokenRateStep {
    pub fn new(capacity: u64, window: Duration, mode: PartitionMode) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            mode,
            state: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn admit(&self, details: &CallDetails) -> Result<TokenReservation, GatewayError> {
        let key = partition_key(self.mode, details);
        let estimate = details.estimated_prompt_tokens().max(1);
        let now = Instant::now();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = state.entry(key.clone()).or_insert(Bucket {
            window_start: now,
            used: 0,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.used = 0;
        }

        if bucket.used.saturating_add(estimate) > self.capacity {
            let elapsed = now.duration_since(bucket.window_start);
            let remaining = self.window.saturating_sub(elapsed);
            return Err(GatewayError::too_many_requests(
                "token rate limit reached",
                remaining.as_secs().max(1),
            ));
        }

        bucket.used += estimate;
        Ok(TokenReservation {
            key,
            amount: estimate,
            window_start: bucket.window_start,
        })
    }

    pub fn settle(&self, reservation: TokenReservation, usage: &UsageInformation) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(bucket) = state.get_mut(&reservation.key) else {
            return;
        };
        if bucket.window_start != reservation.window_start {
            // Window rolled; the reservation was wiped with it.
            return;
        }

        if let Some(exact) = usage.charged_tokens() {
            bucket.used = bucket
                .used
                .saturating_sub(reservation.amount)
                .saturating_add(exact);
        } else if let Some(estimated) = usage.estimated_completion_tokens {
            bucket.used = bucket.used.saturating_add(estimated);
        }
        // No usage data at all: the prompt reservation stands as charged.
    }

    /// Refund a reservation for a request that never reached dispatch.
    pub fn refund(&self, reservation: TokenReservation) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(bucket) = state.get_mut(&reservation.key) else {
            return;
        };
        if bucket.window_start != reservation.window_start {
            return;
        }
        bucket.used = bucket.used.saturating_sub(reservation.amount);
    }

    #[cfg(test)]
    fn used(&self, key: &str) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|bucket| bucket.used)
            .unwrap_or(0)
    }
}
