use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-endpoint EWMA of observed upstream latencies.
///
/// The cell packs the current average (f64 bits) into an `AtomicU64` and is
/// updated with a CAS loop, so the hot path never takes a lock. A zero bit
/// pattern means "no sample yet"; selectors treat that as preferred, which
/// makes fresh endpoints get probed.
pub struct LatencyTracker {
    cells: HashMap<String, AtomicU64>,
    alpha: f64,
}

const DEFAULT_ALPHA: f64 = 0.3;

impl LatencyTracker {
    pub fn new(endpoint_ids: impl IntoIterator<Item = String>) -> Self {
        Self::with_alpha(endpoint_ids, DEFAULT_ALPHA)
    }

    pub fn with_alpha(endpoint_ids: impl IntoIterator<Item = String>, alpha: f64) -> Self {
        let cells = endpoint_ids
            .into_iter()
            .map(|id| (id, AtomicU64::new(0)))
            .collect();
        Self { cells, alpha }
    }

    /// Fold one observed duration into the endpoint's average. Failed and
    /// timed-out dispatches must not be recorded.
    pub fn record(&self, endpoint_id: &str, duration: Duration) {
        let Some(cell) = self.cells.get(endpoint_id) else {
            return;
        };
        let observed = duration.as_secs_f64().max(f64::MIN_POSITIVE);
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = if current == 0 {
                observed
            } else {
                let avg = f64::from_bits(current);
                self.alpha * observed + (1.0 - self.alpha) * avg
            };
            match cell.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// `None` until the first sample lands.
    pub fn sample(&self, endpoint_id: &str) -> Option<Duration> {
        let cell = self.cells.get(endpoint_id)?;
        let bits = cell.load(Ordering::Acquire);
        if bits == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(f64::from_bits(bits)))
    }
}
