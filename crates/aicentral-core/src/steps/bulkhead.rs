use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use aicentral_endpoint_core::{CallDetails, GatewayError};

use super::{PartitionMode, partition_key};

/// Hard cap on concurrent in-flight requests. A zero queue timeout rejects
/// immediately once the cap is reached; otherwise the acquire waits up to
/// the timeout. The wait honours cancellation: an abandoned wait consumes
/// nothing.
///
/// The permit is owned by the ticket and released on drop, which covers
/// success, error, and caller-disconnect paths alike.
pub struct BulkHeadStep {
    capacity: usize,
    queue_timeout: Duration,
    mode: PartitionMode,
    partitions: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl BulkHeadStep {
    pub fn new(capacity: usize, queue_timeout: Duration, mode: PartitionMode) -> Self {
        Self {
            capacity: capacity.max(1),
            queue_timeout,
            mode,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, key: &str) -> Arc<Semaphore> {
        let mut partitions = self
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone()
    }

    pub async fn admit(
        &self,
        details: &CallDetails,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        let key = partition_key(self.mode, details);
        let semaphore = self.semaphore_for(&key);

        if self.queue_timeout.is_zero() {
            return semaphore
                .try_acquire_owned()
                .map_err(|_| self.rejection());
        }

        match tokio::time::timeout(self.queue_timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(self.rejection()),
        }
    }

    fn rejection(&self) -> GatewayError {
        let retry_after = self.queue_timeout.as_secs().max(1);
        GatewayError::too_many_requests("concurrency limit reached", retry_after)
    }
}
