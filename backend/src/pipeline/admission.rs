use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

/// Caps the number of submissions driven at once. Waiters are admitted in
/// arrival order.
pub struct AdmissionGate {
    permits: Semaphore,
    limit: usize,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Semaphore::new(limit),
            limit,
        }
    }

    pub async fn admit(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.permits.acquire().await
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}
