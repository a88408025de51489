//! Bounded-concurrency gate.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;

/// Fixed-capacity permit pool that runs a unit of work once a permit is free.
///
/// Permits are released when the work finishes, fails or unwinds. There is no
/// fairness guarantee beyond tokio's FIFO permit queue.
pub struct Semaphore<T> {
    permits: Arc<tokio::sync::Semaphore>,
    capacity: usize,
    _result: PhantomData<fn() -> T>,
}

impl<T> Semaphore<T> {
    /// Create a gate with `capacity` permits.
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(capacity)),
            capacity,
            _result: PhantomData,
        }
    }

    /// Wait for a permit, then run `work` while holding it.
    ///
    /// If `cancel` fires first, `work` is never run and the error converted
    /// from [`Cancelled`] is returned.
    pub async fn when_acquired<E, F, Fut>(&self, cancel: &CancellationToken, work: F) -> Result<T, E>
    where
        E: From<Cancelled>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            permit = self.permits.acquire() => permit.map_err(|_| Cancelled)?,
        };

        work().await
    }

    /// Number of permits currently held. Advisory only.
    pub fn len(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    /// True when no permit is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> std::fmt::Debug for Semaphore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("capacity", &self.capacity)
            .field("held", &self.len())
            .finish()
    }
}
