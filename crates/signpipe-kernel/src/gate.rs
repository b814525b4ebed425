//! Permit pool guarding a rate-limited operation.
//!
//! A `Gate` with one permit is a mutual-exclusion lock around a single call
//! site; with more permits it is a bounded pool. Holders are counted so a
//! run can report the highest concurrency it ever admitted.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use signpipe_types::SignerError;

/// The gate was closed while a caller was waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gate closed")]
pub struct GateClosed;

impl From<GateClosed> for SignerError {
    fn from(_: GateClosed) -> Self {
        SignerError::Closed
    }
}

/// A fixed-size pool of permits.
#[derive(Debug)]
pub struct Gate {
    semaphore: Arc<Semaphore>,
    permits: usize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

/// Proof of admission. The permit returns to the pool on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Gate {
    /// Create a gate admitting up to `permits` holders at once (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// A gate admitting exactly one holder.
    pub fn exclusive() -> Self {
        Self::new(1)
    }

    /// Wait for a permit.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateClosed)?;

        let holders = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(holders, Ordering::SeqCst);

        Ok(GatePermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Run `fut` while holding a permit, releasing it as soon as `fut` completes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, GateClosed>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    /// Refuse new holders. Waiters get `GateClosed`; current holders keep
    /// their permits until they drop them.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Pool size.
    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Current number of holders.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
