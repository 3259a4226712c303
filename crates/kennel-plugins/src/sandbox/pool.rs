//! Bounded worker pool for strict isolation.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::fault::{CatchFault, Fault};
use crate::error::{PluginError, PluginResult};

/// A fixed number of execution slots shared by the sandboxes of a manager.
///
/// Work waits for a free slot. Waiting ends early with
/// [`PluginError::Cancelled`] when the pool or the caller is cancelled.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool with `size` slots under the `cancel` scope.
    #[must_use]
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            cancel,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Whether the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.permits.is_closed()
    }

    /// Stop accepting work. Running work keeps its slot until it ends.
    pub fn close(&self) {
        self.permits.close();
        self.cancel.cancel();
    }

    pub(crate) async fn submit<F>(
        &self,
        work: F,
        caller: &CancellationToken,
    ) -> PluginResult<JoinHandle<Result<F::Output, Fault>>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PluginError::Cancelled),
            () = caller.cancelled() => return Err(PluginError::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| PluginError::Cancelled)?
            },
        };

        Ok(tokio::spawn(async move {
            let _permit = permit;
            CatchFault::new(work).await
        }))
    }
}
