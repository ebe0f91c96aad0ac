//! Per-track concurrency slot shared with blocking work

use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

/// One track's claim on a run's concurrency slots
///
/// Clones share the permit, which goes back to the run only when the last
/// clone drops. Blocking work (transcode, extraction) holds a clone, so a
/// track that timed out keeps its slot until that work has actually stopped.
#[derive(Debug, Clone, Default)]
pub struct TrackSlot {
    permit: Option<Arc<OwnedSemaphorePermit>>,
    cancel: CancellationToken,
}

impl TrackSlot {
    /// `cancel` should be private to the track, e.g. a child of the run token
    pub fn new(permit: Option<OwnedSemaphorePermit>, cancel: CancellationToken) -> Self {
        Self {
            permit: permit.map(Arc::new),
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the track is cancelled or aborted
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Ask blocking work still holding this slot to stop at its next check
    pub fn abort(&self) {
        self.cancel.cancel()
    }

    /// Whether this slot counts against a concurrency bound
    pub fn is_bounded(&self) -> bool {
        self.permit.is_some()
    }
}
