use std::sync::Arc;

use async_trait::async_trait;

use crate::{err::EngineError, util::AsyncTeardown};

use super::{engine::ContainerEngine, Slot};

/// An execution container that exists on the engine, together with the
/// concurrency slot it occupies.
///
/// `teardown()` must be called before dropping. If the owning future is
/// dropped instead (e.g. the caller went away), `Drop` schedules the removal
/// on the current runtime; a container that even that misses is picked up by
/// the reaper through its labels. Either way the slot is released only after
/// the removal attempt.
pub struct ContainerHandle {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    slot: Option<Slot>,
    removed: bool,
}

impl ContainerHandle {
    pub fn new(engine: Arc<dyn ContainerEngine>, id: String, slot: Slot) -> Self {
        ContainerHandle {
            engine,
            id,
            slot: Some(slot),
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Force-stop the container. Failures are logged; removal still follows.
    pub async fn kill(&self) {
        match self.engine.kill(&self.id).await {
            Ok(()) => tracing::debug!(container = %self.id, "Container killed"),
            // already exited or gone, which is what we wanted anyway
            Err(EngineError::NotFound(_)) | Err(EngineError::Rejected { status: 409, .. }) => {}
            Err(e) => tracing::warn!(container = %self.id, "Failed to kill container: {}", e),
        }
    }
}

#[async_trait]
impl AsyncTeardown for ContainerHandle {
    async fn teardown(&mut self) {
        if self.removed {
            return;
        }
        // Removal is attempted exactly once, whatever its outcome.
        self.removed = true;
        match self.engine.remove(&self.id).await {
            Ok(()) => tracing::debug!(container = %self.id, "Container removed"),
            Err(EngineError::NotFound(_)) => {
                tracing::debug!(container = %self.id, "Container was already gone")
            }
            Err(e) => tracing::error!(container = %self.id, "Failed to remove container: {}", e),
        }
        drop(self.slot.take());
    }

    fn is_torn_down(&self) -> bool {
        self.removed
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        let engine = self.engine.clone();
        let id = std::mem::take(&mut self.id);
        let slot = self.slot.take();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                tracing::warn!(container = %id, "Container dropped before teardown, removing it in background");
                rt.spawn(async move {
                    if let Err(e) = engine.remove(&id).await {
                        tracing::error!(container = %id, "Failed to remove container: {}", e);
                    }
                    drop(slot);
                });
            }
            Err(_) => {
                tracing::error!(container = %id, "Container dropped outside of a runtime, leaving it to the reaper")
            }
        }
    }
}
