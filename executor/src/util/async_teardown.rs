use async_trait::async_trait;

/// Data structure that needs to be teared down asynchronously.
///
/// This trait is used in the place of `AsyncDrop`, which is unfortunately
/// not available for now. Callers are expected to `teardown()` every value
/// on every exit path. Implementations are idempotent and log errors instead
/// of returning them.
///
/// Types implementing `AsyncTeardown` also implement `Drop` as a last resort
/// for when the owning future is dropped before reaching `teardown()`.
#[async_trait]
pub trait AsyncTeardown: Send {
    async fn teardown(&mut self);

    /// Whether `teardown()` has already run.
    fn is_torn_down(&self) -> bool;
}
