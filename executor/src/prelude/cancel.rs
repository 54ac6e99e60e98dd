use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Race a future against a cancellation token.
#[async_trait]
pub trait CancelFutureExt: Future + Sized + Send {
    /// Resolves to `Some(output)` if the future finished first, or `None` if
    /// `token` was cancelled first. When both are ready, cancellation wins.
    async fn with_cancel(self, token: &CancellationToken) -> Option<Self::Output>;
}

#[async_trait]
impl<F> CancelFutureExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    async fn with_cancel(self, token: &CancellationToken) -> Option<Self::Output> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = self => Some(output),
        }
    }
}
