use std::borrow::Cow;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::err::EngineError;

use super::model::ContainerSpec;

/// A container left on the engine by this crate, as seen by the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Some kind of container engine that can run execution containers.
///
/// Implementations are injected into the runner as `Arc<dyn ContainerEngine>`
/// so tests can swap in a fake one.
#[async_trait]
pub trait ContainerEngine: Sync + Send {
    /// The name of this engine, used in logs
    fn name(&self) -> Cow<'static, str>;

    /// Make sure `image` is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create (but do not start) a container. Returns its id.
    ///
    /// The container must have networking disabled and a read-only root
    /// filesystem, whatever `spec` says.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, EngineError>;

    /// Attach to the combined stdout & stderr of a created container, in
    /// arrival order. Call this before `start` so nothing is missed; the
    /// stream ends once the container stops. Engines must not keep a log of
    /// their own, since output is only ever bounded by the reader.
    async fn attach(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError>;

    /// Force-stop a running container.
    async fn kill(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a container, killing it first if it still runs.
    async fn remove(&self, id: &str) -> Result<(), EngineError>;

    /// All containers carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError>;
}
