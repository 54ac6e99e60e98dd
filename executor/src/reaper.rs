//! Removal of workspaces and containers left behind by a process that died
//! before it could clean up after itself.

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{err::EngineError, runner::ContainerEngine, util::names::is_workspace_id};

/// What a single sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub workspaces: usize,
    pub containers: usize,
}

/// Removes stale state older than `max_age`.
///
/// `max_age` must be well above the longest possible run (time limit plus
/// watchdog grace plus log collection), otherwise live executions get their
/// workspace pulled from under them.
#[derive(Clone)]
pub struct Reaper {
    engine: Arc<dyn ContainerEngine>,
    scratch_root: PathBuf,
    max_age: Duration,
}

impl Reaper {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        scratch_root: impl Into<PathBuf>,
        max_age: Duration,
    ) -> Self {
        Reaper {
            engine,
            scratch_root: scratch_root.into(),
            max_age,
        }
    }

    /// Run one pass over the scratch root and the engine. Errors are logged;
    /// whatever could be removed is counted.
    #[tracing::instrument(skip(self), fields(root = ?self.scratch_root))]
    pub async fn sweep(&self) -> ReapReport {
        let workspaces = match self.sweep_workspaces().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to scan scratch root: {}", e);
                0
            }
        };
        let containers = match self.sweep_containers().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to list managed containers: {}", e);
                0
            }
        };

        let report = ReapReport {
            workspaces,
            containers,
        };
        if report != ReapReport::default() {
            tracing::info!(?report, "Reaped stale executions");
        }
        report
    }

    async fn sweep_workspaces(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut dir = match tokio::fs::read_dir(&self.scratch_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        while let Some(entry) = dir.next_entry().await? {
            // Never touch anything this crate did not create.
            if !entry.file_name().to_str().map_or(false, is_workspace_id) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }

            let path = entry.path();
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    tracing::debug!(?path, ?age, "Removed stale workspace");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(?path, "Failed to remove stale workspace: {}", e),
            }
        }
        Ok(removed)
    }

    async fn sweep_containers(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut removed = 0;
        for container in self.engine.list_managed().await? {
            // creation times in the future count as fresh
            let age = now
                .signed_duration_since(container.created_at)
                .to_std()
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }
            match self.engine.remove(&container.id).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {
                    tracing::debug!(container = %container.id, "Removed stale container");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(container = %container.id, "Failed to remove stale container: {}", e)
                }
            }
        }
        Ok(removed)
    }

    /// Sweep every `interval` until `cancel` fires. The first sweep happens
    /// right away.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                self.sweep().await;
            }
            tracing::debug!("Reaper stopped");
        })
    }
}
