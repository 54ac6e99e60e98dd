//! Running one submission inside one execution container.
//!
//! This module knows nothing about requests or validation. See
//! [`crate::orchestrator`] for the code that decides what to run.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    err::{Cancelled, EngineError},
    model::{ErrorKind, ExecutionResult},
    prelude::CancelFutureExt,
    registry::{LanguageProfile, TemplateArgs},
    util::{names::transform_string_as_docker_name, AsyncTeardown},
    workspace::Workspace,
};

pub mod container;
pub mod docker;
pub mod engine;
pub mod image;
pub mod model;
pub mod output;
mod util;

pub use container::ContainerHandle;
pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ManagedContainer};
pub use model::{ContainerSpec, MountSpec, ResourceLimits, RunnerOptions, RunnerOptionsBuilder};
pub use output::OutputBuffer;

use self::model::{
    BYTES_PER_MB, KILLED_EXIT_CODE, LABEL_MANAGED, LABEL_WORKSPACE, SCRATCH_MOUNT, SOURCE_MOUNT,
    TIMEOUT_EXIT_CODE,
};

/// Launches execution containers, at most `max_concurrent_containers` of them
/// at a time, and makes sure each one is gone afterwards.
pub struct ContainerRunner {
    engine: Arc<dyn ContainerEngine>,
    opts: RunnerOptions,
    slots: Arc<Semaphore>,
}

impl ContainerRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, opts: RunnerOptions) -> Self {
        let slots = Arc::new(Semaphore::new(opts.max_concurrent_containers.max(1)));
        ContainerRunner {
            engine,
            opts,
            slots,
        }
    }

    /// Number of containers that could be launched right now without waiting.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Build the container description for running `workspace` with
    /// `profile`. Limits must already be validated.
    pub fn container_spec(
        &self,
        workspace: &Workspace,
        profile: &LanguageProfile,
        memory_limit_mb: u64,
        time_limit_secs: u64,
    ) -> ContainerSpec {
        let resolved = profile.command.resolve(&TemplateArgs {
            filename: workspace.filename(),
            classname: workspace.stem(),
            time_limit_secs,
        });

        // `timeout` runs as pid 1 inside the container. It sends TERM when the
        // limit is hit and KILL one second later.
        let time_limit = time_limit_secs.to_string();
        let command = ["timeout", "-k", "1", &time_limit, "sh", "-c", &resolved]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_owned(), "true".to_owned());
        labels.insert(LABEL_WORKSPACE.to_owned(), workspace.id().to_owned());

        ContainerSpec {
            name: format!(
                "sandrun-{}-{}",
                transform_string_as_docker_name(&profile.id),
                workspace.id()
            ),
            image: profile.image.clone(),
            command,
            working_dir: SCRATCH_MOUNT.to_owned(),
            env: vec![
                ("HOME".to_owned(), SCRATCH_MOUNT.to_owned()),
                ("TMPDIR".to_owned(), SCRATCH_MOUNT.to_owned()),
            ],
            mounts: vec![
                MountSpec::ReadOnlyBind {
                    source: workspace.root().to_owned(),
                    target: SOURCE_MOUNT.to_owned(),
                },
                MountSpec::Scratch {
                    target: SCRATCH_MOUNT.to_owned(),
                    size_bytes: self.opts.scratch_size,
                },
            ],
            limits: ResourceLimits {
                memory_bytes: i64::try_from(memory_limit_mb)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(BYTES_PER_MB),
                pids_limit: self.opts.pids_limit,
                nano_cpus: self.opts.cpu_quota.map(|q| (q * 1e9) as i64),
            },
            user: self.opts.docker_user.clone(),
            labels,
        }
    }

    /// Reserve a container slot, waiting until one is free or `cancel`
    /// fires. Reserve before preparing anything the container needs, so
    /// nothing sits on disk while queued.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Slot, Cancelled> {
        match self.slots.clone().acquire_owned().with_cancel(cancel).await {
            Some(Ok(permit)) => Ok(Slot(permit)),
            Some(Err(e)) => {
                tracing::error!("Container slots are unavailable: {}", e);
                Err(Cancelled)
            }
            None => {
                tracing::debug!("Cancelled while waiting for a container slot");
                Err(Cancelled)
            }
        }
    }

    /// Run the workspace's source in a fresh container occupying `slot`, and
    /// collect what it printed.
    ///
    /// Infrastructure failures are reported inside the returned
    /// [`ExecutionResult`]. The only error is cancellation through `cancel`,
    /// after which the container is already removed. In every case the
    /// container is removed before `slot` is released.
    #[tracing::instrument(skip_all, fields(workspace = %workspace.id(), language = %profile.id))]
    pub async fn run(
        &self,
        slot: Slot,
        workspace: &Workspace,
        profile: &LanguageProfile,
        memory_limit_mb: u64,
        time_limit_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        let spec = self.container_spec(workspace, profile, memory_limit_mb, time_limit_secs);
        let started = Instant::now();
        let id = match self.engine.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(image = %spec.image, "Failed to create container: {}", e);
                return Ok(ExecutionResult::failed(
                    ErrorKind::ContainerCreateFailed,
                    started.elapsed(),
                ));
            }
        };
        tracing::debug!(container = %id, engine = %self.engine.name(), "Container created");

        let mut container = ContainerHandle::new(self.engine.clone(), id, slot);
        let res = self
            .supervise(&container, time_limit_secs, cancel, started)
            .await;
        container.teardown().await;

        if let Ok(res) = &res {
            tracing::info!(
                exit_code = ?res.exit_code,
                error_kind = ?res.error_kind,
                duration_ms = res.duration_ms,
                output_len = res.output.len(),
                truncated = res.truncated,
                "Execution finished"
            );
        }
        res
    }

    /// Attach to the container, start it and drain its output while waiting
    /// for it under the watchdog. Never removes the container.
    async fn supervise(
        &self,
        container: &ContainerHandle,
        time_limit_secs: u64,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<ExecutionResult, Cancelled> {
        let output = match self.engine.attach(container.id()).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(container = %container.id(), "Failed to attach to container: {}", e);
                return Ok(ExecutionResult::failed(
                    ErrorKind::RuntimeCommunicationFailure,
                    started.elapsed(),
                ));
            }
        };
        if let Err(e) = self.engine.start(container.id()).await {
            tracing::error!(container = %container.id(), "Failed to start container: {}", e);
            let kind = match e {
                EngineError::Connection(_) => ErrorKind::RuntimeCommunicationFailure,
                _ => ErrorKind::ContainerCreateFailed,
            };
            return Ok(ExecutionResult::failed(kind, started.elapsed()));
        }

        let time_limit = Duration::from_secs(time_limit_secs);
        let deadline = time_limit + self.opts.watchdog_grace;
        let mut buf = OutputBuffer::new(self.opts.output_limit);

        let (exit_code, error_kind, duration, logs_complete) = {
            let reading = read_output(output, &mut buf);
            tokio::pin!(reading);
            let waiting = tokio::time::timeout(deadline, self.engine.wait(container.id()))
                .with_cancel(cancel);
            tokio::pin!(waiting);

            let mut read = None;
            let waited = loop {
                tokio::select! {
                    waited = &mut waiting => break waited,
                    r = &mut reading, if read.is_none() => read = Some(r),
                }
            };

            let (exit_code, error_kind) = match waited {
                None => {
                    tracing::info!(container = %container.id(), "Execution cancelled");
                    container.kill().await;
                    return Err(Cancelled);
                }
                Some(Err(_)) => {
                    tracing::warn!(
                        container = %container.id(),
                        ?deadline,
                        "Container outlived its deadline, killing it"
                    );
                    container.kill().await;
                    (None, ErrorKind::TimedOut)
                }
                Some(Ok(Ok(code))) if code == TIMEOUT_EXIT_CODE => (Some(code), ErrorKind::TimedOut),
                // `timeout -k` escalated to SIGKILL on a program that ignored TERM
                Some(Ok(Ok(code))) if code == KILLED_EXIT_CODE && started.elapsed() >= time_limit => {
                    (Some(code), ErrorKind::TimedOut)
                }
                Some(Ok(Ok(code))) => (Some(code), ErrorKind::None),
                Some(Ok(Err(e))) => {
                    tracing::error!(container = %container.id(), "Lost track of container: {}", e);
                    container.kill().await;
                    return Ok(ExecutionResult::failed(
                        ErrorKind::RuntimeCommunicationFailure,
                        started.elapsed(),
                    ));
                }
            };
            let duration = started.elapsed();

            // the stream ends shortly after the container stops
            let read = match read {
                Some(r) => Some(r),
                None => tokio::time::timeout(self.opts.log_timeout, &mut reading)
                    .await
                    .ok(),
            };
            let logs_complete = match read {
                Some(Ok(())) => true,
                Some(Err(e)) => {
                    tracing::error!(container = %container.id(), "Failed to read container output: {}", e);
                    false
                }
                None => {
                    tracing::error!(container = %container.id(), "Timed out reading container output");
                    false
                }
            };
            (exit_code, error_kind, duration, logs_complete)
        };

        let (output, truncated) = buf.finish();
        let error_kind = match error_kind {
            ErrorKind::None if !logs_complete => ErrorKind::RuntimeCommunicationFailure,
            kind => kind,
        };

        Ok(ExecutionResult {
            exit_code,
            output,
            truncated,
            duration_ms: duration.as_millis() as u64,
            error_kind,
        })
    }
}

/// A reserved container slot, from [`ContainerRunner::acquire`]. The slot is
/// free again once this is dropped.
#[derive(Debug)]
pub struct Slot(OwnedSemaphorePermit);

/// Drain `output` into `buf`. Reading goes on past the ceiling so the
/// container never blocks on a full pipe.
async fn read_output(
    mut output: BoxStream<'static, Result<Bytes, EngineError>>,
    buf: &mut OutputBuffer,
) -> Result<(), EngineError> {
    while let Some(chunk) = output.next().await {
        let was_full = buf.is_oversized();
        buf.append(&chunk?);
        if !was_full && buf.is_oversized() {
            tracing::debug!("Output ceiling reached, discarding the rest");
        }
    }
    Ok(())
}
