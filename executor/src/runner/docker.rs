//! [`ContainerEngine`] backed by a Docker daemon.

use std::{borrow::Cow, collections::HashMap};

use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, Config, CreateContainerOptions, KillContainerOptions,
        ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, HostConfigLogConfig, Mount, MountTypeEnum},
    Docker,
};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures::{future, stream::BoxStream, StreamExt};

use crate::err::EngineError;

use super::{
    engine::{ContainerEngine, ManagedContainer},
    model::{ContainerSpec, MountSpec, LABEL_MANAGED},
    util::is_recoverable_error,
};

#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        DockerEngine { docker }
    }

    /// Connect to the local daemon the same way the `docker` CLI does.
    pub fn connect_with_local_defaults() -> Result<Self, EngineError> {
        Ok(DockerEngine::new(Docker::connect_with_local_defaults()?))
    }
}

/// Translate a [`ContainerSpec`] into Docker's create-container body.
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut mounts = vec![];
    let mut tmpfs = HashMap::new();
    for mount in &spec.mounts {
        match mount {
            MountSpec::ReadOnlyBind { source, target } => mounts.push(Mount {
                target: Some(target.clone()),
                source: Some(source.display().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            }),
            MountSpec::Scratch { target, size_bytes } => {
                tmpfs.insert(
                    target.clone(),
                    format!("rw,exec,nosuid,nodev,size={},mode=1777", size_bytes),
                );
            }
        }
    }

    let mut labels = spec.labels.clone();
    labels.insert(LABEL_MANAGED.into(), "true".into());

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        working_dir: Some(spec.working_dir.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
        ),
        // set docker user
        user: spec.user.clone(),
        labels: Some(labels),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        // keep stdout and stderr as separate frames in the log stream
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            mounts: Some(mounts),
            tmpfs: Some(tmpfs),
            // set memory limits, no swap on top
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_bytes),
            pids_limit: Some(spec.limits.pids_limit),
            // set cpu limits
            nano_cpus: spec.limits.nano_cpus,
            network_mode: Some("none".into()),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".into()]),
            security_opt: Some(vec!["no-new-privileges".into()]),
            // output is read through attach, so the daemon stores none of it
            log_config: Some(HostConfigLogConfig {
                typ: Some("none".into()),
                config: None,
            }),
            // removal is ours
            auto_remove: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> Cow<'static, str> {
        "docker".into()
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await.map_err(EngineError::from) {
            Ok(_) => return Ok(()),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(image, "Pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(info) = pull.next().await {
            match info {
                Ok(_) => {}
                Err(e) if is_recoverable_error(&e) => {
                    tracing::debug!(image, "Ignoring malformed pull progress: {}", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let res = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await?;
        for warning in &res.warnings {
            tracing::warn!(container = %res.id, "Docker: {}", warning);
        }
        Ok(res.id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, EngineError> {
        let mut wait = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match wait.next().await {
            Some(Ok(res)) => Ok(res.status_code),
            // bollard reports non-zero exit codes as errors
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Connection(
                "wait stream ended without an exit status".into(),
            )),
        }
    }

    async fn attach(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError> {
        let attached = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(attached
            .output
            .filter_map(|item| {
                future::ready(match item {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => Some(Ok(message)),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) if is_recoverable_error(&e) => {
                        tracing::debug!("Skipping malformed log frame: {}", e);
                        None
                    }
                    Err(e) => Some(Err(e.into())),
                })
            })
            .boxed())
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                Some(ManagedContainer {
                    id: s.id?,
                    created_at: Utc.timestamp_opt(s.created?, 0).single()?,
                })
            })
            .collect())
    }
}
