use derive_builder::Builder;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where the workspace is mounted (read-only) inside the container.
pub const SOURCE_MOUNT: &str = "/app/code";
/// Where the writable, exec-capable scratch filesystem is mounted.
pub const SCRATCH_MOUNT: &str = "/scratch";

/// Label put on every container this crate creates.
pub const LABEL_MANAGED: &str = "io.sandrun.managed";
/// Label holding the id of the workspace a container belongs to.
pub const LABEL_WORKSPACE: &str = "io.sandrun.workspace";

/// Exit code of coreutils `timeout` when the time limit was hit.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Exit code of a process ended by SIGKILL, e.g. by `timeout -k` when the
/// program ignored the first signal.
pub const KILLED_EXIT_CODE: i64 = 128 + 9;

pub const BYTES_PER_MB: i64 = 1024 * 1024;

/// A filesystem mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// A host directory, always mounted read-only.
    ReadOnlyBind { source: PathBuf, target: String },
    /// A size-bounded in-memory filesystem, writable and executable, that
    /// vanishes together with the container.
    Scratch { target: String, size_bytes: u64 },
}

/// Resource ceilings of one container. None of them is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory (and memory + swap) ceiling in bytes.
    pub memory_bytes: i64,
    /// Maximum number of processes/threads alive at once.
    pub pids_limit: i64,
    /// CPU ceiling in units of 1e-9 CPUs.
    pub nano_cpus: Option<i64>,
}

/// Everything the engine needs to create one execution container.
///
/// Network access and root filesystem writes are not part of a `ContainerSpec`: every
/// engine must always disable both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, for humans reading `docker ps`.
    pub name: String,
    pub image: String,
    /// Full argv, executed without a shell in front of it.
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub limits: ResourceLimits,
    /// The user to run as, `uid:gid`. `None` keeps the image default.
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// The host directory bound read-only into the container, if any.
    pub fn source_dir(&self) -> Option<&std::path::Path> {
        self.mounts.iter().find_map(|m| match m {
            MountSpec::ReadOnlyBind { source, .. } => Some(source.as_path()),
            _ => None,
        })
    }
}

/// Knobs of the [`super::ContainerRunner`].
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct RunnerOptions {
    /// Maximum number of containers alive at the same time.
    #[builder(default = "4")]
    pub max_concurrent_containers: usize,

    /// Ceiling on captured output, in bytes.
    #[builder(default = "1024 * 1024")]
    pub output_limit: usize,

    /// Extra wall time granted on top of the time limit before the watchdog
    /// kills the container.
    #[builder(default = "Duration::from_secs(2)")]
    pub watchdog_grace: Duration,

    /// How long reading the logs of an exited container may take.
    #[builder(default = "Duration::from_secs(10)")]
    pub log_timeout: Duration,

    #[builder(default = "50")]
    pub pids_limit: i64,

    /// Size of the scratch filesystem, in bytes.
    #[builder(default = "64 * 1024 * 1024")]
    pub scratch_size: u64,

    /// The CPU fraction allowed to use
    #[builder(default, setter(strip_option))]
    pub cpu_quota: Option<f64>,

    /// The user every container should run as
    #[builder(default, setter(strip_option))]
    pub docker_user: Option<String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptionsBuilder::default()
            .build()
            .expect("every runner option has a default")
    }
}
