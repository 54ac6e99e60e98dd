use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    err::ConfigurationError,
    orchestrator::{ExecutionLimits, Executor},
    reaper::Reaper,
    registry::{builtin_profiles, LanguageProfileConfig, LanguageRegistry},
    runner::{ContainerEngine, ContainerRunner, RunnerOptions, RunnerOptionsBuilder},
    workspace::WorkspaceManager,
};

/// Deployment configuration of the executor. Every field has a default, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Parent directory of all workspaces.
    pub scratch_root: PathBuf,

    pub max_concurrent_containers: usize,

    /// Ceiling on captured output per execution, in bytes.
    pub output_limit_bytes: usize,

    pub watchdog_grace_ms: u64,

    pub log_timeout_ms: u64,

    pub pids_limit: i64,

    /// Size of the in-container scratch filesystem, in megabytes.
    pub scratch_size_mb: u64,

    /// The CPU fraction a container may use. `None` leaves it unbounded.
    pub cpu_quota: Option<f64>,

    /// The user every container runs as, `uid:gid`. Empty keeps the image
    /// default.
    pub docker_user: String,

    pub max_memory_mb: u64,

    pub max_time_limit_secs: u64,

    pub reaper_interval_secs: u64,

    /// Workspaces and containers older than this are considered abandoned.
    pub workspace_max_age_secs: u64,

    /// Pull missing images when starting up.
    pub pull_images: bool,

    /// The language table. Empty means the builtin one.
    pub languages: Vec<LanguageProfileConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            scratch_root: std::env::temp_dir().join("sandrun"),
            max_concurrent_containers: 4,
            output_limit_bytes: 1024 * 1024,
            watchdog_grace_ms: 2000,
            log_timeout_ms: 10_000,
            pids_limit: 50,
            scratch_size_mb: 64,
            cpu_quota: None,
            docker_user: "65534:65534".into(),
            max_memory_mb: 2048,
            max_time_limit_secs: 60,
            reaper_interval_secs: 300,
            workspace_max_age_secs: 900,
            pull_images: false,
            languages: vec![],
        }
    }
}

impl ExecutorConfig {
    /// `<config dir>/sandrun/config.toml`, e.g. `~/.config/sandrun/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sandrun").join("config.toml"))
    }

    /// Load the configuration from `path`, or from [`Self::default_path`] if
    /// it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_owned(),
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(p) => p,
                None => {
                    tracing::debug!("No config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = Self::from_toml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        let mut builder = RunnerOptionsBuilder::default();
        builder
            .max_concurrent_containers(self.max_concurrent_containers)
            .output_limit(self.output_limit_bytes)
            .watchdog_grace(Duration::from_millis(self.watchdog_grace_ms))
            .log_timeout(Duration::from_millis(self.log_timeout_ms))
            .pids_limit(self.pids_limit)
            .scratch_size(self.scratch_size_mb.saturating_mul(1024 * 1024));
        if let Some(q) = self.cpu_quota {
            builder.cpu_quota(q);
        }
        if !self.docker_user.is_empty() {
            builder.docker_user(self.docker_user.clone());
        }
        builder.build().unwrap_or_default()
    }

    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            max_memory_mb: self.max_memory_mb,
            max_time_limit_secs: self.max_time_limit_secs,
        }
    }

    /// Build and validate the language table.
    pub fn registry(&self) -> Result<LanguageRegistry, ConfigurationError> {
        if self.languages.is_empty() {
            LanguageRegistry::from_profiles(builtin_profiles())
        } else {
            LanguageRegistry::from_profiles(self.languages.iter().cloned())
        }
    }

    /// Check the values that would only fail at run time otherwise.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.max_concurrent_containers > 0,
            "max_concurrent_containers must be positive"
        );
        anyhow::ensure!(self.pids_limit > 0, "pids_limit must be positive");
        anyhow::ensure!(self.output_limit_bytes > 0, "output_limit_bytes must be positive");
        if let Some(q) = self.cpu_quota {
            anyhow::ensure!(q > 0.0, "cpu_quota must be positive");
        }
        anyhow::ensure!(
            self.reaper_interval_secs > 0,
            "reaper_interval_secs must be positive"
        );
        let longest_run_ms = self
            .max_time_limit_secs
            .saturating_mul(1000)
            .saturating_add(self.watchdog_grace_ms)
            .saturating_add(self.log_timeout_ms);
        anyhow::ensure!(
            self.workspace_max_age_secs.saturating_mul(1000) > longest_run_ms,
            "workspace_max_age_secs must exceed the longest possible execution"
        );
        Ok(())
    }

    pub fn build_executor(&self, engine: Arc<dyn ContainerEngine>) -> anyhow::Result<Executor> {
        self.validate()?;
        let registry = self.registry()?;
        let workspaces = WorkspaceManager::new(&self.scratch_root).with_context(|| {
            format!(
                "Failed to set up scratch root {}",
                self.scratch_root.display()
            )
        })?;
        let runner = ContainerRunner::new(engine, self.runner_options());
        Ok(Executor::new(registry, workspaces, runner, self.limits()))
    }

    pub fn reaper(&self, engine: Arc<dyn ContainerEngine>) -> Reaper {
        Reaper::new(
            engine,
            self.scratch_root.clone(),
            Duration::from_secs(self.workspace_max_age_secs),
        )
    }

    /// Start the periodic reaper in the background. It sweeps every
    /// `reaper_interval_secs` until `cancel` fires.
    pub fn spawn_reaper(
        &self,
        engine: Arc<dyn ContainerEngine>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.reaper_interval_secs.max(1));
        tracing::debug!(?interval, "Starting reaper");
        self.reaper(engine).spawn(interval, cancel)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_config_is_default() {
        let cfg = ExecutorConfig::from_toml("").unwrap();
        assert_eq!(cfg.max_concurrent_containers, 4);
        assert_eq!(cfg.docker_user, "65534:65534");
        assert!(cfg.validate().is_ok());

        let opts = cfg.runner_options();
        assert_eq!(opts.output_limit, 1024 * 1024);
        assert_eq!(opts.watchdog_grace, Duration::from_secs(2));
        assert_eq!(opts.scratch_size, 64 * 1024 * 1024);
        assert_eq!(opts.docker_user.as_deref(), Some("65534:65534"));
        assert_eq!(opts.cpu_quota, None);

        let ids: Vec<_> = cfg
            .registry()
            .unwrap()
            .profiles()
            .iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(ids, vec!["cpp", "java", "javascript", "python"]);
    }

    #[test]
    fn test_custom_config() {
        let cfg = ExecutorConfig::from_toml(
            r#"
            max_concurrent_containers = 2
            cpu_quota = 0.5
            docker_user = ""

            [[languages]]
            id = "ruby"
            image = "ruby:3"
            extension = ".rb"
            command = "ruby /app/code/{filename}"
            "#,
        )
        .unwrap();

        let opts = cfg.runner_options();
        assert_eq!(opts.max_concurrent_containers, 2);
        assert_eq!(opts.cpu_quota, Some(0.5));
        assert_eq!(opts.docker_user, None);

        let registry = cfg.registry().unwrap();
        assert!(registry.lookup("ruby").is_ok());
        assert!(registry.lookup("python").is_err());
    }

    #[test]
    fn test_bad_language_table() {
        let cfg = ExecutorConfig::from_toml(
            r#"
            [[languages]]
            id = "ruby"
            image = "ruby:3"
            extension = ".rb"
            command = "ruby {file}"
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.registry(),
            Err(ConfigurationError::UnknownPlaceholder { .. })
        ));
    }

    #[test]
    fn test_max_age_must_cover_runs() {
        let cfg = ExecutorConfig {
            max_time_limit_secs: 600,
            workspace_max_age_secs: 300,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_huge_values_do_not_overflow() {
        let cfg = ExecutorConfig {
            max_time_limit_secs: u64::MAX,
            watchdog_grace_ms: u64::MAX,
            workspace_max_age_secs: u64::MAX,
            scratch_size_mb: u64::MAX,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.runner_options().scratch_size, u64::MAX);

        let cfg = ExecutorConfig {
            max_time_limit_secs: u64::MAX / 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_reaper_interval_must_be_positive() {
        let cfg = ExecutorConfig {
            reaper_interval_secs: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let res = ExecutorConfig::load(Some(&tmp.path().join("nope.toml")));
        assert!(res.is_err());
    }
}
