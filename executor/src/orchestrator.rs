//! The single entry point for running a submission.

use tokio_util::sync::CancellationToken;

use crate::{
    err::{ExecuteError, ValidationError},
    model::{ExecutionResult, SubmissionRequest},
    registry::LanguageRegistry,
    runner::ContainerRunner,
    util::AsyncTeardown,
    workspace::{check_filename, WorkspaceManager},
};

/// Upper bounds on what a single submission may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_memory_mb: u64,
    pub max_time_limit_secs: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        ExecutionLimits {
            max_memory_mb: 2048,
            max_time_limit_secs: 60,
        }
    }
}

/// Validates submissions and drives them through workspace creation,
/// container execution and cleanup.
///
/// `Executor` is shared between concurrent callers; all of its state is
/// either immutable or owned by the runner's semaphore.
pub struct Executor {
    registry: LanguageRegistry,
    workspaces: WorkspaceManager,
    runner: ContainerRunner,
    limits: ExecutionLimits,
}

impl Executor {
    pub fn new(
        registry: LanguageRegistry,
        workspaces: WorkspaceManager,
        runner: ContainerRunner,
        limits: ExecutionLimits,
    ) -> Self {
        Executor {
            registry,
            workspaces,
            runner,
            limits,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &ContainerRunner {
        &self.runner
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Check the shape of a request. Filename checks that depend on the
    /// language happen at workspace creation.
    pub fn validate(&self, req: &SubmissionRequest) -> Result<(), ValidationError> {
        if req.language.is_empty() {
            return Err(ValidationError::MissingField("language"));
        }
        if req.filename.is_empty() {
            return Err(ValidationError::MissingField("filename"));
        }
        check_limit("memory_limit_mb", req.memory_limit_mb, self.limits.max_memory_mb)?;
        check_limit(
            "time_limit_secs",
            req.time_limit_secs,
            self.limits.max_time_limit_secs,
        )?;
        Ok(())
    }

    /// Run `req` to completion.
    ///
    /// `Err` means the submission was rejected before anything ran.
    /// Infrastructure failures during the run are reported through
    /// [`ExecutionResult::error_kind`].
    pub async fn execute(&self, req: SubmissionRequest) -> Result<ExecutionResult, ExecuteError> {
        self.execute_with_cancel(req, CancellationToken::new()).await
    }

    /// Like [`Executor::execute`], but gives up as soon as `cancel` fires.
    /// Both the container and the workspace are gone by the time
    /// [`ExecuteError::Cancelled`] is returned.
    #[tracing::instrument(
        skip_all,
        fields(language = %req.language, memory_mb = req.memory_limit_mb, time_secs = req.time_limit_secs)
    )]
    pub async fn execute_with_cancel(
        &self,
        req: SubmissionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        if let Err(e) = self.validate(&req) {
            tracing::info!("Rejected submission: {}", e);
            return Err(e.into());
        }
        let profile = self.registry.lookup(&req.language)?;
        if let Err(e) = check_filename(&req.filename, &profile) {
            tracing::info!("Rejected submission: {}", e);
            return Err(e.into());
        }

        // Queued submissions hold nothing on disk, so the reaper cannot
        // mistake a long wait for an abandoned workspace.
        let slot = self.runner.acquire(&cancel).await?;
        let mut workspace = match self.workspaces.create(&req, &profile).await {
            Ok(w) => w,
            Err(e) => {
                tracing::info!("Failed to create workspace: {}", e);
                return Err(e.into());
            }
        };

        let res = self
            .runner
            .run(
                slot,
                &workspace,
                &profile,
                req.memory_limit_mb,
                req.time_limit_secs,
                &cancel,
            )
            .await;
        workspace.teardown().await;

        Ok(res?)
    }
}

fn check_limit(field: &'static str, got: u64, max: u64) -> Result<(), ValidationError> {
    if got == 0 {
        return Err(ValidationError::NonPositiveLimit(field));
    }
    if got > max {
        return Err(ValidationError::LimitTooLarge { field, got, max });
    }
    Ok(())
}
