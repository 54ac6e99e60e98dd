//! Per-submission scratch directories on the host.
//!
//! Every submission gets a fresh directory under the scratch root, named by
//! a random id that has nothing to do with user input. The directory holds
//! exactly one file, the submitted source, and is bound read-only into the
//! execution container.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use path_absolutize::Absolutize;
use scopeguard::ScopeGuard;
use tokio::io::AsyncWriteExt;

use crate::{
    err::{ValidationError, WorkspaceError},
    model::SubmissionRequest,
    registry::LanguageProfile,
    util::{
        names::random_workspace_id,
        path_security::{enforce_single_component, is_valid_class_name},
        AsyncTeardown,
    },
};

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    scratch_root: PathBuf,
}

impl WorkspaceManager {
    /// Use (and create if needed) `scratch_root` as the parent of all
    /// workspaces. Relative paths are resolved against the current directory,
    /// since the engine needs absolute bind-mount sources.
    ///
    /// A root created here is made private to the current user. An existing
    /// directory keeps its permissions.
    pub fn new(scratch_root: impl AsRef<Path>) -> io::Result<Self> {
        let scratch_root = scratch_root.as_ref().absolutize()?.into_owned();
        if let Some(parent) = scratch_root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::create_dir(&scratch_root) {
            Ok(()) => restrict_to_owner(&scratch_root)?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && scratch_root.is_dir() => {
                tracing::debug!(root = ?scratch_root, "Using existing scratch root");
            }
            Err(e) => return Err(e),
        }
        Ok(WorkspaceManager { scratch_root })
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Validate the submitted file name against `profile` and materialize the
    /// source in a new workspace.
    ///
    /// Nothing is written to disk unless every check passes.
    #[tracing::instrument(skip_all, fields(language = %profile.id))]
    pub async fn create(
        &self,
        req: &SubmissionRequest,
        profile: &LanguageProfile,
    ) -> Result<Workspace, WorkspaceError> {
        let (filename, stem) = check_filename(&req.filename, profile)?;

        let id = random_workspace_id();
        let root = self.scratch_root.join(&id);
        // `create_dir` fails on an existing directory, so two submissions can
        // never end up sharing one.
        tokio::fs::create_dir(&root).await?;
        let root = scopeguard::guard(root, |root| {
            if let Err(e) = std::fs::remove_dir_all(&root) {
                tracing::error!("Failed to remove half-created workspace {:?}: {}", root, e);
            }
        });

        let source_path = root.join(&filename);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&source_path)
            .await?;
        file.write_all(&req.source).await?;
        file.flush().await?;
        drop(file);
        open_for_container(&root, &source_path).await?;

        let root = ScopeGuard::into_inner(root);
        tracing::debug!(workspace = %id, bytes = req.source.len(), "Workspace created");

        Ok(Workspace {
            id,
            root,
            source_path,
            filename,
            stem,
            created_at: Utc::now(),
            destroyed: false,
        })
    }
}

/// Returns the file name and its stem if `filename` is acceptable for
/// `profile`.
pub fn check_filename(
    filename: &str,
    profile: &LanguageProfile,
) -> Result<(String, String), ValidationError> {
    enforce_single_component(filename)?;

    let path = Path::new(filename);
    let extension = path.extension().and_then(|e| e.to_str());
    if extension.map(|e| format!(".{}", e)).as_deref() != Some(profile.extension.as_str()) {
        return Err(ValidationError::InvalidExtension {
            language: profile.id.clone(),
            expected: profile.extension.clone(),
            filename: filename.to_owned(),
        });
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_owned();
    if profile.needs_class_name() && !is_valid_class_name(&stem) {
        return Err(ValidationError::InvalidClassName(stem));
    }

    Ok((filename.to_owned(), stem))
}

#[cfg(unix)]
fn restrict_to_owner(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_to_owner(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Containers may run as an unprivileged user, which must be able to read
/// the source. Nobody may write to it.
#[cfg(unix)]
async fn open_for_container(root: &Path, source: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(source, std::fs::Permissions::from_mode(0o444)).await?;
    tokio::fs::set_permissions(root, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn open_for_container(_root: &Path, _source: &Path) -> io::Result<()> {
    Ok(())
}

/// The scratch directory of one submission.
///
/// Call [`Workspace::destroy`] (or `teardown()`) on every exit path. If the
/// owning future is dropped first, `Drop` removes the directory
/// synchronously.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    source_path: PathBuf,
    filename: String,
    stem: String,
    created_at: DateTime<Utc>,
    destroyed: bool,
}

impl Workspace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The file name without its extension.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Recursively remove the workspace. Idempotent.
    pub async fn destroy(&mut self) {
        self.teardown().await
    }
}

#[async_trait]
impl AsyncTeardown for Workspace {
    async fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => tracing::debug!(workspace = %self.id, "Workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(workspace = %self.id, "Failed to remove workspace: {}", e),
        }
    }

    fn is_torn_down(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        tracing::warn!(workspace = %self.id, "Workspace dropped before teardown, removing it now");
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(workspace = %self.id, "Failed to remove workspace: {}", e),
        }
    }
}
