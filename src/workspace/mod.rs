//! Scratch workspaces for intermediate relations.
//!
//! A workspace is a uniquely named temporary directory holding one feature
//! store. `CleanupGuard` owns it for the length of a run and releases it on
//! every exit path: explicitly through `release`, or from `Drop` when the
//! body unwinds.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::{CleanupError, PipelineError, WorkspaceCreationError};
use crate::storage::{FeatureStore, StoreError};

pub const WORKSPACE_PREFIX: &str = "tractcount-";
pub const SCRATCH_STORE: &str = "scratch.store";

#[derive(Clone, Debug, Default)]
pub struct WorkspaceProvisioner {
    parent: Option<PathBuf>,
}

impl WorkspaceProvisioner {
    /// Provisions under the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions under `parent` instead of the system temp directory.
    pub fn in_dir(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: Some(parent.into()),
        }
    }

    pub fn provision(&self) -> Result<TemporaryWorkspace, WorkspaceCreationError> {
        let parent = self.parent.clone().unwrap_or_else(std::env::temp_dir);
        let failed = |source| WorkspaceCreationError {
            parent: parent.clone(),
            source,
        };

        let backing = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&parent)
            .map_err(|err| failed(StoreError::io(&parent)(err)))?;
        // On failure `backing` drops here and removes the directory.
        let store = FeatureStore::create(&backing.path().join(SCRATCH_STORE)).map_err(failed)?;

        tracing::debug!("Workspace: provisioned {:?}", backing.path());
        Ok(TemporaryWorkspace {
            backing,
            store,
            released: false,
        })
    }
}

pub struct TemporaryWorkspace {
    backing: TempDir,
    store: FeatureStore,
    released: bool,
}

impl TemporaryWorkspace {
    /// Backing directory of this workspace.
    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut FeatureStore {
        &mut self.store
    }

    /// Deletes the scratch store, then the backing directory tree.
    ///
    /// The store goes first so its lock and manifest are gone before the tree
    /// is removed. Anything already missing is ignored. Both steps always run;
    /// the first failure is returned. Calling this again is a no-op.
    fn release_in_place(&mut self) -> Result<(), CleanupError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let path = self.backing.path().to_path_buf();
        let store_result = self.store.destroy();

        let tree_result = match std::fs::remove_dir_all(&path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(StoreError::io(&path)(err)),
            _ => Ok(()),
        };

        match (store_result, tree_result) {
            (Ok(()), Ok(())) => {
                tracing::debug!("Workspace: released {:?}", path);
                Ok(())
            }
            (Err(source), tree) => {
                if let Err(err) = tree {
                    tracing::warn!("Workspace: {}", err);
                }
                Err(CleanupError { path, source })
            }
            (Ok(()), Err(source)) => Err(CleanupError { path, source }),
        }
    }
}

/// Owns a workspace for one run and guarantees its release.
pub struct CleanupGuard {
    workspace: TemporaryWorkspace,
}

impl CleanupGuard {
    pub fn acquire(provisioner: &WorkspaceProvisioner) -> Result<Self, WorkspaceCreationError> {
        Ok(Self {
            workspace: provisioner.provision()?,
        })
    }

    pub fn workspace(&mut self) -> &mut TemporaryWorkspace {
        &mut self.workspace
    }

    pub fn release(mut self) -> Result<(), CleanupError> {
        self.workspace.release_in_place()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Err(err) = self.workspace.release_in_place() {
            tracing::error!("Workspace: cleanup on drop failed: {:#}", anyhow::Error::new(err));
        }
    }
}

/// Runs `body` inside a fresh workspace and releases it afterwards.
///
/// If provisioning fails nothing is cleaned up. An error from `body` is
/// returned unchanged even when cleanup also fails; the cleanup failure is
/// only logged in that case. A cleanup failure after a successful body
/// becomes the result.
pub fn scoped<T, F>(provisioner: &WorkspaceProvisioner, body: F) -> Result<T, PipelineError>
where
    F: FnOnce(&mut TemporaryWorkspace) -> Result<T, PipelineError>,
{
    let mut guard = CleanupGuard::acquire(provisioner)?;
    let outcome = body(guard.workspace());
    let released = guard.release();

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup.into()),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup)) => {
            tracing::error!(
                "Workspace: {:#} (while propagating: {})",
                anyhow::Error::new(cleanup),
                err
            );
            Err(err)
        }
    }
}
