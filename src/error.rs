//! Error types for the aggregation pipeline.
//!
//! Each stage fails with its own type so callers can tell which step broke.
//! `PipelineError` wraps them transparently; nothing here is retried.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StoreError;

/// Any failure that can escape a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    WorkspaceCreation(#[from] WorkspaceCreationError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    OutputConflict(#[from] OutputConflictError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

/// The scratch workspace could not be allocated.
#[derive(Debug, Error)]
#[error("Workspace: failed to create temporary workspace in {parent:?}")]
pub struct WorkspaceCreationError {
    pub parent: PathBuf,
    #[source]
    pub source: StoreError,
}

/// Spatial aggregation failed: unreadable input, bad geometry, or staging.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Join: failed to read {role} dataset {path:?}")]
    Unreadable {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Join: {role} feature {index} in {path:?} has no geometry")]
    MissingGeometry {
        role: &'static str,
        path: PathBuf,
        index: usize,
    },

    #[error("Join: {role} feature {index} in {path:?} is a {found}, expected {expected}")]
    UnexpectedGeometry {
        role: &'static str,
        path: PathBuf,
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Join: {role} feature {index} in {path:?} has invalid geometry: {reason}")]
    InvalidGeometry {
        role: &'static str,
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("Join: region attribute '{field}' collides with the generated count field")]
    CountFieldCollision { field: String },

    #[error("Join: failed to stage relation '{relation}' in the workspace")]
    Stage {
        relation: String,
        #[source]
        source: StoreError,
    },
}

/// The join result does not have the shape the field mapping expects.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Schema: field '{field}' not found (available: {available})")]
    MissingField { field: String, available: String },

    #[error("Schema: renaming '{source_field}' to '{field}' would duplicate an existing field")]
    DuplicateField { source_field: String, field: String },
}

/// The target relation already exists and the policy forbids replacing it.
#[derive(Debug, Error)]
#[error("Output: relation '{relation}' already exists in {store:?}")]
pub struct OutputConflictError {
    pub store: PathBuf,
    pub relation: String,
}

/// The output store could not be created, read or written.
#[derive(Debug, Error)]
#[error("Output: failed to materialize '{relation}' into {store:?}")]
pub struct OutputError {
    pub store: PathBuf,
    pub relation: String,
    #[source]
    pub source: StoreError,
}

/// Releasing the scratch workspace failed.
#[derive(Debug, Error)]
#[error("Cleanup: failed to release workspace {path:?}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: StoreError,
}
