//! Typed error hierarchy for the sdlc orchestrator.
//!
//! One enum per subsystem boundary:
//! - `DependencyError`: malformed work-item graphs (validation, never retried)
//! - `WorktreeError`: workspace isolation failures
//! - `LockError` / `StoryError`: persisted story state and its lock discipline
//! - `WorkflowStateError`: the resumable workflow-state file
//! - `ProcessError`: spawning and talking to story workers

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving work items into execution phases.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Duplicate work item id: {item}")]
    DuplicateItem { item: String },

    #[error("Circular dependency: work item '{item}' depends on itself")]
    SelfDependency { item: String },

    #[error("Missing dependency: work item '{item}' depends on '{dependency}', which does not exist")]
    MissingDependency { item: String, dependency: String },

    #[error("Circular dependency detected: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
}

impl DependencyError {
    /// Whether this error describes a cycle, including the one-node cycle of
    /// a self-dependency.
    pub fn is_circular(&self) -> bool {
        matches!(
            self,
            Self::SelfDependency { .. } | Self::CircularDependency { .. }
        )
    }
}

/// Errors from the worktree isolation service.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Worktree path already exists and is not empty: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("Worktree has uncommitted changes: {path}")]
    Dirty { path: PathBuf },

    #[error("Worktree not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Path is outside the worktree base path: {path}")]
    OutsideBasePath { path: PathBuf },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from acquiring a story lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("{path} is locked by another process (waited {waited:?})")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Lock I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the story store.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("Story {id} not found")]
    NotFound { id: String },

    #[error("Story {id} already exists")]
    AlreadyExists { id: String },

    #[error("Invalid story id '{id}'")]
    InvalidId { id: String },

    #[error("Failed to parse story file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Story I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from loading or saving the workflow-state file.
#[derive(Debug, Error)]
pub enum WorkflowStateError {
    #[error("Workflow state file is corrupted ({path}): {message}")]
    Corrupted { path: PathBuf, message: String },

    #[error("Invalid state file ({path}): {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("Workflow state I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from spawning and supervising story worker processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn worker for story {story_id}: {source}")]
    SpawnFailed {
        story_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare workspace for story {story_id}: {source}")]
    Workspace {
        story_id: String,
        #[source]
        source: WorktreeError,
    },

    #[error("IPC failure for story {story_id}: {message}")]
    Ipc { story_id: String, message: String },

    #[error(transparent)]
    Dependency(#[from] DependencyError),
}
