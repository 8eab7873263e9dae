//! Resumable workflow state (`.sdlc/workflow-state.json`).
//!
//! A run records each story that finished so `sdlc run --resume` can pick up
//! where an interrupted run stopped.

use crate::errors::WorkflowStateError;
use crate::story::store::write_atomically;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATE_VERSION: &str = "1.0";

const REQUIRED_FIELDS: [&str; 6] = [
    "version",
    "workflowId",
    "timestamp",
    "currentAction",
    "completedActions",
    "context",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub sdlc_root: PathBuf,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub version: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_action: Option<String>,
    pub completed_actions: Vec<String>,
    pub context: WorkflowContext,
}

impl WorkflowState {
    pub fn new(sdlc_root: impl Into<PathBuf>, options: serde_json::Value) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            workflow_id: generate_workflow_id(),
            timestamp: Utc::now(),
            current_action: None,
            completed_actions: Vec::new(),
            context: WorkflowContext {
                sdlc_root: sdlc_root.into(),
                options,
            },
        }
    }

    pub fn start_action(&mut self, action: &str) {
        self.current_action = Some(action.to_string());
        self.timestamp = Utc::now();
    }

    /// Record `action` as done. Recording the same action twice is a no-op.
    pub fn mark_action_complete(&mut self, action: &str) {
        if !self.is_complete(action) {
            self.completed_actions.push(action.to_string());
        }
        if self.current_action.as_deref() == Some(action) {
            self.current_action = None;
        }
        self.timestamp = Utc::now();
    }

    pub fn is_complete(&self, action: &str) -> bool {
        self.completed_actions.iter().any(|a| a == action)
    }
}

/// `workflow-<epoch millis>-<8 hex chars>`
pub fn generate_workflow_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("workflow-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

pub fn save(path: &Path, state: &WorkflowState) -> Result<(), WorkflowStateError> {
    let io_err = |source| WorkflowStateError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| io_err(std::io::Error::other(e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    write_atomically(path, &json).map_err(io_err)?;
    debug!(path = %path.display(), workflow_id = %state.workflow_id, "Saved workflow state");
    Ok(())
}

/// Load the state file. `Ok(None)` when there is none.
///
/// Unparseable JSON is `Corrupted`; parseable JSON missing a required field
/// (or with a non-array `completedActions`) is `Invalid`. A different
/// `version` is accepted with a warning.
pub fn load(path: &Path) -> Result<Option<WorkflowState>, WorkflowStateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(WorkflowStateError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| WorkflowStateError::Corrupted {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    let invalid = |message: String| WorkflowStateError::Invalid {
        path: path.to_path_buf(),
        message,
    };
    let object = value
        .as_object()
        .ok_or_else(|| invalid("expected a JSON object".to_string()))?;
    if let Some(missing) = REQUIRED_FIELDS.iter().find(|f| !object.contains_key(**f)) {
        return Err(invalid(format!("missing required field '{}'", missing)));
    }
    if !object["completedActions"].is_array() {
        return Err(invalid("'completedActions' must be an array".to_string()));
    }

    let state: WorkflowState =
        serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;
    if state.version != STATE_VERSION {
        warn!(
            found = %state.version,
            expected = STATE_VERSION,
            "Workflow state version mismatch, loading anyway"
        );
    }
    Ok(Some(state))
}

/// Remove the state file if present.
pub fn clear(path: &Path) -> Result<(), WorkflowStateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkflowStateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
