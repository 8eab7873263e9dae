//! Execution state and per-story results for the orchestrator.

use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

/// Lifecycle of one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Not started
    #[default]
    Idle,
    /// Executing phases
    Running,
    /// Shutdown requested; no new workers are spawned
    Draining,
    /// Every phase ran (or the failure policy stopped early)
    Completed,
    /// Stopped by `shutdown()`
    Shutdown,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Shutdown)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Outcome of one story worker process.
///
/// The exit status decides `success`; a `complete` IPC payload only adds data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessResult {
    pub story_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Payload of the worker's `complete` message, if it sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ChildProcessResult {
    /// Build a result from a process exit status.
    pub fn from_exit(story_id: &str, status: ExitStatus, duration: Duration) -> Self {
        use std::os::unix::process::ExitStatusExt;

        let signal = status.signal();
        let error = if status.success() {
            None
        } else if let Some(sig) = signal {
            Some(format!("worker terminated by signal {}", sig))
        } else {
            Some(format!(
                "worker exited with code {}",
                status.code().unwrap_or(-1)
            ))
        };
        Self {
            story_id: story_id.to_string(),
            success: status.success(),
            exit_code: status.code(),
            signal,
            payload: None,
            error,
            duration,
        }
    }

    /// A story that failed before or outside its worker process.
    pub fn failure(story_id: &str, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            story_id: story_id.to_string(),
            success: false,
            exit_code: None,
            signal: None,
            payload: None,
            error: Some(error.into()),
            duration,
        }
    }

    pub fn with_payload(mut self, payload: Option<serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Mark as failed even if the process exited cleanly.
    pub fn fail_with(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Results of one execution phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub index: usize,
    pub results: Vec<ChildProcessResult>,
}

impl PhaseSummary {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            results: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }
}

/// Summary of a whole `execute` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_items: usize,
    pub phases: Vec<PhaseSummary>,
    /// Items never started (later phases after an abort, or after shutdown).
    #[serde(default)]
    pub skipped: Vec<String>,
    pub state: OrchestratorState,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ExecutionSummary {
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            ..Default::default()
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &ChildProcessResult> {
        self.phases.iter().flat_map(|p| p.results.iter())
    }

    pub fn succeeded(&self) -> usize {
        self.phases.iter().map(PhaseSummary::succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.phases.iter().map(PhaseSummary::failed).sum()
    }

    pub fn all_success(&self) -> bool {
        self.failed() == 0 && self.succeeded() == self.total_items
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
