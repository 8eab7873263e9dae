//! Concurrency-limited execution of story workers.
//!
//! Phases run strictly in order. Within a phase up to `concurrency` workers
//! run at once; when one closes, the next queued item of the same phase is
//! spawned. Each worker is an OS process with its own workspace, so a crash
//! only fails its own item.

use crate::config::{FailurePolicy, IsolationMode, STORY_ID_PLACEHOLDER};
use crate::dag::{WorkItem, resolve_phases};
use crate::errors::{ProcessError, WorktreeError};
use crate::process::ipc::{DecodedLine, IpcMessage, IpcMessageType, decode_line};
use crate::process::manager::{ProcessManager, Signal};
use crate::process::result::{
    ChildProcessResult, ExecutionSummary, ExecutionTimer, OrchestratorState, PhaseSummary,
};
use crate::worktree::{WorktreeService, slugify};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Events emitted while executing. Sent on a non-blocking channel; scheduling
/// never waits on the receiver.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PhaseStarted {
        index: usize,
        items: Vec<String>,
    },
    Spawned {
        story_id: String,
        pid: Option<u32>,
        active: usize,
    },
    /// A `status_update` or `error` message from a worker.
    Progress {
        story_id: String,
        message: IpcMessage,
    },
    Closed {
        result: ChildProcessResult,
        active: usize,
    },
    PhaseCompleted {
        index: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// How workers are launched.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub project_dir: PathBuf,
    pub worker_program: PathBuf,
    /// `{story_id}` is replaced with the item id.
    pub worker_args: Vec<String>,
    pub worker_env: Vec<(String, String)>,
    pub failure_policy: FailurePolicy,
    pub isolation: IsolationMode,
    pub base_branch: String,
    pub shutdown_timeout: Duration,
}

impl OrchestratorOptions {
    pub fn new(project_dir: impl Into<PathBuf>, worker_program: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            worker_env: Vec::new(),
            failure_policy: FailurePolicy::Continue,
            isolation: IsolationMode::Shared,
            base_branch: "main".to_string(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = args;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.worker_env.push((key.into(), value.into()));
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_worktrees(mut self, base_branch: impl Into<String>) -> Self {
        self.isolation = IsolationMode::Worktree;
        self.base_branch = base_branch.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Shared by every worker task of one orchestrator.
struct RunContext {
    options: OrchestratorOptions,
    processes: Arc<ProcessManager>,
    worktrees: Option<WorktreeService>,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    draining: Arc<AtomicBool>,
}

impl RunContext {
    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

pub struct ProcessOrchestrator {
    ctx: Arc<RunContext>,
    state: Mutex<OrchestratorState>,
}

impl ProcessOrchestrator {
    pub fn new(options: OrchestratorOptions, processes: Arc<ProcessManager>) -> Self {
        Self {
            ctx: Arc::new(RunContext {
                options,
                processes,
                worktrees: None,
                events: None,
                draining: Arc::new(AtomicBool::new(false)),
            }),
            state: Mutex::new(OrchestratorState::Idle),
        }
    }

    /// Required when isolation is [`IsolationMode::Worktree`].
    pub fn with_worktrees(mut self, worktrees: WorktreeService) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.worktrees = Some(worktrees);
        }
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.events = Some(tx);
        }
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.lock_state()
    }

    /// Run every item, phase by phase, at most `concurrency` workers at a time.
    ///
    /// Only dependency validation errors are returned as `Err`; every
    /// per-item problem (spawn failure, crash, bad IPC) becomes a failed
    /// [`ChildProcessResult`].
    pub async fn execute(
        &self,
        items: Vec<WorkItem>,
        concurrency: usize,
    ) -> Result<ExecutionSummary, ProcessError> {
        let timer = ExecutionTimer::start();
        let mut summary = ExecutionSummary::new(items.len());
        let phases = resolve_phases(items)?;
        let concurrency = concurrency.max(1);

        {
            let mut state = self.lock_state();
            if *state == OrchestratorState::Idle {
                *state = OrchestratorState::Running;
            }
        }

        info!(
            phases = phases.len(),
            items = summary.total_items,
            concurrency,
            "Starting execution"
        );

        let mut stop_after_phase = false;
        for phase in phases {
            if stop_after_phase || self.is_draining() {
                summary
                    .skipped
                    .extend(phase.items.into_iter().map(|i| i.id));
                continue;
            }

            let index = phase.index;
            self.ctx.emit(OrchestratorEvent::PhaseStarted {
                index,
                items: phase.ids().into_iter().map(String::from).collect(),
            });
            debug!(phase = index, items = ?phase.ids(), "Phase started");

            let mut queue: VecDeque<WorkItem> = phase.items.into();
            let mut running: JoinSet<ChildProcessResult> = JoinSet::new();
            let mut task_ids = HashMap::new();
            let mut phase_summary = PhaseSummary::new(index);

            loop {
                while running.len() < concurrency && !self.is_draining() {
                    let Some(item) = queue.pop_front() else {
                        break;
                    };
                    let ctx = Arc::clone(&self.ctx);
                    let story_id = item.id.clone();
                    let handle = running.spawn(supervise(ctx, item));
                    task_ids.insert(handle.id(), story_id);
                }

                let Some(joined) = running.join_next_with_id().await else {
                    break;
                };
                let result = joined_result(joined, &mut task_ids);
                self.ctx.emit(OrchestratorEvent::Closed {
                    result: result.clone(),
                    active: running.len(),
                });
                phase_summary.results.push(result);
            }

            summary.skipped.extend(queue.into_iter().map(|i| i.id));

            let (succeeded, failed) = (phase_summary.succeeded(), phase_summary.failed());
            self.ctx.emit(OrchestratorEvent::PhaseCompleted {
                index,
                succeeded,
                failed,
            });
            info!(phase = index, succeeded, failed, "Phase completed");

            if failed > 0 && self.ctx.options.failure_policy == FailurePolicy::Abort {
                warn!(phase = index, "Phase had failures, aborting remaining phases");
                stop_after_phase = true;
            }
            summary.phases.push(phase_summary);
        }

        let final_state = {
            let mut state = self.lock_state();
            *state = if self.is_draining() {
                OrchestratorState::Shutdown
            } else {
                OrchestratorState::Completed
            };
            *state
        };

        summary.state = final_state;
        summary.duration = timer.elapsed();
        Ok(summary)
    }

    /// Stop spawning, terminate running workers (TERM, then KILL after the
    /// configured timeout) and return once they are gone.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            match *state {
                OrchestratorState::Running => *state = OrchestratorState::Draining,
                OrchestratorState::Idle => *state = OrchestratorState::Shutdown,
                _ => {}
            }
        }
        self.ctx.draining.store(true, Ordering::SeqCst);
        info!("Shutting down workers");
        self.ctx
            .processes
            .kill_all_with_timeout(self.ctx.options.shutdown_timeout)
            .await;
    }

    fn is_draining(&self) -> bool {
        self.ctx.draining.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, OrchestratorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Map a finished task back to its item. A task that was lost (cancelled or
/// panicked past `supervise`) still yields a failed result for its story.
fn joined_result(
    joined: Result<(tokio::task::Id, ChildProcessResult), JoinError>,
    task_ids: &mut HashMap<tokio::task::Id, String>,
) -> ChildProcessResult {
    match joined {
        Ok((id, result)) => {
            task_ids.remove(&id);
            result
        }
        Err(e) => {
            let story_id = task_ids.remove(&e.id()).unwrap_or_default();
            error!(story_id, error = %e, "Worker supervisor task failed");
            ChildProcessResult::failure(
                &story_id,
                format!("worker supervisor task failed: {}", e),
                Duration::ZERO,
            )
        }
    }
}

/// Run one item to completion; never panics outward and always yields a result.
async fn supervise(ctx: Arc<RunContext>, item: WorkItem) -> ChildProcessResult {
    let timer = ExecutionTimer::start();
    let story_id = item.id.clone();
    AssertUnwindSafe(run_item(ctx, item))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            ChildProcessResult::failure(&story_id, "worker supervisor panicked", timer.elapsed())
        })
}

async fn run_item(ctx: Arc<RunContext>, item: WorkItem) -> ChildProcessResult {
    let timer = ExecutionTimer::start();
    let story_id = item.id.as_str();

    let workspace = match prepare_workspace(&ctx, &item).await {
        Ok(path) => path,
        Err(e) => {
            warn!(story_id, error = %e, "Workspace preparation failed");
            return ChildProcessResult::failure(story_id, e.to_string(), timer.elapsed());
        }
    };

    let args: Vec<String> = ctx
        .options
        .worker_args
        .iter()
        .map(|a| a.replace(STORY_ID_PLACEHOLDER, story_id))
        .collect();

    let mut cmd = Command::new(&ctx.options.worker_program);
    cmd.args(&args)
        .current_dir(&workspace)
        .env("SDLC_STORY_ID", story_id)
        .env("SDLC_PROJECT_DIR", &ctx.options.project_dir)
        .env("SDLC_WORKSPACE", &workspace)
        .envs(ctx.options.worker_env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = ProcessError::SpawnFailed {
                story_id: story_id.to_string(),
                source,
            };
            warn!(story_id, error = %err, "Spawn failed");
            return ChildProcessResult::failure(story_id, err.to_string(), timer.elapsed());
        }
    };

    let pid = child.id();
    let guard = ctx.processes.register(pid);
    ctx.emit(OrchestratorEvent::Spawned {
        story_id: story_id.to_string(),
        pid,
        active: ctx.processes.tracked_count(),
    });
    info!(story_id, pid = ?pid, workspace = %workspace.display(), "Worker spawned");

    // Shutdown may have snapshotted the registry before this child existed.
    if ctx.draining.load(Ordering::SeqCst) {
        match pid {
            Some(pid) => ctx.processes.signal(pid, Signal::Kill),
            None => {
                let _ = child.start_kill();
            }
        }
    }

    let mut payload = None;
    let mut reported_error = None;
    let mut ipc_failure = None;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line(&line) {
                    DecodedLine::Message(message) => match message.kind {
                        IpcMessageType::Complete => payload = Some(message.payload),
                        IpcMessageType::StatusUpdate | IpcMessageType::Error => {
                            if message.kind == IpcMessageType::Error {
                                reported_error = message
                                    .payload
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .map(String::from);
                            }
                            ctx.emit(OrchestratorEvent::Progress {
                                story_id: story_id.to_string(),
                                message,
                            });
                        }
                    },
                    DecodedLine::Malformed { line, error } => {
                        warn!(story_id, %error, "Undecodable IPC message");
                        ipc_failure.get_or_insert(ProcessError::Ipc {
                            story_id: story_id.to_string(),
                            message: format!("{}: {}", error, line),
                        });
                    }
                    DecodedLine::Text(text) => {
                        if !text.is_empty() {
                            debug!(story_id, output = %text, "Worker output");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(story_id, error = %e, "Failed reading worker output");
                    break;
                }
            }
        }
    }

    let status = child.wait().await;
    if let Some(guard) = guard {
        guard.mark_exited();
    }

    let mut result = match status {
        Ok(status) => ChildProcessResult::from_exit(story_id, status, timer.elapsed()),
        Err(e) => ChildProcessResult::failure(
            story_id,
            format!("failed to wait for worker: {}", e),
            timer.elapsed(),
        ),
    }
    .with_payload(payload);

    if let Some(err) = ipc_failure {
        result = result.fail_with(err.to_string());
    } else if !result.success
        && let Some(message) = reported_error
    {
        result.error = Some(message);
    }

    if result.success {
        info!(story_id, "Worker succeeded");
        cleanup_workspace(&ctx, story_id, workspace).await;
    } else {
        warn!(story_id, error = result.error.as_deref().unwrap_or(""), "Worker failed");
    }
    result
}

async fn prepare_workspace(ctx: &RunContext, item: &WorkItem) -> Result<PathBuf, ProcessError> {
    let workspace_err = |source: WorktreeError| ProcessError::Workspace {
        story_id: item.id.clone(),
        source,
    };

    let worktrees = match (ctx.options.isolation, &ctx.worktrees) {
        (IsolationMode::Shared, _) => return Ok(ctx.options.project_dir.clone()),
        (IsolationMode::Worktree, Some(w)) => w.clone(),
        (IsolationMode::Worktree, None) => {
            return Err(workspace_err(WorktreeError::NotFound {
                path: ctx.options.project_dir.join("<worktree base>"),
            }));
        }
    };

    let story_id = item.id.clone();
    let slug = item_slug(item);
    let base = ctx.options.base_branch.clone();

    let created = tokio::task::spawn_blocking(move || {
        match worktrees.create(&story_id, &slug, &base) {
            // Left over from an interrupted run: reuse it if it is this story's worktree.
            Err(WorktreeError::AlreadyExists { path }) => {
                match worktrees.find_for_story(&story_id)? {
                    Some(info) if Some(&info.path) == path.canonicalize().ok().as_ref() => {
                        info!(story_id, path = %info.path.display(), "Reusing existing worktree");
                        Ok(info.path)
                    }
                    _ => Err(WorktreeError::AlreadyExists { path }),
                }
            }
            other => other,
        }
    })
    .await
    .map_err(|e| workspace_err(WorktreeError::Io(std::io::Error::other(e))))?;

    created.map_err(workspace_err)
}

async fn cleanup_workspace(ctx: &RunContext, story_id: &str, workspace: PathBuf) {
    if ctx.options.isolation != IsolationMode::Worktree {
        return;
    }
    let Some(worktrees) = ctx.worktrees.clone() else {
        return;
    };
    let path = workspace.clone();
    let removed = tokio::task::spawn_blocking(move || worktrees.remove(&path, false)).await;
    match removed {
        Ok(Ok(())) => debug!(story_id, "Removed clean worktree"),
        Ok(Err(WorktreeError::Dirty { path })) => {
            warn!(story_id, path = %path.display(), "Worktree has uncommitted changes, keeping it");
        }
        Ok(Err(e)) => warn!(story_id, error = %e, "Failed to remove worktree"),
        Err(e) => warn!(story_id, error = %e, "Worktree cleanup task failed"),
    }
}

fn item_slug(item: &WorkItem) -> String {
    ["slug", "title"]
        .iter()
        .find_map(|key| item.payload.get(*key).and_then(|v| v.as_str()))
        .map(slugify)
        .unwrap_or_else(|| slugify(&item.id))
}
