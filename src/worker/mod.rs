//! Child-side execution of one story.
//!
//! A worker process runs a single story through research, plan, implement
//! and review inside its workspace. Every state change goes through the
//! locked story store, so a worker that crashes halfway leaves a story that
//! the next run can pick up from the last completed stage. Progress is
//! reported to the parent as IPC messages.

pub mod reviewers;

use crate::config::{IsolationMode, ReviewerRole, SdlcToml};
use crate::process::IpcMessage;
use crate::provider::AiProvider;
use crate::review::{
    AgentOutput, ConsensusManager, ConsensusOptions, ConsensusResult, FeedbackContext,
    ReviewExecutor,
};
use crate::story::{
    FailureKind, PhaseFlags, RecoveryDecision, RetryPolicy, ReviewAttempt, ReviewDecision, Story,
    StoryStatus, StoryStore, evaluate_failure, retry,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use reviewers::ProviderReviewExecutor;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are an autonomous software engineer working on a single story \
in an isolated checkout. Only modify files inside the current working directory.";

/// Where status messages go. The worker binary writes them to stdout.
pub type MessageSink = Arc<dyn Fn(&IpcMessage) + Send + Sync>;

pub fn stdout_sink() -> MessageSink {
    Arc::new(|message: &IpcMessage| {
        if let Err(e) = message.emit() {
            warn!(error = %e, "Failed to write IPC message");
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done,
    Blocked { reason: String },
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Blocked { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub policy: RetryPolicy,
    pub consensus: ConsensusOptions,
    pub reviewers: Vec<ReviewerRole>,
    /// Shell command that must pass after implementation.
    pub verification: Option<String>,
    pub provider_timeout: Duration,
    /// Commit the workspace once the story is done.
    pub commit_on_done: bool,
}

impl WorkerSettings {
    pub fn from_settings(settings: &SdlcToml) -> Self {
        Self {
            policy: settings.retries.to_retry_policy(),
            consensus: settings.reviews.to_consensus_options(),
            reviewers: settings.reviews.reviewers.clone(),
            verification: settings.verification.command.clone(),
            provider_timeout: Duration::from_secs(settings.provider.timeout_secs),
            commit_on_done: settings.orchestrator.isolation == IsolationMode::Worktree,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Research,
    Plan,
    Implement,
}

impl Stage {
    const ALL: [Stage; 3] = [Stage::Research, Stage::Plan, Stage::Implement];

    fn name(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::Research => "Research Notes",
            Self::Plan => "Plan",
            Self::Implement => "Implementation Notes",
        }
    }

    fn is_complete(self, flags: &PhaseFlags) -> bool {
        match self {
            Self::Research => flags.research_complete,
            Self::Plan => flags.plan_complete,
            Self::Implement => flags.implementation_complete,
        }
    }

    fn mark_complete(self, flags: &mut PhaseFlags) {
        match self {
            Self::Research => flags.research_complete = true,
            Self::Plan => flags.plan_complete = true,
            Self::Implement => flags.implementation_complete = true,
        }
    }

    fn prompt(self, story: &Story) -> String {
        let instructions = match self {
            Self::Research => {
                "Research the codebase for this story. Summarize the relevant files, \
                 existing patterns and risks. Do not change any files."
            }
            Self::Plan => {
                "Write a step-by-step implementation plan for this story based on the \
                 research notes. List the files to change and the tests to add. Do not \
                 change any files."
            }
            Self::Implement => {
                "Implement the plan. Make the changes directly in the working directory, \
                 including tests, and finish with a short summary of what changed."
            }
        };
        let mut prompt = format!("{}\n\n{}", instructions, story_context(story));
        if self == Self::Implement
            && let Some(error) = &story.last_error
        {
            prompt.push_str(&format!(
                "\n\n## Previous Attempt Failed\n\nThe last attempt failed verification:\n\n```\n{}\n```\n",
                error
            ));
        }
        prompt
    }
}

fn story_context(story: &Story) -> String {
    let mut context = format!("# Story {}: {}\n", story.id, story.title);
    if !story.body.trim().is_empty() {
        context.push('\n');
        context.push_str(story.body.trim());
        context.push('\n');
    }
    context
}

fn append_section(body: &mut String, heading: &str, text: &str) {
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }
    body.push_str(&format!("\n## {}\n\n{}\n", heading, text.trim()));
}

fn review_attempt(result: &ConsensusResult) -> ReviewAttempt {
    let decision = if result.reached {
        ReviewDecision::Approved
    } else if result.error.is_some() {
        ReviewDecision::NeedsHuman
    } else {
        ReviewDecision::Rejected
    };
    ReviewAttempt {
        timestamp: Utc::now(),
        decision,
        iterations: result.iterations,
        blockers: result
            .unresolved_concerns
            .iter()
            .filter(|c| c.severity.is_blocker())
            .count(),
        unresolved: result
            .unresolved_concerns
            .iter()
            .map(|c| c.to_string())
            .collect(),
        summary: result.summary.clone(),
    }
}

pub struct StoryWorker {
    story_id: String,
    store: StoryStore,
    provider: Arc<dyn AiProvider>,
    workspace: PathBuf,
    settings: WorkerSettings,
    sink: MessageSink,
}

impl StoryWorker {
    pub fn new(
        story_id: impl Into<String>,
        store: StoryStore,
        provider: Arc<dyn AiProvider>,
        workspace: impl Into<PathBuf>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            story_id: story_id.into(),
            store,
            provider,
            workspace: workspace.into(),
            settings,
            sink: stdout_sink(),
        }
    }

    pub fn with_sink(mut self, sink: MessageSink) -> Self {
        self.sink = sink;
        self
    }

    /// Drive the story until it is done or blocked.
    ///
    /// Each pass reloads the story under its lock and runs the first stage
    /// that is not complete yet. The lifetime recovery cap guarantees the loop
    /// ends.
    pub async fn run(&self) -> Result<WorkerOutcome> {
        loop {
            let (story, _) = self
                .store
                .update(&self.story_id, |s| {
                    if matches!(s.status, StoryStatus::Backlog | StoryStatus::Ready) {
                        s.move_to(StoryStatus::InProgress);
                    }
                })
                .await?;

            match story.status {
                StoryStatus::Done => return Ok(WorkerOutcome::Done),
                StoryStatus::Blocked => {
                    return Ok(WorkerOutcome::Blocked {
                        reason: story.blocked_reason.clone().unwrap_or_default(),
                    });
                }
                _ => {}
            }

            let next = Stage::ALL
                .into_iter()
                .find(|stage| !stage.is_complete(&story.phases));
            let outcome = match next {
                Some(stage) => self.run_stage(stage, &story).await?,
                None if !story.phases.reviews_complete => self.run_review(&story).await?,
                None => Some(self.finish().await?),
            };
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }
    }

    async fn run_stage(&self, stage: Stage, story: &Story) -> Result<Option<WorkerOutcome>> {
        self.status(stage.name(), "started");
        info!(story_id = %self.story_id, stage = stage.name(), "Running stage");

        let output = match self.query(&stage.prompt(story)).await {
            Ok(output) => output,
            Err(e) => {
                let failure = format!("{} failed: {:#}", stage.name(), e);
                return self.charge(FailureKind::Cycle, &failure).await;
            }
        };

        if stage == Stage::Implement
            && let Some(failure) = self.verify().await?
        {
            self.status("verify", "failed");
            return self.charge(FailureKind::Implementation, &failure).await;
        }

        self.store
            .update(&self.story_id, |s| {
                stage.mark_complete(&mut s.phases);
                append_section(&mut s.body, stage.heading(), &output);
                if stage == Stage::Implement {
                    retry::reset_implementation_retry_count(s);
                    s.last_error = None;
                }
            })
            .await?;
        self.status(stage.name(), "complete");
        Ok(None)
    }

    async fn run_review(&self, story: &Story) -> Result<Option<WorkerOutcome>> {
        self.status("review", "started");
        let reviewers = ProviderReviewExecutor::new(
            Arc::clone(&self.provider),
            self.settings.reviewers.clone(),
            story_context(story),
            self.workspace.clone(),
        )
        .with_timeout(self.settings.provider_timeout);

        let initial = match reviewers.initial_round().await {
            Ok(outputs) => outputs,
            Err(e) => {
                let failure = format!("review failed: {:#}", e);
                return self.charge(FailureKind::Cycle, &failure).await;
            }
        };

        let sink = Arc::clone(&self.sink);
        let story_id = self.story_id.clone();
        let manager = ConsensusManager::new(self.settings.consensus).with_observer(move |p| {
            sink(&IpcMessage::status(
                &story_id,
                "review",
                &format!(
                    "round {}/{}: {}/{} approved",
                    p.iteration, p.max_iterations, p.approvals, p.total
                ),
            ));
        });
        let executor = RefineThenReview {
            worker: self,
            reviewers: &reviewers,
        };
        let result = manager.seek_consensus(initial, &executor).await;
        let attempt = review_attempt(&result);

        if result.reached {
            self.store
                .update(&self.story_id, |s| {
                    s.record_review_attempt(attempt);
                    s.phases.reviews_complete = true;
                })
                .await?;
            self.status("review", "approved");
            return self.finish().await.map(Some);
        }

        if let Some(error) = &result.error {
            let reason = format!("Review needs human attention: {}", error);
            self.store
                .update(&self.story_id, |s| {
                    s.record_review_attempt(attempt);
                    retry::block_with_error(s, reason.clone(), error);
                })
                .await?;
            warn!(story_id = %self.story_id, %reason, "Story blocked");
            return Ok(Some(WorkerOutcome::Blocked { reason }));
        }

        self.store
            .update(&self.story_id, |s| s.record_review_attempt(attempt))
            .await?;
        self.status("review", "rejected");

        let mut feedback = result.summary.clone();
        for concern in &result.unresolved_concerns {
            feedback.push_str(&format!("\n{}", concern));
        }
        self.charge(FailureKind::Cycle, &feedback).await
    }

    /// Mark the story done and commit the workspace.
    async fn finish(&self) -> Result<WorkerOutcome> {
        if self.settings.commit_on_done {
            let workspace = self.workspace.clone();
            let message = format!("story {}: implementation approved", self.story_id);
            let committed =
                tokio::task::spawn_blocking(move || crate::worktree::commit_all(&workspace, &message))
                    .await
                    .context("Commit task failed")?;
            match committed {
                Ok(Some(commit)) => info!(story_id = %self.story_id, %commit, "Committed story changes"),
                Ok(None) => {}
                Err(e) => warn!(story_id = %self.story_id, error = %e, "Failed to commit story changes"),
            }
        }
        self.store
            .update(&self.story_id, |s| s.move_to(StoryStatus::Done))
            .await?;
        info!(story_id = %self.story_id, "Story done");
        Ok(WorkerOutcome::Done)
    }

    /// Run the failure through the circuit breakers. `None` means try again.
    async fn charge(&self, kind: FailureKind, failure: &str) -> Result<Option<WorkerOutcome>> {
        let (_, decision) = self
            .store
            .update(&self.story_id, |s| {
                evaluate_failure(s, &self.settings.policy, kind, failure)
            })
            .await?;
        match decision {
            RecoveryDecision::Retry => {
                self.status("recovery", "retrying");
                Ok(None)
            }
            RecoveryDecision::Block { reason } => {
                self.status("recovery", &format!("blocked: {}", reason));
                Ok(Some(WorkerOutcome::Blocked { reason }))
            }
        }
    }

    /// Run the verification command. `Some(output)` when it failed.
    async fn verify(&self) -> Result<Option<String>> {
        let Some(command) = &self.settings.verification else {
            return Ok(None);
        };
        self.status("verify", command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run verification command '{}'", command))?;
        if output.status.success() {
            return Ok(None);
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if text.trim().is_empty() {
            text = format!("verification command failed: {}", output.status);
        }
        Ok(Some(text))
    }

    async fn query(&self, prompt: &str) -> Result<String> {
        self.provider
            .query(
                prompt,
                Some(SYSTEM_PROMPT),
                Some(self.workspace.as_path()),
                Some(self.settings.provider_timeout),
            )
            .await
    }

    fn status(&self, phase: &str, message: &str) {
        (self.sink)(&IpcMessage::status(&self.story_id, phase, message));
    }
}

/// Between review rounds the implementation is revised against the feedback,
/// then the reviewers look again.
struct RefineThenReview<'a> {
    worker: &'a StoryWorker,
    reviewers: &'a ProviderReviewExecutor,
}

#[async_trait]
impl ReviewExecutor for RefineThenReview<'_> {
    async fn execute(&self, context: &FeedbackContext) -> Result<Vec<AgentOutput>> {
        let policy = self.worker.settings.policy;
        let (story, allowed) = self
            .worker
            .store
            .update(&self.worker.story_id, |s| {
                if retry::can_retry_refinement(s, &policy) {
                    s.record_refinement_iteration(context.summary.clone());
                    true
                } else {
                    false
                }
            })
            .await?;
        if !allowed {
            bail!(
                "refinement limit reached ({} iterations)",
                story.refinement_iterations.len()
            );
        }

        self.worker
            .status("refine", &format!("round {}", context.iteration));
        let prompt = format!(
            "Address the review feedback below by changing the implementation.\n\n{}\n{}",
            story_context(&story),
            context.to_prompt()
        );
        self.worker.query(&prompt).await?;
        if let Some(failure) = self.worker.verify().await? {
            bail!("verification failed after refinement:\n{}", failure);
        }

        self.reviewers.execute(context).await
    }
}
