//! Iterative consensus across independent reviewers.
//!
//! The initial round counts as iteration 1. When it already satisfies the
//! consensus predicate the executor is never called. Otherwise the manager
//! feeds the merged concerns back to the executor, up to `max_iterations`
//! rounds in total. An executor error ends the attempt; it is not retried.

use crate::review::merger::{MergedReview, find_shared_concerns, merge_agent_outputs};
use crate::review::types::{AgentOutput, Concern};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// How agreement is judged.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ConsensusMode {
    /// Every reviewer approves and nobody raised a blocker.
    #[default]
    Unanimous,
    /// At least `min_approval_ratio` of reviewers approve. Blockers do not
    /// veto on their own in this mode.
    Ratio { min_approval_ratio: f64 },
}

impl ConsensusMode {
    pub fn is_satisfied(&self, merged: &MergedReview) -> bool {
        if merged.total == 0 {
            return false;
        }
        match self {
            Self::Unanimous => merged.all_approved && !merged.has_blockers,
            Self::Ratio { min_approval_ratio } => merged.approval_ratio() >= *min_approval_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusOptions {
    pub mode: ConsensusMode,
    pub max_iterations: u32,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            mode: ConsensusMode::Unanimous,
            max_iterations: 3,
        }
    }
}

/// What the executor is given to produce the next round of reviews.
#[derive(Debug, Clone)]
pub struct FeedbackContext {
    pub iteration: u32,
    pub previous_outputs: Vec<AgentOutput>,
    /// Concerns raised by several reviewers independently.
    pub shared_concerns: Vec<Concern>,
    pub unresolved_concerns: Vec<Concern>,
    pub summary: String,
}

impl FeedbackContext {
    fn build(iteration: u32, outputs: &[AgentOutput], merged: &MergedReview) -> Self {
        Self {
            iteration,
            previous_outputs: outputs.to_vec(),
            shared_concerns: find_shared_concerns(outputs),
            unresolved_concerns: merged.concerns.clone(),
            summary: merged.summary.clone(),
        }
    }

    /// Render as prompt text, shared concerns first.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Review round {}", self.iteration);
        let _ = writeln!(out, "\n{}", self.summary);

        if !self.shared_concerns.is_empty() {
            let _ = writeln!(out, "\n### Raised by multiple reviewers (high confidence)");
            for concern in &self.shared_concerns {
                let _ = writeln!(out, "- {}", concern);
            }
        }

        let shared: Vec<String> = self
            .shared_concerns
            .iter()
            .map(Concern::normalized_description)
            .collect();
        let others: Vec<&Concern> = self
            .unresolved_concerns
            .iter()
            .filter(|c| !shared.contains(&c.normalized_description()))
            .collect();
        if !others.is_empty() {
            let _ = writeln!(out, "\n### Other unresolved concerns");
            for concern in others {
                let _ = writeln!(out, "- {}", concern);
            }
        }
        out
    }
}

/// Re-runs the reviewers with feedback from the previous round.
#[async_trait]
pub trait ReviewExecutor: Send + Sync {
    async fn execute(&self, context: &FeedbackContext) -> Result<Vec<AgentOutput>>;
}

/// Progress report sent to the observer after every round.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusProgress {
    pub iteration: u32,
    pub max_iterations: u32,
    pub approvals: usize,
    pub total: usize,
    pub reached: bool,
}

pub type ProgressObserver = Box<dyn Fn(&ConsensusProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConsensusResult {
    pub reached: bool,
    pub iterations: u32,
    pub final_outputs: Vec<AgentOutput>,
    pub unresolved_concerns: Vec<Concern>,
    pub requires_human_review: bool,
    pub summary: String,
    /// Set when the executor failed and ended the attempt.
    pub error: Option<String>,
}

pub struct ConsensusManager {
    options: ConsensusOptions,
    observer: Option<ProgressObserver>,
}

impl ConsensusManager {
    pub fn new(options: ConsensusOptions) -> Self {
        Self {
            options,
            observer: None,
        }
    }

    pub fn with_observer(
        mut self,
        observer: impl Fn(&ConsensusProgress) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub async fn seek_consensus(
        &self,
        initial: Vec<AgentOutput>,
        executor: &dyn ReviewExecutor,
    ) -> ConsensusResult {
        let max_iterations = self.options.max_iterations.max(1);
        let mut iteration = 1;
        let mut outputs = initial;
        let mut merged = merge_agent_outputs(&outputs);
        let mut reached = self.options.mode.is_satisfied(&merged);
        self.notify(iteration, max_iterations, &merged, reached);

        while !reached && iteration < max_iterations {
            iteration += 1;
            let context = FeedbackContext::build(iteration, &outputs, &merged);
            debug!(
                iteration,
                shared = context.shared_concerns.len(),
                unresolved = context.unresolved_concerns.len(),
                "Requesting another review round"
            );

            match executor.execute(&context).await {
                Ok(next) => outputs = next,
                Err(e) => {
                    warn!(iteration, error = %e, "Review executor failed, escalating to human review");
                    return ConsensusResult {
                        reached: false,
                        iterations: iteration,
                        unresolved_concerns: merged.concerns,
                        summary: merged.summary,
                        final_outputs: outputs,
                        requires_human_review: true,
                        error: Some(format!("{:#}", e)),
                    };
                }
            }

            merged = merge_agent_outputs(&outputs);
            reached = self.options.mode.is_satisfied(&merged);
            self.notify(iteration, max_iterations, &merged, reached);
        }

        if reached {
            info!(iterations = iteration, "Reviewer consensus reached");
        } else {
            warn!(iterations = iteration, "No reviewer consensus, requires human review");
        }

        ConsensusResult {
            reached,
            iterations: iteration,
            unresolved_concerns: merged.concerns,
            summary: merged.summary,
            final_outputs: outputs,
            requires_human_review: !reached,
            error: None,
        }
    }

    fn notify(&self, iteration: u32, max_iterations: u32, merged: &MergedReview, reached: bool) {
        if let Some(observer) = &self.observer {
            observer(&ConsensusProgress {
                iteration,
                max_iterations,
                approvals: merged.approvals,
                total: merged.total,
                reached,
            });
        }
    }
}
