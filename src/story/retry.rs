//! Circuit breakers around story recovery.
//!
//! Three guards run independently:
//! 1. per-cycle retries (`retry_count`), bumped by [`reset_rpiv_cycle`]
//! 2. implementation retries (`implementation_retry_count`), bumped per failed verification
//! 3. a lifetime recovery cap (`total_recovery_attempts`) that never resets
//!
//! On top of those, identical-error detection blocks a story whose failure
//! output stops changing, before the numeric budgets run out.

use crate::story::fingerprint::{self, ErrorFingerprint};
use crate::story::model::{RetryLimit, Story, StoryStatus};
use chrono::Utc;
use tracing::{info, warn};

/// Global retry settings; stories may override some of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_implementation_retries: RetryLimit,
    pub implementation_retries_upper_bound: RetryLimit,
    pub max_total_recovery_attempts: u32,
    pub identical_error_threshold: u32,
    pub max_refinement_iterations: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_implementation_retries: RetryLimit::Limited(3),
            implementation_retries_upper_bound: RetryLimit::Limited(10),
            max_total_recovery_attempts: 10,
            identical_error_threshold: 3,
            max_refinement_iterations: 3,
        }
    }
}

/// Which guard a failure is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Verification failed after implementation; retry implementation only.
    Implementation,
    /// Plan or review sent the story back; restart the RPIV cycle.
    Cycle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry,
    Block { reason: String },
}

impl RecoveryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

pub fn effective_max_retries(story: &Story, policy: &RetryPolicy) -> u32 {
    story.max_retries.unwrap_or(policy.max_retries)
}

pub fn is_at_max_retries(story: &Story, policy: &RetryPolicy) -> bool {
    story.retry_count >= effective_max_retries(story, policy)
}

/// Restart research → plan → implement → verify for a story.
///
/// Research stays valid; plan, implementation and review flags are cleared.
pub fn reset_rpiv_cycle(story: &mut Story, reason: &str) {
    story.phases.plan_complete = false;
    story.phases.implementation_complete = false;
    story.phases.reviews_complete = false;
    story.retry_count += 1;
    story.implementation_retry_count = 0;
    story.refinement_iterations.clear();
    story.last_restart_reason = Some(reason.to_string());
    story.last_restart_timestamp = Some(Utc::now());
    story.touch();
    info!(story_id = %story.id, retry_count = story.retry_count, reason, "Restarting RPIV cycle");
}

/// The story's override (or the global default), capped by the upper bound.
///
/// The override itself is stored as given; the cap only applies here.
pub fn effective_max_implementation_retries(story: &Story, policy: &RetryPolicy) -> RetryLimit {
    story
        .max_implementation_retries
        .unwrap_or(policy.max_implementation_retries)
        .min(policy.implementation_retries_upper_bound)
}

pub fn increment_implementation_retry_count(story: &mut Story) -> u32 {
    story.implementation_retry_count += 1;
    story.touch();
    story.implementation_retry_count
}

pub fn reset_implementation_retry_count(story: &mut Story) {
    story.implementation_retry_count = 0;
    story.touch();
}

pub fn is_at_max_implementation_retries(story: &Story, policy: &RetryPolicy) -> bool {
    effective_max_implementation_retries(story, policy).is_reached(story.implementation_retry_count)
}

pub fn is_at_max_total_recovery(story: &Story, policy: &RetryPolicy) -> bool {
    story.total_recovery_attempts >= policy.max_total_recovery_attempts
}

pub fn can_retry_refinement(story: &Story, policy: &RetryPolicy) -> bool {
    (story.refinement_iterations.len() as u32) < policy.max_refinement_iterations
}

/// Fingerprint a failure and record it as the story's last error.
pub fn record_failure<'s>(story: &'s mut Story, error_text: &str) -> &'s ErrorFingerprint {
    let entry = fingerprint::record_error(&mut story.error_fingerprint_history, error_text, Utc::now());
    story.last_error = Some(entry.error_preview.clone());
    story.updated = Utc::now();
    entry
}

/// The curated explanation of why a story keeps failing.
pub fn most_common_error(story: &Story) -> Option<&ErrorFingerprint> {
    fingerprint::most_common_error(&story.error_fingerprint_history)
}

/// Block a story outside the breakers, recording `error_text` the same way
/// a tripped breaker does.
pub fn block_with_error(story: &mut Story, reason: impl Into<String>, error_text: &str) {
    record_failure(story, error_text);
    curate_last_error(story);
    story.mark_blocked(reason);
}

fn curate_last_error(story: &mut Story) {
    if let Some(curated) = most_common_error(story).map(|fp| fp.error_preview.clone()) {
        story.last_error = Some(curated);
    }
}

/// Charge a failure against the story's breakers and decide what happens next.
///
/// On `Retry` the lifetime recovery counter is incremented (and for
/// [`FailureKind::Cycle`] the RPIV cycle is reset). On `Block` the story is
/// moved to `blocked` with `last_error` set to its most common failure.
pub fn evaluate_failure(
    story: &mut Story,
    policy: &RetryPolicy,
    kind: FailureKind,
    error_text: &str,
) -> RecoveryDecision {
    let streak = record_failure(story, error_text).consecutive_count;

    let block_reason = if is_at_max_total_recovery(story, policy) {
        Some(format!(
            "Global recovery limit reached ({} attempts)",
            story.total_recovery_attempts
        ))
    } else if fingerprint::is_stuck(&story.error_fingerprint_history, policy.identical_error_threshold) {
        Some(format!("Identical error repeated {} times", streak))
    } else {
        match kind {
            FailureKind::Implementation => {
                let count = increment_implementation_retry_count(story);
                is_at_max_implementation_retries(story, policy).then(|| {
                    format!(
                        "Implementation retry limit reached ({}/{})",
                        count,
                        effective_max_implementation_retries(story, policy)
                    )
                })
            }
            FailureKind::Cycle => is_at_max_retries(story, policy).then(|| {
                format!(
                    "Retry limit reached ({}/{})",
                    story.retry_count,
                    effective_max_retries(story, policy)
                )
            }),
        }
    };

    match block_reason {
        Some(reason) => {
            curate_last_error(story);
            warn!(story_id = %story.id, %reason, "Circuit breaker tripped, blocking story");
            story.mark_blocked(reason.clone());
            RecoveryDecision::Block { reason }
        }
        None => {
            story.total_recovery_attempts += 1;
            if kind == FailureKind::Cycle {
                reset_rpiv_cycle(story, error_text.lines().next().unwrap_or("failure"));
            }
            if story.status != StoryStatus::InProgress {
                story.move_to(StoryStatus::InProgress);
            }
            RecoveryDecision::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story() -> Story {
        Story::new("S-1", "Login", vec![])
    }

    #[test]
    fn test_reset_rpiv_preserves_research() {
        let mut s = story();
        s.phases.research_complete = true;
        s.phases.plan_complete = true;
        s.phases.implementation_complete = true;
        s.phases.reviews_complete = true;

        reset_rpiv_cycle(&mut s, "review rejected");

        assert!(s.phases.research_complete);
        assert!(!s.phases.plan_complete);
        assert!(!s.phases.implementation_complete);
        assert!(!s.phases.reviews_complete);
        assert_eq!(s.retry_count, 1);
        assert_eq!(s.last_restart_reason.as_deref(), Some("review rejected"));
        assert!(s.last_restart_timestamp.is_some());
    }

    #[test]
    fn test_implementation_retry_count_increments_exactly() {
        let mut s = story();
        for k in 1..=7 {
            increment_implementation_retry_count(&mut s);
            assert_eq!(s.implementation_retry_count, k);
        }
    }

    #[test]
    fn test_is_at_max_implementation_retries_boundary() {
        let policy = RetryPolicy::default();
        let mut s = story();
        for count in 0..3 {
            s.implementation_retry_count = count;
            assert!(!is_at_max_implementation_retries(&s, &policy));
        }
        for count in 3..8 {
            s.implementation_retry_count = count;
            assert!(is_at_max_implementation_retries(&s, &policy));
        }
    }

    #[test]
    fn test_unlimited_never_trips() {
        let policy = RetryPolicy {
            implementation_retries_upper_bound: RetryLimit::Unlimited,
            ..RetryPolicy::default()
        };
        let mut s = story();
        s.max_implementation_retries = Some(RetryLimit::Unlimited);
        s.implementation_retry_count = 10_000;
        assert!(!is_at_max_implementation_retries(&s, &policy));
    }

    #[test]
    fn test_zero_limit_trips_on_first_failure() {
        let policy = RetryPolicy::default();
        let mut s = story();
        s.max_implementation_retries = Some(RetryLimit::Limited(0));

        let decision = evaluate_failure(&mut s, &policy, FailureKind::Implementation, "fail");
        assert!(!decision.is_retry());
        assert_eq!(s.status, StoryStatus::Blocked);
    }

    #[test]
    fn test_override_capped_by_upper_bound_but_not_clamped() {
        let policy = RetryPolicy::default();
        let mut s = story();
        s.max_implementation_retries = Some(RetryLimit::Limited(50));

        assert_eq!(
            effective_max_implementation_retries(&s, &policy),
            RetryLimit::Limited(10)
        );
        assert_eq!(s.max_implementation_retries, Some(RetryLimit::Limited(50)));
    }

    #[test]
    fn test_distinct_failures_retry_until_limit() {
        let policy = RetryPolicy::default();
        let mut s = story();

        for i in 0..2 {
            let decision = evaluate_failure(
                &mut s,
                &policy,
                FailureKind::Implementation,
                &format!("failure kind {}", ["alpha", "beta"][i]),
            );
            assert_eq!(decision, RecoveryDecision::Retry);
        }
        assert_eq!(s.total_recovery_attempts, 2);

        let decision = evaluate_failure(&mut s, &policy, FailureKind::Implementation, "gamma");
        assert!(matches!(decision, RecoveryDecision::Block { .. }));
        assert_eq!(s.implementation_retry_count, 3);
        assert_eq!(s.total_recovery_attempts, 2);
    }

    #[test]
    fn test_identical_errors_block_before_budget_exhausted() {
        let policy = RetryPolicy {
            max_implementation_retries: RetryLimit::Limited(10),
            ..RetryPolicy::default()
        };
        let mut s = story();

        let err = "thread 'main' panicked at /tmp/wt/src/lib.rs:10:5: index out of bounds";
        assert!(evaluate_failure(&mut s, &policy, FailureKind::Implementation, err).is_retry());
        let err2 = "thread 'main' panicked at /other/wt/src/lib.rs:12:9: index out of bounds";
        assert!(evaluate_failure(&mut s, &policy, FailureKind::Implementation, err2).is_retry());

        let decision = evaluate_failure(&mut s, &policy, FailureKind::Implementation, err);
        match decision {
            RecoveryDecision::Block { reason } => assert!(reason.contains("Identical error")),
            other => panic!("expected block, got {other:?}"),
        }
        assert!(s.implementation_retry_count < 10);
        assert!(s.last_error.as_deref().unwrap().contains("index out of bounds"));
    }

    #[test]
    fn test_global_recovery_cap_overrides_other_counters() {
        let policy = RetryPolicy {
            max_total_recovery_attempts: 2,
            max_implementation_retries: RetryLimit::Unlimited,
            implementation_retries_upper_bound: RetryLimit::Unlimited,
            ..RetryPolicy::default()
        };
        let mut s = story();
        assert!(evaluate_failure(&mut s, &policy, FailureKind::Implementation, "a").is_retry());
        assert!(evaluate_failure(&mut s, &policy, FailureKind::Implementation, "b").is_retry());

        // Per-cycle counters reset, the lifetime cap does not.
        reset_implementation_retry_count(&mut s);
        let decision = evaluate_failure(&mut s, &policy, FailureKind::Implementation, "c");
        match decision {
            RecoveryDecision::Block { reason } => assert!(reason.contains("Global recovery")),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_failure_restarts_then_blocks() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let mut s = story();
        s.phases.research_complete = true;
        s.phases.plan_complete = true;

        assert!(evaluate_failure(&mut s, &policy, FailureKind::Cycle, "review: x").is_retry());
        assert_eq!(s.retry_count, 1);
        assert!(!s.phases.plan_complete);
        assert!(s.phases.research_complete);

        assert!(evaluate_failure(&mut s, &policy, FailureKind::Cycle, "review: y").is_retry());
        assert_eq!(s.retry_count, 2);

        let decision = evaluate_failure(&mut s, &policy, FailureKind::Cycle, "review: z");
        assert!(!decision.is_retry());
        assert_eq!(s.status, StoryStatus::Blocked);
    }

    #[test]
    fn test_can_retry_refinement() {
        let policy = RetryPolicy::default();
        let mut s = story();
        assert!(can_retry_refinement(&s, &policy));
        for i in 0..3 {
            s.record_refinement_iteration(format!("round {i}"));
        }
        assert!(!can_retry_refinement(&s, &policy));

        reset_rpiv_cycle(&mut s, "review rejected");
        assert!(s.refinement_iterations.is_empty());
        assert!(can_retry_refinement(&s, &policy));
    }

    #[test]
    fn test_block_with_error_uses_curated_preview() {
        let mut s = story();
        let raw = "\x1b[31merror\x1b[0m at /tmp/build-1/src/lib.rs:12:5\nsecond line";
        block_with_error(&mut s, "Review needs human attention", raw);

        assert_eq!(s.status, StoryStatus::Blocked);
        assert_eq!(s.error_fingerprint_history.len(), 1);
        assert_eq!(
            s.last_error.as_deref(),
            Some(s.error_fingerprint_history[0].error_preview.as_str())
        );
        assert_ne!(s.last_error.as_deref(), Some(raw));
    }
}
