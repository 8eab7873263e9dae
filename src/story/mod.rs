//! Persisted story state and the circuit breakers that bound its recovery.
//!
//! - [`model`]: the story record and its frontmatter format
//! - [`store`]: locked read-modify-write persistence
//! - [`lock`]: sidecar lock files with stale-lock reclamation
//! - [`retry`]: per-cycle, implementation and lifetime retry guards
//! - [`fingerprint`]: identical-error detection

pub mod fingerprint;
pub mod lock;
pub mod model;
pub mod retry;
pub mod store;

pub use fingerprint::{ErrorFingerprint, MAX_FINGERPRINT_HISTORY};
pub use lock::{LockGuard, LockOptions};
pub use model::{
    Attempt, PhaseFlags, RetryLimit, ReviewAttempt, ReviewDecision, Story, StoryStatus,
};
pub use retry::{FailureKind, RecoveryDecision, RetryPolicy, evaluate_failure};
pub use store::StoryStore;
