//! Review gate: reconciling several independent reviewer opinions.
//!
//! ## Components
//!
//! - [`types`]: reviewer outputs and the concerns they raise
//! - [`merger`]: deduplication and ranking of concerns across reviewers
//! - [`consensus`]: the iterative agreement protocol
//!
//! ## Example
//!
//! ```
//! use sdlc::config::ReviewerRole;
//! use sdlc::review::{AgentOutput, Concern, Severity, merge_agent_outputs};
//!
//! let outputs = vec![
//!     AgentOutput::new("code-1", ReviewerRole::CodeReviewer, true),
//!     AgentOutput::new("sec-1", ReviewerRole::SecurityReviewer, false)
//!         .with_concern(Concern::new(Severity::Blocker, "security", "Unescaped HTML")),
//! ];
//!
//! let merged = merge_agent_outputs(&outputs);
//! assert!(!merged.all_approved);
//! assert!(merged.has_blockers);
//! assert_eq!(merged.dissenting, vec!["sec-1"]);
//! ```

pub mod consensus;
pub mod merger;
pub mod types;

pub use consensus::{
    ConsensusManager, ConsensusMode, ConsensusOptions, ConsensusProgress, ConsensusResult,
    FeedbackContext, ReviewExecutor,
};
pub use merger::{MergedReview, find_shared_concerns, merge_agent_outputs};
pub use types::{AgentOutput, Concern, Severity};
