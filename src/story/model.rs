//! The persisted story record.
//!
//! Stories are markdown files with a YAML frontmatter block holding every
//! field below; the markdown body is free text for humans and agents.

use crate::errors::StoryError;
use crate::story::fingerprint::ErrorFingerprint;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;

const FRONTMATTER_DELIMITER: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    #[default]
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Done,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Done)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retry ceiling that may be switched off entirely.
///
/// Serialized as a plain number, or as `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Limited(u32),
    Unlimited,
}

impl RetryLimit {
    /// Whether `count` has reached this ceiling.
    pub fn is_reached(&self, count: u32) -> bool {
        match self {
            Self::Limited(max) => count >= *max,
            Self::Unlimited => false,
        }
    }

    /// The tighter of two limits.
    pub fn min(self, other: Self) -> Self {
        match (self, other) {
            (Self::Limited(a), Self::Limited(b)) => Self::Limited(a.min(b)),
            (Self::Limited(a), Self::Unlimited) | (Self::Unlimited, Self::Limited(a)) => {
                Self::Limited(a)
            }
            (Self::Unlimited, Self::Unlimited) => Self::Unlimited,
        }
    }
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for RetryLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for RetryLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u32),
            Word(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Self::Limited(n)),
            Repr::Word(w) => match w.to_ascii_lowercase().as_str() {
                "unlimited" | "infinity" | "inf" => Ok(Self::Unlimited),
                other => Err(D::Error::custom(format!(
                    "expected a number or \"unlimited\", got \"{}\"",
                    other
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFlags {
    #[serde(default)]
    pub research_complete: bool,
    #[serde(default)]
    pub plan_complete: bool,
    #[serde(default)]
    pub implementation_complete: bool,
    #[serde(default)]
    pub reviews_complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
    /// Consensus could not be reached; a human has to look.
    NeedsHuman,
}

/// Outcome of one pass through the review gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAttempt {
    pub timestamp: DateTime<Utc>,
    pub decision: ReviewDecision,
    pub iterations: u32,
    #[serde(default)]
    pub blockers: usize,
    #[serde(default)]
    pub unresolved: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// One refinement iteration after a rejected review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    #[serde(default)]
    pub phases: PhaseFlags,

    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub implementation_retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_implementation_retries: Option<RetryLimit>,
    #[serde(default)]
    pub total_recovery_attempts: u32,

    #[serde(default)]
    pub review_history: Vec<ReviewAttempt>,
    #[serde(default)]
    pub refinement_iterations: Vec<Attempt>,
    #[serde(default)]
    pub error_fingerprint_history: Vec<ErrorFingerprint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_timestamp: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub body: String,
}

impl Story {
    pub fn new(id: impl Into<String>, title: impl Into<String>, dependencies: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: StoryStatus::Backlog,
            dependencies,
            created: now,
            updated: now,
            phases: PhaseFlags::default(),
            retry_count: 0,
            max_retries: None,
            implementation_retry_count: 0,
            max_implementation_retries: None,
            total_recovery_attempts: 0,
            review_history: Vec::new(),
            refinement_iterations: Vec::new(),
            error_fingerprint_history: Vec::new(),
            last_error: None,
            blocked_reason: None,
            last_restart_reason: None,
            last_restart_timestamp: None,
            body: String::new(),
        }
    }

    /// Parse a story file: `---`, YAML frontmatter, `---`, markdown body.
    pub fn parse(content: &str, path: &Path) -> Result<Self, StoryError> {
        let parse_err = |message: String| StoryError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let rest = content
            .strip_prefix(FRONTMATTER_DELIMITER)
            .ok_or_else(|| parse_err("missing frontmatter".to_string()))?;
        let (yaml, body) = split_frontmatter(rest)
            .ok_or_else(|| parse_err("unterminated frontmatter".to_string()))?;

        let mut story: Story =
            serde_yaml::from_str(yaml).map_err(|e| parse_err(e.to_string()))?;
        story.body = body.trim_start_matches(['\r', '\n']).to_string();
        Ok(story)
    }

    /// Render back to the on-disk format.
    pub fn to_markdown(&self) -> Result<String, StoryError> {
        let yaml = serde_yaml::to_string(self).map_err(|e| StoryError::Parse {
            path: Path::new(&self.id).to_path_buf(),
            message: e.to_string(),
        })?;
        let mut out = String::with_capacity(yaml.len() + self.body.len() + 16);
        out.push_str(FRONTMATTER_DELIMITER);
        out.push('\n');
        out.push_str(&yaml);
        out.push_str(FRONTMATTER_DELIMITER);
        out.push('\n');
        if !self.body.is_empty() {
            out.push('\n');
            out.push_str(&self.body);
            if !self.body.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }

    pub fn move_to(&mut self, status: StoryStatus) {
        self.status = status;
        if status != StoryStatus::Blocked {
            self.blocked_reason = None;
        }
        self.touch();
    }

    pub fn mark_blocked(&mut self, reason: impl Into<String>) {
        self.status = StoryStatus::Blocked;
        self.blocked_reason = Some(reason.into());
        self.touch();
    }

    /// Return a blocked story to `ready`, clearing the failure it was parked on.
    pub fn unblock(&mut self, reset_retries: bool) {
        self.status = StoryStatus::Ready;
        self.blocked_reason = None;
        self.last_error = None;
        self.retry_count = 0;
        self.refinement_iterations.clear();
        if reset_retries {
            self.implementation_retry_count = 0;
            self.total_recovery_attempts = 0;
            self.error_fingerprint_history.clear();
        }
        self.touch();
    }

    pub fn record_review_attempt(&mut self, attempt: ReviewAttempt) {
        self.review_history.push(attempt);
        self.touch();
    }

    pub fn record_refinement_iteration(&mut self, feedback: impl Into<String>) -> u32 {
        let iteration = self.refinement_iterations.len() as u32 + 1;
        self.refinement_iterations.push(Attempt {
            iteration,
            timestamp: Utc::now(),
            feedback: feedback.into(),
        });
        self.touch();
        iteration
    }

    /// Slug used for branch and worktree names.
    pub fn slug(&self) -> String {
        crate::worktree::slugify(if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        })
    }
}

fn split_frontmatter(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if offset > 0 && line.trim_end() == FRONTMATTER_DELIMITER {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}
