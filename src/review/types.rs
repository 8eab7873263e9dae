//! Reviewer output types.
//!
//! Each reviewer run produces one [`AgentOutput`]: an approval flag plus the
//! [`Concern`]s it raised. Outputs are immutable once produced; the merger and
//! consensus manager only read them.
//!
//! ## Example
//!
//! ```
//! use sdlc::config::ReviewerRole;
//! use sdlc::review::{AgentOutput, Concern, Severity};
//!
//! let concern = Concern::new(Severity::Blocker, "security", "Password logged in plain text")
//!     .with_file("src/auth.rs")
//!     .with_line(42)
//!     .with_suggested_fix("Redact the password field before logging");
//!
//! let output = AgentOutput::new("security-1", ReviewerRole::SecurityReviewer, false)
//!     .with_concern(concern);
//!
//! assert!(output.has_blockers());
//! assert!(!output.approved);
//! ```

use crate::config::ReviewerRole;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Concern severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must be fixed before the story can pass review.
    Blocker,
    /// Should be fixed; does not block on its own.
    Warning,
    /// Optional improvement.
    Suggestion,
}

impl Severity {
    pub fn is_blocker(&self) -> bool {
        matches!(self, Self::Blocker)
    }

    /// The more severe of two severities.
    ///
    /// ```
    /// use sdlc::review::Severity;
    ///
    /// assert_eq!(Severity::Warning.most_severe(Severity::Blocker), Severity::Blocker);
    /// ```
    pub fn most_severe(self, other: Self) -> Self {
        self.min(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocker => "blocker",
            Self::Warning => "warning",
            Self::Suggestion => "suggestion",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single issue raised by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concern {
    pub severity: Severity,
    #[serde(default = "default_category")]
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

impl Concern {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category: category.into(),
            description: description.into(),
            file: None,
            line: None,
            suggested_fix: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_suggested_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    /// Case- and whitespace-insensitive key used for deduplication.
    ///
    /// ```
    /// use sdlc::review::{Concern, Severity};
    ///
    /// let a = Concern::new(Severity::Warning, "style", "Missing   docs");
    /// let b = Concern::new(Severity::Blocker, "docs", "missing docs ");
    /// assert_eq!(a.normalized_description(), b.normalized_description());
    /// ```
    pub fn normalized_description(&self) -> String {
        self.description
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    /// `file:line`, `file`, or `None` when the concern has no location.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{}:{}", file, line)),
            (Some(file), None) => Some(file.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Concern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.category, self.description)?;
        if let Some(location) = self.location() {
            write!(f, " ({})", location)?;
        }
        if let Some(ref fix) = self.suggested_fix {
            write!(f, " (fix: {})", fix)?;
        }
        Ok(())
    }
}

/// The result of one reviewer execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub role: ReviewerRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl AgentOutput {
    pub fn new(agent_id: impl Into<String>, role: ReviewerRole, approved: bool) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            content: String::new(),
            concerns: Vec::new(),
            approved,
            iteration: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_concern(mut self, concern: Concern) -> Self {
        self.concerns.push(concern);
        self
    }

    pub fn with_concerns(mut self, concerns: Vec<Concern>) -> Self {
        self.concerns.extend(concerns);
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn has_blockers(&self) -> bool {
        self.concerns.iter().any(|c| c.severity.is_blocker())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Blocker < Severity::Warning);
        assert!(Severity::Warning < Severity::Suggestion);
        assert_eq!(
            Severity::Suggestion.most_severe(Severity::Warning),
            Severity::Warning
        );
    }

    #[test]
    fn test_severity_serde() {
        let json = serde_json::to_string(&Severity::Blocker).unwrap();
        assert_eq!(json, "\"blocker\"");
    }

    #[test]
    fn test_concern_deserialize_defaults() {
        let concern: Concern =
            serde_json::from_str(r#"{"severity":"warning","description":"slow loop"}"#).unwrap();
        assert_eq!(concern.category, "general");
        assert!(concern.file.is_none());
    }

    #[test]
    fn test_concern_display() {
        let concern = Concern::new(Severity::Warning, "perf", "N+1 query")
            .with_file("src/db.rs")
            .with_line(7);
        assert_eq!(concern.to_string(), "[warning] perf: N+1 query (src/db.rs:7)");
    }

    #[test]
    fn test_agent_output_blockers() {
        let clean = AgentOutput::new("a", ReviewerRole::CodeReviewer, true)
            .with_concern(Concern::new(Severity::Suggestion, "style", "rename x"));
        assert!(!clean.has_blockers());

        let blocked = clean
            .clone()
            .with_concern(Concern::new(Severity::Blocker, "bug", "panics on empty input"));
        assert!(blocked.has_blockers());
    }
}
