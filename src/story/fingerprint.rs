//! Identical-error detection.
//!
//! Failure output is normalized (run-specific noise stripped) and hashed.
//! Consecutive failures with the same hash extend a streak; a streak at the
//! configured threshold means retrying will not help.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Oldest entries are evicted beyond this many.
pub const MAX_FINGERPRINT_HISTORY: usize = 10;

const PREVIEW_LEN: usize = 200;

static ANSI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

static UUID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .unwrap()
});

static TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
        .unwrap()
});

static TIME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").unwrap());

static HEX_ADDR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").unwrap());

static PATH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[A-Za-z]:)?(?:[/\\][\w.@+-]+)*[/\\]([\w.@+-]+)").unwrap()
});

static LINE_COL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(?::\d+)?\b").unwrap());

static LINE_WORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(line|column|col)\s+\d+").unwrap());

static DURATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\s?(?:ms|s|µs|ns)\b").unwrap());

static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// One rolling entry per distinct normalized error signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFingerprint {
    pub hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub consecutive_count: u32,
    pub error_preview: String,
}

/// Strip everything that changes between runs without the defect changing.
pub fn normalize_error(text: &str) -> String {
    let s = ANSI_REGEX.replace_all(text, "");
    let s = UUID_REGEX.replace_all(&s, "<uuid>");
    let s = TIMESTAMP_REGEX.replace_all(&s, "<timestamp>");
    let s = TIME_REGEX.replace_all(&s, "<time>");
    let s = HEX_ADDR_REGEX.replace_all(&s, "<addr>");
    let s = PATH_REGEX.replace_all(&s, "<path>/$1");
    let s = LINE_COL_REGEX.replace_all(&s, ":<n>");
    let s = LINE_WORD_REGEX.replace_all(&s, "$1 <n>");
    let s = DURATION_REGEX.replace_all(&s, "<duration>");
    WHITESPACE_REGEX.replace_all(&s, " ").trim().to_string()
}

/// Hex SHA-256 of the normalized error text.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(normalize_error(text).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Record a failure in `history` and return the entry it landed in.
///
/// A hash equal to the most recent entry extends that entry's streak; any
/// other hash starts a new entry with a count of 1.
pub fn record_error<'h>(
    history: &'h mut Vec<ErrorFingerprint>,
    text: &str,
    now: DateTime<Utc>,
) -> &'h ErrorFingerprint {
    let hash = fingerprint(text);

    let extends_streak = history.last().is_some_and(|last| last.hash == hash);
    if extends_streak {
        if let Some(last) = history.last_mut() {
            last.consecutive_count += 1;
            last.last_seen = now;
        }
    } else {
        history.push(ErrorFingerprint {
            hash,
            first_seen: now,
            last_seen: now,
            consecutive_count: 1,
            error_preview: preview(text),
        });
        if history.len() > MAX_FINGERPRINT_HISTORY {
            let excess = history.len() - MAX_FINGERPRINT_HISTORY;
            history.drain(..excess);
        }
    }

    &history[history.len() - 1]
}

/// Whether the latest error has repeated `threshold` times in a row.
pub fn is_stuck(history: &[ErrorFingerprint], threshold: u32) -> bool {
    threshold > 0
        && history
            .last()
            .is_some_and(|last| last.consecutive_count >= threshold)
}

/// The entry with the longest streak; ties go to the most recent.
pub fn most_common_error(history: &[ErrorFingerprint]) -> Option<&ErrorFingerprint> {
    history
        .iter()
        .enumerate()
        .max_by_key(|(i, fp)| (fp.consecutive_count, *i))
        .map(|(_, fp)| fp)
}

fn preview(text: &str) -> String {
    let cleaned = ANSI_REGEX.replace_all(text, "");
    let cleaned = WHITESPACE_REGEX.replace_all(cleaned.trim(), " ");
    if cleaned.chars().count() <= PREVIEW_LEN {
        cleaned.into_owned()
    } else {
        let cut: String = cleaned.chars().take(PREVIEW_LEN).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_run_specific_noise() {
        let a = "\x1b[31merror\x1b[0m at 2024-05-01T10:22:33.123Z in /home/alice/wt-1/src/lib.rs:42:7 (0x7ffee4b2)";
        let b = "\x1b[31merror\x1b[0m at 2025-01-09T08:00:01Z in /tmp/worktrees/S-2/src/lib.rs:99:1 (0x1000)";
        assert_eq!(normalize_error(a), normalize_error(b));
        assert!(normalize_error(a).contains("lib.rs"));
    }

    #[test]
    fn test_normalize_strips_uuids_and_durations() {
        let a = "request 123e4567-e89b-12d3-a456-426614174000 failed after 1.52s";
        let b = "request 9b2f0c1e-0000-4000-8000-000000000abc failed after 30ms";
        assert_eq!(fingerprint(a), fingerprint(b));
    }

    #[test]
    fn test_different_errors_differ() {
        assert_ne!(
            fingerprint("assertion failed: left == right"),
            fingerprint("cannot find value `x` in this scope")
        );
    }

    #[test]
    fn test_identical_errors_extend_streak() {
        let mut history = Vec::new();
        let now = Utc::now();
        for expected in 1..=4 {
            let entry = record_error(&mut history, "test foo failed at 10:00:00", now);
            assert_eq!(entry.consecutive_count, expected);
        }
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_different_error_resets_streak() {
        let mut history = Vec::new();
        let now = Utc::now();
        record_error(&mut history, "error A", now);
        record_error(&mut history, "error A", now);
        let entry = record_error(&mut history, "error B", now);
        assert_eq!(entry.consecutive_count, 1);
        let entry = record_error(&mut history, "error A", now);
        assert_eq!(entry.consecutive_count, 1);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = Vec::new();
        let now = Utc::now();
        for i in 0..15 {
            record_error(&mut history, &format!("distinct failure kind {}", "x".repeat(i)), now);
        }
        assert_eq!(history.len(), MAX_FINGERPRINT_HISTORY);
        assert!(history[0].error_preview.ends_with(&"x".repeat(5)));
    }

    #[test]
    fn test_is_stuck_at_threshold() {
        let mut history = Vec::new();
        let now = Utc::now();
        record_error(&mut history, "boom", now);
        record_error(&mut history, "boom", now);
        assert!(!is_stuck(&history, 3));
        record_error(&mut history, "boom", now);
        assert!(is_stuck(&history, 3));
    }

    #[test]
    fn test_most_common_error_prefers_recent_on_tie() {
        let mut history = Vec::new();
        let now = Utc::now();
        record_error(&mut history, "first", now);
        record_error(&mut history, "first", now);
        record_error(&mut history, "second", now);
        record_error(&mut history, "second", now);
        assert_eq!(most_common_error(&history).unwrap().error_preview, "second");

        record_error(&mut history, "third", now);
        assert_eq!(most_common_error(&history).unwrap().error_preview, "second");
        assert!(most_common_error(&[]).is_none());
    }

    #[test]
    fn test_preview_truncated() {
        let mut history = Vec::new();
        let long = "e".repeat(500);
        let entry = record_error(&mut history, &long, Utc::now());
        assert!(entry.error_preview.len() < 250);
        assert!(entry.error_preview.ends_with("..."));
    }
}
