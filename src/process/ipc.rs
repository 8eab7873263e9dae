//! Parent/worker messages.
//!
//! Workers write one JSON object per line on stdout. Anything on stdout that
//! does not start with `{` is treated as stray output and ignored; a line
//! that looks like JSON but does not decode is an IPC failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcMessageType {
    StatusUpdate,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub kind: IpcMessageType,
    pub story_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl IpcMessage {
    pub fn new(kind: IpcMessageType, story_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            story_id: story_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn status(story_id: &str, phase: &str, message: &str) -> Self {
        Self::new(
            IpcMessageType::StatusUpdate,
            story_id,
            serde_json::json!({ "phase": phase, "message": message }),
        )
    }

    pub fn complete(story_id: &str, payload: serde_json::Value) -> Self {
        Self::new(IpcMessageType::Complete, story_id, payload)
    }

    pub fn error(story_id: &str, message: &str) -> Self {
        Self::new(
            IpcMessageType::Error,
            story_id,
            serde_json::json!({ "message": message }),
        )
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Write this message to stdout and flush.
    pub fn emit(&self) -> std::io::Result<()> {
        let line = self.to_line().map_err(std::io::Error::other)?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.flush()
    }
}

/// What a line of worker stdout turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Message(IpcMessage),
    /// Looked like a message but did not decode.
    Malformed { line: String, error: String },
    /// Not a message at all.
    Text(String),
}

pub fn decode_line(line: &str) -> DecodedLine {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return DecodedLine::Text(trimmed.to_string());
    }
    match serde_json::from_str::<IpcMessage>(trimmed) {
        Ok(msg) => DecodedLine::Message(msg),
        Err(e) => DecodedLine::Malformed {
            line: trimmed.to_string(),
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_camel_case() {
        let msg = IpcMessage::status("S-1", "plan", "planning");
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["storyId"], "S-1");
        assert_eq!(value["payload"]["phase"], "plan");
    }

    #[test]
    fn test_decode_message() {
        let line = r#"{"type":"complete","storyId":"S-2","timestamp":"2024-01-01T00:00:00Z","payload":{"status":"done"}}"#;
        match decode_line(line) {
            DecodedLine::Message(msg) => {
                assert_eq!(msg.kind, IpcMessageType::Complete);
                assert_eq!(msg.story_id, "S-2");
                assert_eq!(msg.payload["status"], "done");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_missing_payload_defaults_to_null() {
        let line = r#"{"type":"error","storyId":"S-2","timestamp":"2024-01-01T00:00:00Z"}"#;
        let DecodedLine::Message(msg) = decode_line(line) else {
            panic!("expected message");
        };
        assert!(msg.payload.is_null());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode_line(r#"{"type":"bogus"}"#),
            DecodedLine::Malformed { .. }
        ));
        assert!(matches!(decode_line("{not json"), DecodedLine::Malformed { .. }));
    }

    #[test]
    fn test_decode_plain_text() {
        assert_eq!(
            decode_line("Compiling foo v0.1.0\n"),
            DecodedLine::Text("Compiling foo v0.1.0".to_string())
        );
    }
}
