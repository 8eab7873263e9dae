//! Running reviewer roles through the AI provider.
//!
//! Each role gets its own prompt and answers with a JSON verdict. The JSON is
//! pulled out of whatever prose surrounds it and turned into an
//! [`AgentOutput`]. A reply that cannot be parsed counts as a rejection, so a
//! confused reviewer never waves a change through.

use crate::config::ReviewerRole;
use crate::provider::AiProvider;
use crate::review::{AgentOutput, Concern, FeedbackContext, ReviewExecutor, Severity};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs a fixed set of reviewer roles against one story's workspace.
pub struct ProviderReviewExecutor {
    provider: Arc<dyn AiProvider>,
    roles: Vec<ReviewerRole>,
    story_context: String,
    workspace: PathBuf,
    timeout: Option<Duration>,
}

impl ProviderReviewExecutor {
    pub fn new(
        provider: Arc<dyn AiProvider>,
        roles: Vec<ReviewerRole>,
        story_context: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            roles,
            story_context: story_context.into(),
            workspace: workspace.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// First review round, no feedback yet.
    pub async fn initial_round(&self) -> Result<Vec<AgentOutput>> {
        self.run_round(1, None).await
    }

    async fn run_round(
        &self,
        iteration: u32,
        feedback: Option<&FeedbackContext>,
    ) -> Result<Vec<AgentOutput>> {
        let queries = self.roles.iter().map(|role| {
            let prompt = build_review_prompt(*role, &self.story_context, feedback);
            async move {
                let reply = self
                    .provider
                    .query(&prompt, None, Some(self.workspace.as_path()), self.timeout)
                    .await?;
                let agent_id = format!("{}-{}", role.as_str(), iteration);
                Ok::<_, anyhow::Error>(
                    parse_reviewer_output(&reply, &agent_id, *role).with_iteration(iteration),
                )
            }
        });

        let outputs = join_all(queries)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        debug!(
            iteration,
            approvals = outputs.iter().filter(|o| o.approved).count(),
            total = outputs.len(),
            "Review round finished"
        );
        Ok(outputs)
    }
}

#[async_trait]
impl ReviewExecutor for ProviderReviewExecutor {
    async fn execute(&self, context: &FeedbackContext) -> Result<Vec<AgentOutput>> {
        self.run_round(context.iteration, Some(context)).await
    }
}

pub fn build_review_prompt(
    role: ReviewerRole,
    story_context: &str,
    feedback: Option<&FeedbackContext>,
) -> String {
    let feedback_section = feedback
        .map(|f| {
            format!(
                "\n## Previous Round\n\nThe implementation was revised after the last review. \
                 Check whether these concerns are resolved:\n\n{}\n",
                f.to_prompt()
            )
        })
        .unwrap_or_default();

    format!(
        r#"# {role} Review

You are reviewing the implementation of a story in the current working directory.
Your focus: {focus}.

## Story

{story_context}
{feedback_section}
## Output Format

Respond with a JSON object:

```json
{{
  "approved": true,
  "summary": "One or two sentences",
  "concerns": [
    {{
      "severity": "blocker|warning|suggestion",
      "category": "security",
      "description": "What is wrong",
      "file": "src/lib.rs",
      "line": 42,
      "suggested_fix": "How to fix it"
    }}
  ]
}}
```

Only approve when nothing in your focus area blocks release.
"#,
        role = role,
        focus = role.focus(),
    )
}

/// Turn a reviewer's reply into an [`AgentOutput`].
pub fn parse_reviewer_output(reply: &str, agent_id: &str, role: ReviewerRole) -> AgentOutput {
    let parsed = extract_json(reply)
        .and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
        .filter(|value| value.is_object());

    let Some(value) = parsed else {
        warn!(agent_id, "Reviewer output could not be parsed, treating as rejection");
        return AgentOutput::new(agent_id, role, false)
            .with_content(reply)
            .with_concern(Concern::new(
                Severity::Warning,
                "review",
                "Reviewer output could not be parsed",
            ));
    };

    let concerns: Vec<Concern> = value
        .get("concerns")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(parse_concern).collect())
        .unwrap_or_default();

    let approved = value
        .get("approved")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let summary = value
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    AgentOutput::new(agent_id, role, approved)
        .with_content(summary)
        .with_concerns(concerns)
}

fn parse_concern(value: &serde_json::Value) -> Option<Concern> {
    let description = value.get("description").and_then(|v| v.as_str())?;
    let severity = match value
        .get("severity")
        .and_then(|v| v.as_str())
        .unwrap_or("warning")
        .to_lowercase()
        .as_str()
    {
        "blocker" | "critical" | "error" => Severity::Blocker,
        "suggestion" | "info" | "note" => Severity::Suggestion,
        _ => Severity::Warning,
    };
    let category = value
        .get("category")
        .and_then(|v| v.as_str())
        .unwrap_or("general");

    let mut concern = Concern::new(severity, category, description);
    if let Some(file) = value.get("file").and_then(|v| v.as_str()) {
        concern = concern.with_file(file);
    }
    if let Some(line) = value.get("line").and_then(|v| v.as_u64()) {
        concern = concern.with_line(line as u32);
    }
    if let Some(fix) = value.get("suggested_fix").and_then(|v| v.as_str()) {
        concern = concern.with_suggested_fix(fix);
    }
    Some(concern)
}

/// Pull a JSON object out of a reply that may wrap it in markdown or prose.
fn extract_json(output: &str) -> Option<String> {
    if let Some(start) = output.find("```json") {
        let after_marker = &output[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    let start = output.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in output[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(output[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
