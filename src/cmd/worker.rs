//! Child side of `sdlc run`: `sdlc worker --story <id>`.
//!
//! Stdout carries IPC messages only. The last message is always `complete`
//! or `error`, and the exit code is 0 only when the story reached `done`.

use anyhow::{Context, Result};
use sdlc::config::Config;
use sdlc::process::IpcMessage;
use sdlc::provider::{AiProvider, ClaudeCliProvider};
use sdlc::story::{Story, StoryStore};
use sdlc::worker::{StoryWorker, WorkerOutcome, WorkerSettings};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

const PROJECT_DIR_ENV: &str = "SDLC_PROJECT_DIR";

pub async fn cmd_worker(project_dir: Option<&Path>, story_id: &str) -> ExitCode {
    match run_worker(project_dir, story_id).await {
        Ok((outcome, story)) => {
            let (status, reason) = match &outcome {
                WorkerOutcome::Done => ("done", None),
                WorkerOutcome::Blocked { reason } => ("blocked", Some(reason.as_str())),
            };
            emit(&IpcMessage::complete(
                story_id,
                json!({
                    "status": status,
                    "reason": reason,
                    "retryCount": story.retry_count,
                    "totalRecoveryAttempts": story.total_recovery_attempts,
                }),
            ));
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!(story_id, error = %message, "Worker failed");
            emit(&IpcMessage::error(story_id, &message));
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(project_dir: Option<&Path>, story_id: &str) -> Result<(WorkerOutcome, Story)> {
    let workspace = std::env::current_dir().context("Failed to get current directory")?;
    let project_dir = match project_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var_os(PROJECT_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.clone()),
    };

    let config = Config::load(&project_dir)?;
    let settings = &config.settings;
    let store = StoryStore::new(&config.stories_dir, settings.locking.to_lock_options());

    let provider = ClaudeCliProvider::from_settings(&settings.provider);
    provider.authenticator().validate_credentials()?;

    let worker = StoryWorker::new(
        story_id,
        store.clone(),
        Arc::new(provider),
        workspace,
        WorkerSettings::from_settings(settings),
    );
    let outcome = worker.run().await?;
    let story = store.load(story_id).await?;
    Ok((outcome, story))
}

fn emit(message: &IpcMessage) {
    if let Err(e) = message.emit() {
        error!(error = %e, "Failed to write IPC message");
    }
}
