//! Story execution: `sdlc run`.

use anyhow::{Context, Result};
use console::style;
use sdlc::config::{Config, FailurePolicy, IsolationMode};
use sdlc::dag::WorkItem;
use sdlc::process::{
    ExecutionSummary, IpcMessageType, OrchestratorEvent, OrchestratorOptions, OrchestratorState,
    ProcessManager, ProcessOrchestrator, Signal,
};
use sdlc::story::{Story, StoryStatus, StoryStore};
use sdlc::workflow_state::{self, WorkflowState};
use sdlc::worktree::WorktreeService;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Exit code after an interrupted run, as a shell would report SIGINT.
const INTERRUPTED_EXIT: u8 = 130;

pub async fn cmd_run(
    project_dir: &Path,
    concurrency: Option<usize>,
    abort_on_failure: bool,
    resume: bool,
) -> Result<ExitCode> {
    let config = Config::load(project_dir)?;
    config.ensure_directories()?;
    let settings = &config.settings;

    let store = StoryStore::new(&config.stories_dir, settings.locking.to_lock_options());
    let stories = store.list().await.context("Failed to load stories")?;

    let previous = if resume {
        workflow_state::load(&config.state_file)?
    } else {
        None
    };
    let concurrency = concurrency.unwrap_or(settings.orchestrator.concurrency).max(1);
    let failure_policy = if abort_on_failure {
        FailurePolicy::Abort
    } else {
        settings.orchestrator.failure_policy
    };

    let state = match previous {
        Some(state) => {
            info!(
                workflow_id = %state.workflow_id,
                completed = state.completed_actions.len(),
                "Resuming workflow"
            );
            state
        }
        None => WorkflowState::new(
            &config.sdlc_root,
            json!({
                "concurrency": concurrency,
                "failurePolicy": failure_policy,
            }),
        ),
    };

    let items = build_work_items(&stories, &state.completed_actions);
    if items.is_empty() {
        println!();
        if stories.is_empty() {
            println!("No stories found. Add one with 'sdlc add <id> --title <title>'.");
        } else {
            println!("Nothing to run: every story is done.");
        }
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    let mut options = OrchestratorOptions::new(&config.project_dir, config.worker_program()?)
        .with_args(settings.project.worker_args.clone())
        .with_failure_policy(failure_policy)
        .with_shutdown_timeout(config.shutdown_timeout());
    if settings.orchestrator.isolation == IsolationMode::Worktree {
        options = options.with_worktrees(settings.project.base_branch.clone());
    }

    let processes = ProcessManager::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut orchestrator =
        ProcessOrchestrator::new(options, Arc::clone(&processes)).with_event_channel(tx);
    if settings.orchestrator.isolation == IsolationMode::Worktree {
        orchestrator = orchestrator.with_worktrees(WorktreeService::new(
            &config.project_dir,
            &config.worktree_base,
        ));
    }
    let orchestrator = Arc::new(orchestrator);

    println!();
    println!(
        "{} Running {} stories with up to {} workers",
        style("sdlc").bold().cyan(),
        items.len(),
        concurrency
    );
    println!();

    workflow_state::save(&config.state_file, &state)?;
    let events = tokio::spawn(report_events(rx, state, config.state_file.clone()));
    let signals = tokio::spawn(handle_interrupts(
        Arc::clone(&orchestrator),
        Arc::clone(&processes),
    ));

    let outcome = orchestrator.execute(items, concurrency).await;
    signals.abort();
    let _ = signals.await;
    // Dropping the orchestrator closes the event channel.
    drop(orchestrator);
    let state = events.await.context("Event reporter failed")?;

    let summary = outcome?;
    print_summary(&summary);

    if summary.all_success() {
        workflow_state::clear(&config.state_file)?;
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "Workflow {} saved; rerun with 'sdlc run --resume' to skip finished stories.",
        state.workflow_id
    );
    println!();
    if summary.state == OrchestratorState::Shutdown {
        return Ok(ExitCode::from(INTERRUPTED_EXIT));
    }
    Ok(ExitCode::FAILURE)
}

/// Work items for every story that still needs a worker.
///
/// Done stories and ids in `completed` are left out, and so are dependencies
/// on them: a finished story no longer constrains ordering.
fn build_work_items(stories: &[Story], completed: &[String]) -> Vec<WorkItem> {
    let finished: HashSet<&str> = stories
        .iter()
        .filter(|s| s.status == StoryStatus::Done)
        .map(|s| s.id.as_str())
        .chain(completed.iter().map(String::as_str))
        .collect();

    stories
        .iter()
        .filter(|s| !finished.contains(s.id.as_str()))
        .map(|story| {
            let dependencies = story
                .dependencies
                .iter()
                .filter(|dep| !finished.contains(dep.as_str()))
                .cloned()
                .collect();
            WorkItem::new(story.id.clone(), dependencies)
                .with_payload(json!({ "title": story.title, "slug": story.slug() }))
        })
        .collect()
}

/// Print progress and record finished stories in the workflow state.
async fn report_events(
    mut rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    mut state: WorkflowState,
    state_file: PathBuf,
) -> WorkflowState {
    while let Some(event) = rx.recv().await {
        match event {
            OrchestratorEvent::PhaseStarted { index, items } => {
                println!(
                    "{} Phase {}: {}",
                    style("▶").cyan(),
                    index,
                    items.join(", ")
                );
            }
            OrchestratorEvent::Spawned { story_id, .. } => {
                state.start_action(&story_id);
            }
            OrchestratorEvent::Progress { story_id, message } => {
                let text = message.payload["message"].as_str().unwrap_or_default();
                match message.kind {
                    IpcMessageType::Error => {
                        println!("  {} {}: {}", style("!").yellow(), story_id, text)
                    }
                    _ => {
                        let phase = message.payload["phase"].as_str().unwrap_or("status");
                        println!(
                            "  {} {} [{}] {}",
                            style("·").dim(),
                            story_id,
                            phase,
                            text
                        );
                    }
                }
            }
            OrchestratorEvent::Closed { result, active } => {
                if result.success {
                    println!(
                        "  {} {} done in {:.1}s ({} running)",
                        style("✓").green(),
                        result.story_id,
                        result.duration.as_secs_f64(),
                        active
                    );
                    state.mark_action_complete(&result.story_id);
                } else {
                    println!(
                        "  {} {} failed: {}",
                        style("✗").red(),
                        result.story_id,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                if let Err(e) = workflow_state::save(&state_file, &state) {
                    warn!(error = %e, "Failed to save workflow state");
                }
            }
            OrchestratorEvent::PhaseCompleted {
                index,
                succeeded,
                failed,
            } => {
                println!(
                    "{} Phase {} finished: {} succeeded, {} failed",
                    style("■").dim(),
                    index,
                    succeeded,
                    failed
                );
                println!();
            }
        }
    }
    state
}

/// First Ctrl-C drains gracefully, a second one kills every worker at once.
async fn handle_interrupts(orchestrator: Arc<ProcessOrchestrator>, processes: Arc<ProcessManager>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!(
        "{}",
        style("Interrupted: stopping workers (press Ctrl-C again to force)").yellow()
    );

    let shutdown = orchestrator.shutdown();
    tokio::pin!(shutdown);
    tokio::select! {
        _ = &mut shutdown => {}
        _ = tokio::signal::ctrl_c() => {
            let killed = processes.kill_all(Signal::Kill);
            eprintln!("{}", style(format!("Killed {} workers", killed)).red());
        }
    }
}

fn print_summary(summary: &ExecutionSummary) {
    println!(
        "{} {}/{} stories succeeded in {:.1}s",
        style("Summary:").bold(),
        summary.succeeded(),
        summary.total_items,
        summary.duration.as_secs_f64()
    );
    for result in summary.results().filter(|r| !r.success) {
        println!(
            "  {} {}: {}",
            style("✗").red(),
            result.story_id,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    if !summary.skipped.is_empty() {
        println!(
            "  {} not started: {}",
            style("-").dim(),
            summary.skipped.join(", ")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, deps: &[&str], status: StoryStatus) -> Story {
        let deps = deps.iter().map(|d| d.to_string()).collect();
        let mut story = Story::new(id, format!("Story {}", id), deps);
        story.status = status;
        story
    }

    #[test]
    fn test_build_work_items_skips_done_and_their_edges() {
        let stories = vec![
            story("S-1", &[], StoryStatus::Done),
            story("S-2", &["S-1"], StoryStatus::Backlog),
            story("S-3", &["S-2"], StoryStatus::InProgress),
        ];
        let items = build_work_items(&stories, &[]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "S-2");
        assert!(items[0].dependencies.is_empty());
        assert_eq!(items[1].dependencies, vec!["S-2"]);
        assert_eq!(items[1].payload["title"], "Story S-3");
    }

    #[test]
    fn test_build_work_items_skips_completed_actions() {
        let stories = vec![
            story("S-1", &[], StoryStatus::InProgress),
            story("S-2", &["S-1"], StoryStatus::Backlog),
        ];
        let items = build_work_items(&stories, &["S-1".to_string()]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "S-2");
        assert!(items[0].dependencies.is_empty());
    }
}
