//! Story inspection and editing: `status`, `add`, `unblock`.

use anyhow::{Context, Result, bail};
use console::style;
use sdlc::config::Config;
use sdlc::story::{Story, StoryStatus, StoryStore};
use std::path::Path;

const LAST_ERROR_WIDTH: usize = 60;

fn open_store(project_dir: &Path) -> Result<(Config, StoryStore)> {
    let config = Config::load(project_dir)?;
    let store = StoryStore::new(
        &config.stories_dir,
        config.settings.locking.to_lock_options(),
    );
    Ok((config, store))
}

pub async fn cmd_status(project_dir: &Path) -> Result<()> {
    let (config, store) = open_store(project_dir)?;
    let stories = store.list().await.context("Failed to load stories")?;

    println!();
    if stories.is_empty() {
        println!(
            "No stories in {}. Add one with 'sdlc add <id> --title <title>'.",
            config.stories_dir.display()
        );
        println!();
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:<6} {:<9} {:<9} Last error",
        "Story", "Status", "Phases", "Retries", "Recovery"
    );
    println!(
        "{:<12} {:<12} {:<6} {:<9} {:<9} ----------",
        "------------", "------------", "------", "---------", "---------"
    );
    let policy = config.settings.retries.to_retry_policy();
    for story in &stories {
        let retries = format!(
            "{}/{}",
            story.retry_count,
            sdlc::story::retry::effective_max_retries(story, &policy)
        );
        let recovery = format!(
            "{}/{}",
            story.total_recovery_attempts, policy.max_total_recovery_attempts
        );
        println!(
            "{:<12} {:<12} {:<6} {:<9} {:<9} {}",
            story.id,
            styled_status(story.status),
            phase_flags(story),
            retries,
            recovery,
            style(last_error(story)).dim()
        );
    }
    println!();

    let blocked: Vec<&Story> = stories
        .iter()
        .filter(|s| s.status == StoryStatus::Blocked)
        .collect();
    for story in &blocked {
        println!(
            "{} {} blocked: {}",
            style("!").yellow(),
            story.id,
            story.blocked_reason.as_deref().unwrap_or("no reason recorded")
        );
    }
    if !blocked.is_empty() {
        println!("Unblock with 'sdlc unblock <id>' once the cause is fixed.");
        println!();
    }
    Ok(())
}

pub async fn cmd_add(
    project_dir: &Path,
    id: &str,
    title: Option<&str>,
    dependencies: Vec<String>,
) -> Result<()> {
    let (config, store) = open_store(project_dir)?;
    config.ensure_directories()?;

    let existing = store.list().await?;
    for dep in &dependencies {
        if dep == id {
            bail!("Story {} cannot depend on itself", id);
        }
        if !existing.iter().any(|s| &s.id == dep) {
            bail!("Unknown dependency '{}': create it first", dep);
        }
    }

    let story = store.create(id, title.unwrap_or(id), dependencies).await?;
    println!(
        "Created story {} ({})",
        style(&story.id).bold(),
        store.path_for(&story.id)?.display()
    );
    Ok(())
}

pub async fn cmd_unblock(project_dir: &Path, id: &str, reset_retries: bool) -> Result<()> {
    let (_, store) = open_store(project_dir)?;
    store.load(id).await?;
    let (story, was_blocked) = store
        .update(id, |story| {
            let was_blocked = story.status == StoryStatus::Blocked;
            if was_blocked {
                story.unblock(reset_retries);
            }
            was_blocked
        })
        .await?;

    if was_blocked {
        println!("Story {} is {} again", style(&story.id).bold(), story.status);
    } else {
        println!("Story {} is not blocked ({})", story.id, story.status);
    }
    Ok(())
}

fn styled_status(status: StoryStatus) -> String {
    let text = format!("{:<12}", status.as_str());
    match status {
        StoryStatus::Done => style(text).green().to_string(),
        StoryStatus::Blocked => style(text).red().to_string(),
        StoryStatus::InProgress => style(text).yellow().to_string(),
        StoryStatus::Backlog | StoryStatus::Ready => text,
    }
}

/// `RPIV` with a dash for each phase not yet complete.
fn phase_flags(story: &Story) -> String {
    let p = &story.phases;
    [
        (p.research_complete, 'R'),
        (p.plan_complete, 'P'),
        (p.implementation_complete, 'I'),
        (p.reviews_complete, 'V'),
    ]
    .iter()
    .map(|(done, letter)| if *done { *letter } else { '-' })
    .collect()
}

fn last_error(story: &Story) -> String {
    let Some(error) = story.last_error.as_deref() else {
        return String::new();
    };
    let line = error.lines().next().unwrap_or_default();
    if line.chars().count() > LAST_ERROR_WIDTH {
        let cut: String = line.chars().take(LAST_ERROR_WIDTH - 3).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_flags() {
        let mut story = Story::new("S-1", "t", vec![]);
        assert_eq!(phase_flags(&story), "----");
        story.phases.research_complete = true;
        story.phases.plan_complete = true;
        assert_eq!(phase_flags(&story), "RP--");
    }

    #[test]
    fn test_last_error_first_line_truncated() {
        let mut story = Story::new("S-1", "t", vec![]);
        assert_eq!(last_error(&story), "");
        story.last_error = Some(format!("{}\nsecond line", "x".repeat(100)));
        let shown = last_error(&story);
        assert_eq!(shown.chars().count(), LAST_ERROR_WIDTH);
        assert!(shown.ends_with("..."));
    }
}
