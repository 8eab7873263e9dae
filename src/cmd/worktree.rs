//! Story worktree housekeeping: `sdlc worktree list|remove`.

use anyhow::{Result, bail};
use console::style;
use sdlc::config::Config;
use sdlc::worktree::WorktreeService;
use std::path::Path;

use super::super::WorktreeCommands;

pub fn cmd_worktree(project_dir: &Path, command: WorktreeCommands) -> Result<()> {
    let config = Config::load(project_dir)?;
    let service = WorktreeService::new(&config.project_dir, &config.worktree_base);

    match command {
        WorktreeCommands::List => {
            let worktrees = service.list()?;
            println!();
            if worktrees.is_empty() {
                println!("No worktrees under {}", config.worktree_base.display());
                println!();
                return Ok(());
            }
            println!("{:<12} {:<40} Path", "Story", "Branch");
            println!("{:<12} {:<40} ----", "------------", "-".repeat(40));
            for info in &worktrees {
                let dirty = sdlc::worktree::is_dirty(&info.path).unwrap_or(false);
                println!(
                    "{:<12} {:<40} {}{}",
                    info.story_id.as_deref().unwrap_or("?"),
                    info.branch.as_deref().unwrap_or("(detached)"),
                    info.path.display(),
                    if dirty {
                        style(" (uncommitted changes)").yellow().to_string()
                    } else {
                        String::new()
                    }
                );
            }
            println!();
        }
        WorktreeCommands::Remove { story, force } => {
            let Some(info) = service.find_for_story(&story)? else {
                bail!("No worktree found for story {}", story);
            };
            service.remove(&info.path, force)?;
            println!(
                "Removed worktree for {} ({})",
                style(&story).bold(),
                info.path.display()
            );
        }
    }
    Ok(())
}
