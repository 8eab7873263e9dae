//! Per-story git worktrees.
//!
//! Every concurrently running story gets its own branch checked out into a
//! directory under the configured base path, so workers never write to the
//! same files. Branches follow `story/<story-id>/<slug>`; `list` recovers the
//! story id from that convention.

use crate::errors::WorktreeError;
use git2::{
    BranchType, IndexAddOption, Repository, Signature, StatusOptions, WorktreeAddOptions,
    WorktreePruneOptions,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BRANCH_PREFIX: &str = "story/";
const MAX_SLUG_LEN: usize = 40;

/// A worktree found under the base path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    /// Parsed from the branch name; `None` for branches outside the convention.
    pub story_id: Option<String>,
}

/// Creates, lists and removes story worktrees for one repository.
#[derive(Debug, Clone)]
pub struct WorktreeService {
    repo_root: PathBuf,
    base_path: PathBuf,
}

impl WorktreeService {
    pub fn new(repo_root: impl Into<PathBuf>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Deterministic branch name for a story.
    pub fn branch_name(story_id: &str, slug: &str) -> String {
        format!("{}{}/{}", BRANCH_PREFIX, sanitize(story_id), slugify(slug))
    }

    /// Directory a story's worktree lives in.
    pub fn path_for(&self, story_id: &str, slug: &str) -> PathBuf {
        self.base_path.join(worktree_name(story_id, slug))
    }

    /// Create a branch for the story off `base_branch` and check it out into a
    /// fresh directory under the base path.
    ///
    /// An existing story branch is reused so a restarted run picks up earlier
    /// commits. Fails with `AlreadyExists` if the target directory is present
    /// and non-empty.
    pub fn create(
        &self,
        story_id: &str,
        slug: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        let path = self.path_for(story_id, slug);
        if path.exists() {
            if std::fs::read_dir(&path)?.next().is_some() {
                return Err(WorktreeError::AlreadyExists { path });
            }
            // libgit2 refuses to check out into an existing directory.
            std::fs::remove_dir(&path)?;
        }
        std::fs::create_dir_all(&self.base_path)?;

        let repo = Repository::open(&self.repo_root)?;
        let branch_name = Self::branch_name(story_id, slug);

        let branch = match repo.find_branch(&branch_name, BranchType::Local) {
            Ok(existing) => {
                debug!(branch = %branch_name, "Reusing existing story branch");
                existing
            }
            Err(_) => {
                let base_commit = resolve_commit(&repo, base_branch)?;
                repo.branch(&branch_name, &base_commit, false)?
            }
        };

        let name = worktree_name(story_id, slug);
        // A previous run may have left admin files behind for a deleted directory.
        if let Ok(stale) = repo.find_worktree(&name)
            && stale.validate().is_err()
        {
            let mut prune = WorktreePruneOptions::new();
            prune.valid(true);
            stale.prune(Some(&mut prune))?;
        }

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch.get()));
        repo.worktree(&name, &path, Some(&opts))?;

        info!(story_id, branch = %branch_name, path = %path.display(), "Created worktree");
        Ok(path)
    }

    /// Delete a worktree directory and its git bookkeeping. The branch is kept.
    ///
    /// Refuses with `Dirty` when the worktree has uncommitted or untracked
    /// changes, unless `force` is set.
    pub fn remove(&self, path: &Path, force: bool) -> Result<(), WorktreeError> {
        if !path.exists() {
            return Err(WorktreeError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let path = self.ensure_within_base(path)?;

        if !force && is_dirty(&path)? {
            return Err(WorktreeError::Dirty { path });
        }

        let repo = Repository::open(&self.repo_root)?;
        let registered = repo.worktrees()?;
        for name in registered.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            let matches = worktree
                .path()
                .canonicalize()
                .map(|p| p == path)
                .unwrap_or(false);
            if matches {
                let mut prune = WorktreePruneOptions::new();
                prune.valid(true).locked(force).working_tree(true);
                worktree.prune(Some(&mut prune))?;
                break;
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        info!(path = %path.display(), "Removed worktree");
        Ok(())
    }

    /// Enumerate worktrees under the base path.
    ///
    /// Entries that resolve outside the base path (symlinks, for instance) are
    /// skipped even if they are valid worktrees.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }
        let base = self.base_path.canonicalize()?;

        let mut found = Vec::new();
        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            let Ok(path) = entry.path().canonicalize() else {
                continue;
            };
            if !path.is_dir() || !path.starts_with(&base) {
                continue;
            }
            let Ok(repo) = Repository::open(&path) else {
                continue;
            };
            if !repo.is_worktree() {
                continue;
            }
            let branch = repo
                .head()
                .ok()
                .and_then(|head| head.shorthand().map(String::from));
            let story_id = branch.as_deref().and_then(parse_story_id);
            found.push(WorktreeInfo {
                path,
                branch,
                story_id,
            });
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    /// The worktree currently checked out for a story, if any.
    pub fn find_for_story(&self, story_id: &str) -> Result<Option<WorktreeInfo>, WorktreeError> {
        let wanted = sanitize(story_id);
        Ok(self
            .list()?
            .into_iter()
            .find(|info| info.story_id.as_deref() == Some(wanted.as_str())))
    }

    fn ensure_within_base(&self, path: &Path) -> Result<PathBuf, WorktreeError> {
        let canonical = path.canonicalize()?;
        let base = self
            .base_path
            .canonicalize()
            .map_err(|_| WorktreeError::OutsideBasePath {
                path: canonical.clone(),
            })?;
        if canonical == base || !canonical.starts_with(&base) {
            return Err(WorktreeError::OutsideBasePath { path: canonical });
        }
        Ok(canonical)
    }
}

/// Whether the worktree at `path` has uncommitted or untracked changes.
pub fn is_dirty(path: &Path) -> Result<bool, WorktreeError> {
    let repo = Repository::open(path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    Ok(!statuses.is_empty())
}

/// Stage everything in the worktree at `path` and commit it on the checked-out
/// branch. Returns the new commit id, or `None` when there was nothing to commit.
pub fn commit_all(path: &Path, message: &str) -> Result<Option<String>, WorktreeError> {
    if !is_dirty(path)? {
        return Ok(None);
    }
    let repo = Repository::open(path)?;
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["*"].iter(), None)?;
    index.write()?;

    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("sdlc", "sdlc@localhost"))?;
    let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    debug!(path = %path.display(), commit = %id, "Committed worktree changes");
    Ok(Some(id.to_string()))
}

/// Extract the story id from a `story/<id>/<slug>` branch name.
pub fn parse_story_id(branch: &str) -> Option<String> {
    let rest = branch.strip_prefix(BRANCH_PREFIX)?;
    let (id, slug) = rest.split_once('/')?;
    if id.is_empty() || slug.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// Lowercase, dash-separated form of a title suitable for branch names.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        "story".to_string()
    } else {
        slug
    }
}

fn sanitize(story_id: &str) -> String {
    story_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn worktree_name(story_id: &str, slug: &str) -> String {
    format!("{}-{}", sanitize(story_id), slugify(slug))
}

fn resolve_commit<'r>(repo: &'r Repository, base: &str) -> Result<git2::Commit<'r>, git2::Error> {
    match repo.find_branch(base, BranchType::Local) {
        Ok(branch) => branch.get().peel_to_commit(),
        Err(_) => repo.revparse_single(base)?.peel_to_commit(),
    }
}
