//! On-disk story storage.
//!
//! Each story lives in `<stories_dir>/<id>.md`. Every mutation goes through
//! [`StoryStore::update`]: acquire the sidecar lock, re-read the file, apply
//! the change, write it atomically, release. Readers never take the lock; the
//! temp-file-and-rename write means they always see a complete file.

use crate::errors::StoryError;
use crate::story::lock::{self, LockOptions};
use crate::story::model::Story;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const STORY_EXTENSION: &str = "md";

#[derive(Debug, Clone)]
pub struct StoryStore {
    dir: PathBuf,
    lock_options: LockOptions,
}

impl StoryStore {
    pub fn new(dir: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        Self {
            dir: dir.into(),
            lock_options,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf, StoryError> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoryError::InvalidId { id: id.to_string() });
        }
        Ok(self.dir.join(format!("{}.{}", id, STORY_EXTENSION)))
    }

    /// Create a new story in `backlog`.
    pub async fn create(
        &self,
        id: &str,
        title: &str,
        dependencies: Vec<String>,
    ) -> Result<Story, StoryError> {
        let path = self.path_for(id)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| StoryError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let guard = lock::acquire(&path, &self.lock_options).await?;
        if path.exists() {
            return Err(StoryError::AlreadyExists { id: id.to_string() });
        }
        let story = Story::new(id, title, dependencies);
        write_story(&path, &story)?;
        guard.release()?;

        debug!(story_id = id, "Created story");
        Ok(story)
    }

    pub async fn load(&self, id: &str) -> Result<Story, StoryError> {
        let path = self.path_for(id)?;
        read_story(&path, id)
    }

    /// All stories in the directory, sorted by id.
    pub async fn list(&self) -> Result<Vec<Story>, StoryError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoryError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut stories = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoryError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STORY_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            stories.push(read_story(&path, id)?);
        }
        stories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stories)
    }

    /// Locked read-modify-write of one story.
    ///
    /// `f` sees the state as persisted at lock time; whatever it leaves in the
    /// story is written back before the lock is released.
    pub async fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Story) -> R,
    ) -> Result<(Story, R), StoryError> {
        let path = self.path_for(id)?;
        let guard = lock::acquire(&path, &self.lock_options).await?;

        let mut story = read_story(&path, id)?;
        let out = f(&mut story);
        story.touch();
        write_story(&path, &story)?;

        guard.release()?;
        Ok((story, out))
    }
}

fn read_story(path: &Path, id: &str) -> Result<Story, StoryError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StoryError::NotFound { id: id.to_string() });
        }
        Err(source) => {
            return Err(StoryError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Story::parse(&content, path)
}

/// Write `content` to a sibling temp file, fsync, then rename over `path`.
pub fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn write_story(path: &Path, story: &Story) -> Result<(), StoryError> {
    write_atomically(path, &story.to_markdown()?).map_err(|source| StoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::lock::lock_path_for;
    use crate::story::model::StoryStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    fn store(dir: &Path) -> StoryStore {
        StoryStore::new(
            dir.join("stories"),
            LockOptions {
                timeout: Duration::from_secs(10),
                stale_after: Duration::from_secs(10),
                retry_interval: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.create("S-1", "Login", vec![]).await.unwrap();
        let loaded = store.load("S-1").await.unwrap();

        assert_eq!(loaded.id, "S-1");
        assert_eq!(loaded.title, "Login");
        assert_eq!(loaded.status, StoryStatus::Backlog);
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create("S-1", "Login", vec![]).await.unwrap();

        let err = store.create("S-1", "Again", vec![]).await.unwrap_err();
        assert!(matches!(err, StoryError::AlreadyExists { .. }));
        assert!(!lock_path_for(&store.path_for("S-1").unwrap()).exists());
    }

    #[tokio::test]
    async fn test_load_missing() {
        let dir = tempdir().unwrap();
        let err = store(dir.path()).load("S-404").await.unwrap_err();
        assert!(matches!(err, StoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        for id in ["", "../etc/passwd", "a/b", ".hidden"] {
            assert!(matches!(
                store.load(id).await.unwrap_err(),
                StoryError::InvalidId { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_update_persists_changes() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create("S-1", "Login", vec![]).await.unwrap();

        let (story, previous) = store
            .update("S-1", |s| {
                let prev = s.status;
                s.move_to(StoryStatus::InProgress);
                s.phases.research_complete = true;
                prev
            })
            .await
            .unwrap();

        assert_eq!(previous, StoryStatus::Backlog);
        assert_eq!(story.status, StoryStatus::InProgress);
        let reloaded = store.load("S-1").await.unwrap();
        assert!(reloaded.phases.research_complete);
    }

    #[tokio::test]
    async fn test_list_sorted_and_skips_artifacts() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create("S-2", "b", vec![]).await.unwrap();
        store.create("S-1", "a", vec![]).await.unwrap();
        std::fs::write(store.dir().join("notes.txt"), "x").unwrap();

        let ids: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["S-1", "S-2"]);
    }

    #[tokio::test]
    async fn test_list_empty_dir_missing() {
        let dir = tempdir().unwrap();
        assert!(store(dir.path()).list().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_leave_valid_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create("S-1", "Login", vec![]).await.unwrap();

        let mut handles = Vec::new();
        for writer in 0..5u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update("S-1", move |s| match writer {
                        0 => s.retry_count = 7,
                        1 => s.phases.plan_complete = true,
                        2 => s.total_recovery_attempts = 4,
                        3 => s.last_error = Some("flaky".into()),
                        _ => {
                            s.record_refinement_iteration("writer 4");
                        }
                    })
                    .await
                    .map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let story = store.load("S-1").await.unwrap();
        assert_eq!(story.retry_count, 7);
        assert!(story.phases.plan_complete);
        assert_eq!(story.total_recovery_attempts, 4);
        assert_eq!(story.last_error.as_deref(), Some("flaky"));
        assert_eq!(story.refinement_iterations.len(), 1);

        let leftovers: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "S-1.md")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    #[test]
    fn test_write_atomically_replaces_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("S-1.md");
        write_atomically(&path, "one").unwrap();
        write_atomically(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
