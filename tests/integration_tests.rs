//! Integration tests for the sdlc CLI.
//!
//! `run` is exercised with a shell script standing in for the worker, so no
//! AI provider is needed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn sdlc() -> Command {
    cargo_bin_cmd!("sdlc")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn add_story(dir: &TempDir, id: &str, depends_on: Option<&str>) {
    let mut cmd = sdlc();
    cmd.current_dir(dir.path()).args(["add", id, "--title", &format!("Story {}", id)]);
    if let Some(dep) = depends_on {
        cmd.args(["--depends-on", dep]);
    }
    cmd.assert().success();
}

/// Worker stand-in: logs its story id, fails when `fail-<id>` exists,
/// otherwise reports completion over IPC.
fn install_fake_worker(dir: &TempDir) -> PathBuf {
    let script = dir.path().join("fake-worker.sh");
    let root = dir.path().display();
    fs::write(
        &script,
        format!(
            r#"#!/bin/sh
echo "$SDLC_STORY_ID" >> "{root}/ran.log"
if [ -f "{root}/fail-$SDLC_STORY_ID" ]; then
  exit 3
fi
echo '{{"type":"status_update","storyId":"'"$SDLC_STORY_ID"'","timestamp":"2026-01-01T00:00:00Z","payload":{{"phase":"implement","message":"working"}}}}'
echo '{{"type":"complete","storyId":"'"$SDLC_STORY_ID"'","timestamp":"2026-01-01T00:00:00Z","payload":{{"status":"done"}}}}'
"#
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    fs::create_dir_all(dir.path().join(".sdlc")).unwrap();
    fs::write(
        dir.path().join(".sdlc/config.toml"),
        format!(
            "[project]\nworker_cmd = \"{}\"\nworker_args = []\n\n[orchestrator]\nisolation = \"shared\"\n",
            script.display()
        ),
    )
    .unwrap();
    script
}

fn ran(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("ran.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_sdlc_help() {
        sdlc()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("worktree"));
    }

    #[test]
    fn test_sdlc_version() {
        sdlc().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        sdlc().arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".sdlc")).unwrap();
        fs::write(
            dir.path().join(".sdlc/config.toml"),
            "[orchestrator]\nconcurrency = 0\n",
        )
        .unwrap();

        sdlc()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("concurrency"));
    }
}

mod stories {
    use super::*;

    #[test]
    fn test_status_without_stories() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No stories"));
    }

    #[test]
    fn test_add_then_status() {
        let dir = create_temp_project();
        add_story(&dir, "S-1", None);
        add_story(&dir, "S-2", Some("S-1"));

        assert!(dir.path().join(".sdlc/stories/S-1.md").exists());
        sdlc()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("S-1"))
            .stdout(predicate::str::contains("S-2"))
            .stdout(predicate::str::contains("backlog"));
    }

    #[test]
    fn test_add_rejects_unknown_dependency() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .args(["add", "S-1", "--depends-on", "S-9"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown dependency"));
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let dir = create_temp_project();
        add_story(&dir, "S-1", None);
        sdlc()
            .current_dir(dir.path())
            .args(["add", "S-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_unblock_story_that_is_not_blocked() {
        let dir = create_temp_project();
        add_story(&dir, "S-1", None);
        sdlc()
            .current_dir(dir.path())
            .args(["unblock", "S-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not blocked"));
    }

    #[test]
    fn test_unblock_missing_story_fails() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .args(["unblock", "S-404"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

mod worktrees {
    use super::*;

    #[test]
    fn test_worktree_list_empty() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .args(["worktree", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No worktrees"));
    }

    #[test]
    fn test_worktree_remove_unknown_story() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .args(["worktree", "remove", "S-1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No worktree found"));
    }
}

mod run {
    use super::*;

    #[test]
    fn test_run_without_stories() {
        let dir = create_temp_project();
        sdlc()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("No stories found"));
    }

    #[test]
    fn test_run_executes_every_story_in_dependency_order() {
        let dir = create_temp_project();
        install_fake_worker(&dir);
        add_story(&dir, "S-1", None);
        add_story(&dir, "S-2", Some("S-1"));
        add_story(&dir, "S-3", Some("S-2"));

        sdlc()
            .current_dir(dir.path())
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("3/3 stories succeeded"));

        assert_eq!(ran(dir.path()), vec!["S-1", "S-2", "S-3"]);
        assert!(!dir.path().join(".sdlc/workflow-state.json").exists());
    }

    #[test]
    fn test_failed_run_can_resume() {
        let dir = create_temp_project();
        install_fake_worker(&dir);
        add_story(&dir, "S-1", None);
        add_story(&dir, "S-2", None);
        fs::write(dir.path().join("fail-S-2"), "").unwrap();

        sdlc()
            .current_dir(dir.path())
            .args(["run", "--concurrency", "1"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("S-2 failed"));
        assert!(dir.path().join(".sdlc/workflow-state.json").exists());

        fs::remove_file(dir.path().join("fail-S-2")).unwrap();
        fs::remove_file(dir.path().join("ran.log")).unwrap();

        sdlc()
            .current_dir(dir.path())
            .args(["run", "--resume"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1/1 stories succeeded"));
        assert_eq!(ran(dir.path()), vec!["S-2"]);
    }

    #[test]
    fn test_abort_on_failure_skips_later_phases() {
        let dir = create_temp_project();
        install_fake_worker(&dir);
        add_story(&dir, "S-1", None);
        add_story(&dir, "S-2", Some("S-1"));
        fs::write(dir.path().join("fail-S-1"), "").unwrap();

        sdlc()
            .current_dir(dir.path())
            .args(["run", "--abort-on-failure"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("not started: S-2"));
        assert_eq!(ran(dir.path()), vec!["S-1"]);
    }
}

mod worker {
    use super::*;

    #[test]
    fn test_worker_reports_error_over_ipc() {
        let dir = create_temp_project();
        add_story(&dir, "S-1", None);

        sdlc()
            .current_dir(dir.path())
            .env("SDLC_PROVIDER_CMD", "/nonexistent/claude")
            .args(["worker", "--story", "S-1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains(r#""type":"error""#))
            .stdout(predicate::str::contains("not found on PATH"));
    }
}
