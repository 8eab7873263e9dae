//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled              |
//! |------------|-------------------------------|
//! | `run`      | `Run`                         |
//! | `worker`   | `Worker`                      |
//! | `story`    | `Status`, `Add`, `Unblock`    |
//! | `worktree` | `Worktree`                    |

pub mod run;
pub mod story;
pub mod worker;
pub mod worktree;

pub use run::cmd_run;
pub use story::{cmd_add, cmd_status, cmd_unblock};
pub use worker::cmd_worker;
pub use worktree::cmd_worktree;

use sdlc::config::SDLC_DIR;
use std::path::{Path, PathBuf};

/// Where the log file goes. Only used if the directory already exists.
pub fn log_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(SDLC_DIR).join("logs")
}
