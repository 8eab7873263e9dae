pub mod config;
pub mod dag;
pub mod errors;
pub mod logging;
pub mod process;
pub mod provider;
pub mod review;
pub mod story;
pub mod worker;
pub mod workflow_state;
pub mod worktree;
