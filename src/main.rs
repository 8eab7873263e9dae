use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "sdlc")]
#[command(version, about = "Concurrent story orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute every unfinished story, dependencies first
    Run {
        /// Maximum concurrent workers. Overrides config.toml
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Stop after the first phase that contains a failure
        #[arg(long)]
        abort_on_failure: bool,

        /// Skip stories completed by an interrupted run
        #[arg(long)]
        resume: bool,
    },
    /// Run a single story in the current directory (launched by `run`)
    Worker {
        #[arg(long)]
        story: String,
    },
    /// Show every story with its phase flags and retry counters
    Status,
    /// Create a story in the backlog
    Add {
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        /// Story ids this story depends on (comma-separated)
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },
    /// Move a blocked story back to ready
    Unblock {
        id: String,

        /// Also reset the implementation retry counter
        #[arg(long)]
        reset_retries: bool,
    },
    /// Inspect or remove story worktrees
    Worktree {
        #[command(subcommand)]
        command: WorktreeCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorktreeCommands {
    /// List worktrees under the configured base path
    List,
    /// Remove the worktree of a story
    Remove {
        story: String,

        /// Remove even with uncommitted changes
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Workers share stderr with the parent, which already writes the log file.
    let log_dir = match &cli.command {
        Commands::Worker { .. } => None,
        _ => Some(cmd::log_dir(&project_dir)),
    };
    let _log_guard = sdlc::logging::init(cli.verbose, log_dir.as_deref());

    let code = match &cli.command {
        Commands::Run {
            concurrency,
            abort_on_failure,
            resume,
        } => cmd::cmd_run(&project_dir, *concurrency, *abort_on_failure, *resume).await?,
        Commands::Worker { story } => cmd::cmd_worker(cli.project_dir.as_deref(), story).await,
        Commands::Status => {
            cmd::cmd_status(&project_dir).await?;
            ExitCode::SUCCESS
        }
        Commands::Add {
            id,
            title,
            depends_on,
        } => {
            cmd::cmd_add(&project_dir, id, title.as_deref(), depends_on.clone()).await?;
            ExitCode::SUCCESS
        }
        Commands::Unblock { id, reset_retries } => {
            cmd::cmd_unblock(&project_dir, id, *reset_retries).await?;
            ExitCode::SUCCESS
        }
        Commands::Worktree { command } => {
            cmd::cmd_worktree(&project_dir, command.clone())?;
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
