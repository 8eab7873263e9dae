//! Configuration for the sdlc orchestrator.
//!
//! Settings are read from `.sdlc/config.toml`; every section is optional and
//! falls back to defaults. Layering is file → environment → CLI.
//!
//! ```toml
//! [project]
//! base_branch = "main"
//!
//! [orchestrator]
//! concurrency = 3
//! failure_policy = "continue"
//! isolation = "worktree"
//!
//! [retries]
//! max_retries = 3
//! max_implementation_retries = "unlimited"
//!
//! [reviews]
//! reviewers = ["code-reviewer", "security-reviewer"]
//! consensus = { mode = "ratio", min_approval_ratio = 0.5 }
//! ```

use crate::review::{ConsensusMode, ConsensusOptions};
use crate::story::{LockOptions, RetryLimit, RetryPolicy};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project state directory.
pub const SDLC_DIR: &str = ".sdlc";

/// Placeholder substituted with the story id in worker arguments.
pub const STORY_ID_PLACEHOLDER: &str = "{story_id}";

/// What to do with later phases once a phase has a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep executing later phases.
    #[default]
    Continue,
    /// Stop after the first phase that contains a failure.
    Abort,
}

/// How each story worker gets its working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One git worktree per story.
    #[default]
    Worktree,
    /// All workers share the project directory.
    Shared,
}

/// Reviewer personas available at the review gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewerRole {
    CodeReviewer,
    SecurityReviewer,
    ProductOwner,
    TestEngineer,
}

impl ReviewerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeReviewer => "code-reviewer",
            Self::SecurityReviewer => "security-reviewer",
            Self::ProductOwner => "product-owner",
            Self::TestEngineer => "test-engineer",
        }
    }

    /// One-line focus statement used when prompting this reviewer.
    pub fn focus(&self) -> &'static str {
        match self {
            Self::CodeReviewer => "correctness, readability and maintainability of the change",
            Self::SecurityReviewer => "injection, secrets handling, authz and unsafe input paths",
            Self::ProductOwner => "whether the acceptance criteria of the story are met",
            Self::TestEngineer => "test coverage of the new behavior and its edge cases",
        }
    }
}

impl std::fmt::Display for ReviewerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Program launched once per story. Defaults to the running executable.
    #[serde(default)]
    pub worker_cmd: Option<String>,
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_worker_args() -> Vec<String> {
    vec![
        "worker".to_string(),
        "--story".to_string(),
        STORY_ID_PLACEHOLDER.to_string(),
    ]
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            worker_cmd: None,
            worker_args: default_worker_args(),
            base_branch: default_base_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub isolation: IsolationMode,
}

fn default_concurrency() -> usize {
    3
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            failure_policy: FailurePolicy::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            isolation: IsolationMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorktreeSection {
    /// Base directory for story worktrees, relative to the project directory.
    #[serde(default)]
    pub base_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_implementation_retries")]
    pub max_implementation_retries: RetryLimit,
    #[serde(default = "default_implementation_upper_bound")]
    pub max_implementation_retries_upper_bound: RetryLimit,
    #[serde(default = "default_max_total_recovery_attempts")]
    pub max_total_recovery_attempts: u32,
    #[serde(default = "default_identical_error_threshold")]
    pub identical_error_threshold: u32,
    #[serde(default = "default_max_refinement_iterations")]
    pub max_refinement_iterations: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_implementation_retries() -> RetryLimit {
    RetryLimit::Limited(3)
}

fn default_implementation_upper_bound() -> RetryLimit {
    RetryLimit::Limited(10)
}

fn default_max_total_recovery_attempts() -> u32 {
    10
}

fn default_identical_error_threshold() -> u32 {
    3
}

fn default_max_refinement_iterations() -> u32 {
    3
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_implementation_retries: default_max_implementation_retries(),
            max_implementation_retries_upper_bound: default_implementation_upper_bound(),
            max_total_recovery_attempts: default_max_total_recovery_attempts(),
            identical_error_threshold: default_identical_error_threshold(),
            max_refinement_iterations: default_max_refinement_iterations(),
        }
    }
}

impl RetrySection {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_implementation_retries: self.max_implementation_retries,
            implementation_retries_upper_bound: self.max_implementation_retries_upper_bound,
            max_total_recovery_attempts: self.max_total_recovery_attempts,
            identical_error_threshold: self.identical_error_threshold,
            max_refinement_iterations: self.max_refinement_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockingSection {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_lock_stale_ms")]
    pub stale_ms: u64,
    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_lock_stale_ms() -> u64 {
    10_000
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

impl Default for LockingSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            stale_ms: default_lock_stale_ms(),
            retry_interval_ms: default_lock_retry_interval_ms(),
        }
    }
}

impl LockingSection {
    pub fn to_lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            stale_after: Duration::from_millis(self.stale_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewsSection {
    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<ReviewerRole>,
    #[serde(default)]
    pub consensus: ConsensusMode,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_reviewers() -> Vec<ReviewerRole> {
    vec![
        ReviewerRole::CodeReviewer,
        ReviewerRole::SecurityReviewer,
        ReviewerRole::ProductOwner,
    ]
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for ReviewsSection {
    fn default() -> Self {
        Self {
            reviewers: default_reviewers(),
            consensus: ConsensusMode::default(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl ReviewsSection {
    pub fn to_consensus_options(&self) -> ConsensusOptions {
        ConsensusOptions {
            mode: self.consensus,
            max_iterations: self.max_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_provider_command")]
    pub command: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
}

fn default_skip_permissions() -> bool {
    true
}

fn default_provider_command() -> String {
    "claude".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    600
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            command: default_provider_command(),
            timeout_secs: default_provider_timeout_secs(),
            model: None,
            skip_permissions: default_skip_permissions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationSection {
    /// Shell command run inside the worktree after implementation.
    #[serde(default)]
    pub command: Option<String>,
}

/// The complete `config.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdlcToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub worktrees: WorktreeSection,
    #[serde(default)]
    pub retries: RetrySection,
    #[serde(default)]
    pub locking: LockingSection,
    #[serde(default)]
    pub reviews: ReviewsSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub verification: VerificationSection,
}

impl SdlcToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(content).context("Failed to parse config.toml")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load `config.toml` from the sdlc directory, or defaults if absent.
    pub fn load_or_default(sdlc_root: &Path) -> Result<Self> {
        let path = sdlc_root.join("config.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.concurrency == 0 {
            bail!("orchestrator.concurrency must be at least 1");
        }
        if self.reviews.max_iterations == 0 {
            bail!("reviews.max_iterations must be at least 1");
        }
        if self.reviews.reviewers.is_empty() {
            bail!("reviews.reviewers must name at least one reviewer");
        }
        if let ConsensusMode::Ratio { min_approval_ratio } = self.reviews.consensus
            && !(min_approval_ratio > 0.0 && min_approval_ratio <= 1.0)
        {
            bail!(
                "reviews.consensus.min_approval_ratio must be in (0, 1], got {}",
                min_approval_ratio
            );
        }
        Ok(())
    }

    /// Apply `SDLC_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("SDLC_CONCURRENCY") {
            self.orchestrator.concurrency = value
                .parse()
                .with_context(|| format!("Invalid SDLC_CONCURRENCY '{}'", value))?;
        }
        if let Ok(value) = std::env::var("SDLC_PROVIDER_CMD") {
            self.provider.command = value;
        }
        if let Ok(value) = std::env::var("SDLC_WORKER_CMD") {
            self.project.worker_cmd = Some(value);
        }
        self.validate()
    }
}

/// Runtime configuration: resolved paths plus the parsed settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub sdlc_root: PathBuf,
    pub stories_dir: PathBuf,
    pub worktree_base: PathBuf,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub settings: SdlcToml,
}

impl Config {
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let sdlc_root = project_dir.join(SDLC_DIR);
        let mut settings = SdlcToml::load_or_default(&sdlc_root)?;
        settings.apply_env()?;
        Ok(Self::from_settings(project_dir, settings))
    }

    pub fn from_settings(project_dir: PathBuf, settings: SdlcToml) -> Self {
        let sdlc_root = project_dir.join(SDLC_DIR);
        let worktree_base = match &settings.worktrees.base_path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => project_dir.join(p),
            None => sdlc_root.join("worktrees"),
        };
        Self {
            stories_dir: sdlc_root.join("stories"),
            log_dir: sdlc_root.join("logs"),
            state_file: sdlc_root.join("workflow-state.json"),
            worktree_base,
            sdlc_root,
            project_dir,
            settings,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.stories_dir).context("Failed to create stories directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Resolve the worker program: configured command or the running executable.
    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.settings.project.worker_cmd {
            Some(cmd) => Ok(PathBuf::from(cmd)),
            None => std::env::current_exe().context("Failed to locate current executable"),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.orchestrator.shutdown_timeout_ms)
    }
}
