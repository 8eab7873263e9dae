//! Claude Code CLI as an [`AiProvider`].

use super::{AiProvider, Authenticator, CredentialType, ProviderCapabilities};
use crate::config::ProviderSection;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const STDERR_TAIL_CHARS: usize = 500;

/// Reports how the `claude` CLI will authenticate.
#[derive(Debug, Clone)]
pub struct ClaudeAuthenticator {
    command: String,
    api_key: Option<String>,
}

impl ClaudeAuthenticator {
    pub fn new(command: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            command: command.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn from_env(command: impl Into<String>) -> Self {
        Self::new(command, std::env::var("ANTHROPIC_API_KEY").ok())
    }

    fn cli_available(&self) -> bool {
        find_executable(&self.command).is_some()
    }
}

impl Authenticator for ClaudeAuthenticator {
    fn is_configured(&self) -> bool {
        self.credential_type() != CredentialType::None
    }

    fn credential_type(&self) -> CredentialType {
        if self.api_key.is_some() {
            CredentialType::ApiKey
        } else if self.cli_available() {
            CredentialType::CliSession
        } else {
            CredentialType::None
        }
    }

    fn validate_credentials(&self) -> Result<()> {
        if !self.cli_available() {
            bail!(
                "'{}' was not found on PATH; install the Claude Code CLI or set provider.command",
                self.command
            );
        }
        Ok(())
    }
}

pub struct ClaudeCliProvider {
    command: String,
    model: Option<String>,
    skip_permissions: bool,
    default_timeout: Duration,
    auth: ClaudeAuthenticator,
}

impl ClaudeCliProvider {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            auth: ClaudeAuthenticator::from_env(command.clone()),
            command,
            model: None,
            skip_permissions: true,
            default_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_settings(settings: &ProviderSection) -> Self {
        let mut provider = Self::new(settings.command.clone());
        provider.model = settings.model.clone();
        provider.skip_permissions = settings.skip_permissions;
        provider.default_timeout = Duration::from_secs(settings.timeout_secs);
        provider
    }

    pub fn with_authenticator(mut self, auth: ClaudeAuthenticator) -> Self {
        self.auth = auth;
        self
    }

    fn flags(&self, system_prompt: Option<&str>) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("text".to_string());
        if let Some(model) = &self.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(system) = system_prompt {
            flags.push("--append-system-prompt".to_string());
            flags.push(system.to_string());
        }
        flags
    }
}

#[async_trait]
impl AiProvider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude-cli"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            streaming: false,
            tools: true,
            system_prompt: true,
            multi_turn: false,
            context_window: 200_000,
            models: vec!["opus".to_string(), "sonnet".to_string(), "haiku".to_string()],
        }
    }

    fn authenticator(&self) -> &dyn Authenticator {
        &self.auth
    }

    async fn query(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(self.flags(system_prompt))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.command))?;

        let stdin = child.stdin.take();
        let write_prompt = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await
        };

        // Writing and waiting share one deadline: a CLI that never drains a
        // large prompt would otherwise block the write forever.
        let exchange = async { tokio::join!(write_prompt, child.wait_with_output()) };
        let (written, output) = match tokio::time::timeout(timeout, exchange).await {
            Ok(pair) => pair,
            Err(_) => bail!("Provider query timed out after {:?}", timeout),
        };
        let output = output.context("Failed to wait for provider process")?;

        let prompt_delivered = match written {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => false,
            Err(e) => return Err(e).context("Failed to write prompt to provider stdin"),
        };

        debug!(
            prompt_chars = prompt.len(),
            output_chars = output.stdout.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Provider query finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = {
                let chars: Vec<char> = stderr.trim().chars().collect();
                chars[chars.len().saturating_sub(STDERR_TAIL_CHARS)..]
                    .iter()
                    .collect()
            };
            bail!(
                "Provider exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                tail
            );
        }
        if !prompt_delivered {
            bail!("Provider exited before reading the prompt");
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Resolve `command` the way a shell would: as a path if it has a separator,
/// otherwise by searching `PATH`.
fn find_executable(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    fn fake_cli(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_flags() {
        let mut provider = ClaudeCliProvider::new("claude");
        provider.model = Some("sonnet".into());
        let flags = provider.flags(Some("be terse"));
        assert_eq!(flags[0], "--dangerously-skip-permissions");
        assert!(flags.contains(&"--print".to_string()));
        assert!(flags.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(flags.windows(2).any(|w| w == ["--append-system-prompt", "be terse"]));
    }

    #[tokio::test]
    async fn test_query_pipes_prompt_via_stdin() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, r#"read -r line; echo "got: $line"; pwd"#);
        let provider = ClaudeCliProvider::new(cli);

        let out = provider
            .query("hello", None, Some(dir.path()), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("got: hello"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_query_reports_failure() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, "echo boom >&2; exit 2");
        let err = ClaudeCliProvider::new(cli)
            .query("x", None, None, None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("code 2"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, "sleep 10");
        let err = ClaudeCliProvider::new(cli)
            .query("x", None, None, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_query_timeout_covers_undrained_prompt() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, "sleep 5");
        let prompt = "p".repeat(2 * 1024 * 1024);

        let start = Instant::now();
        let err = ClaudeCliProvider::new(cli)
            .query(&prompt, None, None, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_query_rejects_exit_without_reading_prompt() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, "exit 0");
        let prompt = "p".repeat(2 * 1024 * 1024);

        let err = ClaudeCliProvider::new(cli)
            .query(&prompt, None, None, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before reading the prompt"));
    }

    #[test]
    fn test_authenticator_credential_types() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(&dir, "true");

        let with_key = ClaudeAuthenticator::new("/nonexistent/claude", Some("sk-test".into()));
        assert_eq!(with_key.credential_type(), CredentialType::ApiKey);
        assert!(with_key.is_configured());
        assert!(with_key.validate_credentials().is_err());

        let session = ClaudeAuthenticator::new(cli, None);
        assert_eq!(session.credential_type(), CredentialType::CliSession);
        assert!(session.validate_credentials().is_ok());

        let nothing = ClaudeAuthenticator::new("/nonexistent/claude", Some("  ".into()));
        assert_eq!(nothing.credential_type(), CredentialType::None);
        assert!(!nothing.is_configured());
    }
}
