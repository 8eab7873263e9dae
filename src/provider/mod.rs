//! The AI provider boundary.
//!
//! The worker only needs one capability: send a prompt, get text back. Any
//! backend that implements [`AiProvider`] can drive the story pipeline.

pub mod claude;

pub use claude::{ClaudeAuthenticator, ClaudeCliProvider};

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// What a provider supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub tools: bool,
    pub system_prompt: bool,
    pub multi_turn: bool,
    pub context_window: usize,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialType {
    ApiKey,
    CliSession,
    None,
}

pub trait Authenticator: Send + Sync {
    fn is_configured(&self) -> bool;
    fn credential_type(&self) -> CredentialType;
    /// Check that the credentials actually work. Errors describe what is missing.
    fn validate_credentials(&self) -> Result<()>;
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    fn authenticator(&self) -> &dyn Authenticator;

    async fn query(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<String>;
}
