// LLM provider clients.
//
// Each provider exposes a single non-streaming completion call; the router
// picks the client from the descriptor's provider tag.

pub(crate) mod anthropic;
pub(crate) mod openai;

use async_trait::async_trait;

use crate::config::Config;
use crate::models::{ModelDescriptor, ProviderKind};

/// Maximum output tokens requested from providers that require a cap.
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Normalized result of one completion call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Completion {
    pub answer: String,
    /// Provider-reported, treated as authoritative.
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Failures surfaced by provider calls. Fatal to the dispatch that hit them;
/// nothing below the dispatch pipeline recovers these.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LlmError {
    #[error("{provider} request failed: {reason}")]
    Request {
        provider: &'static str,
        reason: String,
    },
    #[error("{provider} auth error ({status}): {body}")]
    Auth {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} rate limit exceeded ({status})")]
    RateLimited {
        provider: &'static str,
        status: u16,
    },
    #[error("{provider} API error ({status}): {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },
    #[error("{provider} returned a malformed response: {reason}")]
    MalformedResponse {
        provider: &'static str,
        reason: String,
    },
}

/// Classify an HTTP error status into a meaningful error.
pub(crate) fn classify_http_error(provider: &'static str, status: u16, body: &str) -> LlmError {
    match status {
        401 | 403 => LlmError::Auth {
            provider,
            status,
            body: body.to_string(),
        },
        429 => LlmError::RateLimited { provider, status },
        _ => LlmError::Api {
            provider,
            status,
            body: body.to_string(),
        },
    }
}

/// Completes prompts against some provider. The dispatch pipeline only sees
/// this seam, so tests can substitute an in-memory backend.
#[async_trait]
pub(crate) trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        descriptor: &ModelDescriptor,
        prompt: &str,
    ) -> Result<Completion, LlmError>;
}

/// Routes a prompt to the client matching the descriptor's provider tag.
pub(crate) struct ProviderRouter {
    openai: openai::OpenAiClient,
    anthropic: anthropic::AnthropicClient,
}

impl ProviderRouter {
    pub(crate) fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            openai: openai::OpenAiClient::new(
                config.openai.api_key.as_deref().unwrap_or(""),
                config.openai.base_url.as_deref().unwrap_or(""),
            )?,
            anthropic: anthropic::AnthropicClient::new(
                config.anthropic.api_key.as_deref().unwrap_or(""),
                config.anthropic.base_url.as_deref().unwrap_or(""),
            )?,
        })
    }
}

#[async_trait]
impl CompletionBackend for ProviderRouter {
    async fn complete(
        &self,
        descriptor: &ModelDescriptor,
        prompt: &str,
    ) -> Result<Completion, LlmError> {
        match descriptor.provider {
            ProviderKind::OpenAi => self.openai.complete(&descriptor.model_name, prompt).await,
            ProviderKind::Anthropic => {
                self.anthropic
                    .complete(&descriptor.model_name, prompt)
                    .await
            }
        }
    }
}
