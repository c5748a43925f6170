use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::ProviderKind;

/// Top-level bot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Config {
    /// Telegram bot token, supports `${ENV_VAR}` syntax.
    #[serde(default = "default_bot_token")]
    pub bot_token: String,

    /// Path to the SQLite user database.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// OpenAI credentials and endpoint.
    #[serde(default)]
    pub openai: ProviderConfig,

    /// Anthropic credentials and endpoint.
    #[serde(default)]
    pub anthropic: ProviderConfig,

    /// Key of the model used when a user has no valid selection.
    #[serde(default = "default_model_key")]
    pub default_model: String,

    /// Selectable models, in menu order.
    #[serde(default = "default_model_entries")]
    pub models: Vec<ModelEntry>,

    /// Long-poll timeout for the update loop, in seconds.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

/// Per-provider section of the config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ProviderConfig {
    /// API key, supports `${ENV_VAR}` syntax.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL override for the provider API.
    #[serde(default)]
    pub base_url: Option<String>,
}

/// One selectable model as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ModelEntry {
    /// Stable short identifier (stored per user, embedded in callbacks).
    pub key: String,

    /// Button label.
    pub label: String,

    /// Provider-facing model identifier.
    pub model_name: String,

    /// Provider family. Inferred from `model_name` when omitted.
    #[serde(default)]
    pub provider: Option<ProviderKind>,

    /// USD per million input tokens.
    pub input_price: f64,

    /// USD per million output tokens.
    pub output_price: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_token: default_bot_token(),
            database_path: None,
            openai: ProviderConfig::default(),
            anthropic: ProviderConfig::default(),
            default_model: default_model_key(),
            models: default_model_entries(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_bot_token() -> String {
    "${TELEGRAM_BOT_TOKEN}".to_string()
}

fn default_model_key() -> String {
    "gpt-4o-mini".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

/// Built-in model catalogue used when the config lists no models.
pub(crate) fn default_model_entries() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            key: "gpt-4o".into(),
            label: "GPT-4o".into(),
            model_name: "gpt-4o".into(),
            provider: Some(ProviderKind::OpenAi),
            input_price: 2.50,
            output_price: 10.0,
        },
        ModelEntry {
            key: "gpt-4o-mini".into(),
            label: "GPT-4o mini".into(),
            model_name: "gpt-4o-mini".into(),
            provider: Some(ProviderKind::OpenAi),
            input_price: 0.15,
            output_price: 0.60,
        },
        ModelEntry {
            key: "claude-sonnet".into(),
            label: "Claude Sonnet 4".into(),
            model_name: "claude-sonnet-4-20250514".into(),
            provider: Some(ProviderKind::Anthropic),
            input_price: 3.0,
            output_price: 15.0,
        },
        ModelEntry {
            key: "claude-haiku".into(),
            label: "Claude Haiku 3".into(),
            model_name: "claude-haiku-3-20250307".into(),
            provider: Some(ProviderKind::Anthropic),
            input_price: 0.25,
            output_price: 1.25,
        },
    ]
}

impl Config {
    /// Validate configuration values, returning an error with a helpful
    /// message if any value is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_model.is_empty() {
            anyhow::bail!("default_model cannot be empty");
        }
        if self.models.is_empty() {
            anyhow::bail!("at least one model must be configured");
        }
        for entry in &self.models {
            if entry.key.is_empty() {
                anyhow::bail!("model keys cannot be empty");
            }
            if entry.key.contains(':') {
                anyhow::bail!(
                    "model key '{}' may not contain ':' (reserved for callback payloads)",
                    entry.key
                );
            }
            if entry.model_name.is_empty() {
                anyhow::bail!("model '{}' has an empty model_name", entry.key);
            }
        }
        if self.poll_timeout_secs == 0 || self.poll_timeout_secs > 50 {
            anyhow::bail!(
                "poll_timeout_secs must be between 1 and 50, got {}",
                self.poll_timeout_secs
            );
        }
        Ok(())
    }
}
