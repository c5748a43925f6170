pub(crate) mod schema;

pub(crate) use schema::{default_model_entries, Config, ModelEntry, ProviderConfig};

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Load configuration, checking (in order):
/// 1. `$MODELRELAY_CONFIG` env var
/// 2. `~/.modelrelay/config.yaml`
/// 3. Built-in defaults
pub(crate) fn load_config() -> Result<Config> {
    let path = resolve_config_path();

    let config = match path {
        Some(p) if p.exists() => {
            tracing::info!(path = %p.display(), "loading config");
            let raw = std::fs::read_to_string(&p)
                .with_context(|| format!("reading config from {}", p.display()))?;
            let mut cfg: Config = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config from {}", p.display()))?;
            resolve_env_vars(&mut cfg);
            cfg
        }
        _ => {
            tracing::debug!("no config file found, using defaults");
            // Even with defaults, secrets can come from the environment.
            let mut cfg = Config::default();
            resolve_env_vars(&mut cfg);
            cfg
        }
    };

    Ok(config)
}

/// Determine the config file path.
fn resolve_config_path() -> Option<PathBuf> {
    // Check env var first
    if let Ok(path) = std::env::var("MODELRELAY_CONFIG") {
        let p = PathBuf::from(path);
        if !p.as_os_str().is_empty() {
            return Some(p);
        }
    }

    // Default location
    dirs::home_dir().map(|h| h.join(".modelrelay").join("config.yaml"))
}

/// Resolve `${ENV_VAR}` references in secret-bearing fields.
fn resolve_env_vars(config: &mut Config) {
    config.bot_token = substitute_env_vars(&config.bot_token);
    if let Some(ref key) = config.openai.api_key {
        config.openai.api_key = Some(substitute_env_vars(key));
    }
    if let Some(ref key) = config.anthropic.api_key {
        config.anthropic.api_key = Some(substitute_env_vars(key));
    }
}

/// Substitute `${VAR}` patterns with environment variable values.
/// Returns the original string unchanged if the variable is not set.
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    // Simple pattern: the whole value is ${VAR}
    if let Some(inner) = extract_env_ref(&result) {
        if let Ok(val) = std::env::var(inner) {
            return val;
        }
    }
    // Inline ${VAR} substitution within a larger string
    while let Some(start) = result.find("${") {
        let rest = &result[start + 2..];
        if let Some(end) = rest.find('}') {
            let var_name = &rest[..end];
            let replacement = std::env::var(var_name).unwrap_or_default();
            result = format!("{}{}{}", &result[..start], replacement, &rest[end + 1..]);
        } else {
            break;
        }
    }
    result
}

/// If the entire string is `${VAR}`, return the variable name.
fn extract_env_ref(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.len() > 3 {
        let inner = &trimmed[2..trimmed.len() - 1];
        // Ensure there are no nested braces
        if !inner.contains('{') && !inner.contains('}') {
            return Some(inner);
        }
    }
    None
}
