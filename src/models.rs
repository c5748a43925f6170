// Model registry and cost accounting: selectable models, per-mtok prices,
// provider tags, and the cost breakdown for a single request.

use serde::{Deserialize, Serialize};

use crate::config::ModelEntry;

// ---------------------------------------------------------------------------
// Provider tag
// ---------------------------------------------------------------------------

/// Provider family a model is served by.
///
/// Every descriptor carries this tag explicitly so dispatch never has to
/// guess from the model name at request time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    /// Infer the provider family from a provider-facing model name.
    ///
    /// Used only when a config entry omits the `provider` field. Unknown
    /// name families are an error here, at registry build time, so a
    /// descriptor with no routable provider can never reach dispatch.
    pub(crate) fn infer(model_name: &str) -> Result<Self, RegistryError> {
        if model_name.starts_with("gpt") || model_name.starts_with("o1") {
            Ok(ProviderKind::OpenAi)
        } else if model_name.starts_with("claude") {
            Ok(ProviderKind::Anthropic)
        } else {
            Err(RegistryError::UnsupportedModel(model_name.to_string()))
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Prices {
    pub input: f64,
    pub output: f64,
}

/// Static metadata for a selectable model. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ModelDescriptor {
    /// Stable short identifier used in persistence and callback payloads.
    pub key: String,
    /// Human label shown on selection buttons.
    pub button_text: String,
    /// Provider-facing model identifier.
    pub model_name: String,
    pub provider: ProviderKind,
    pub prices: Prices,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RegistryError {
    #[error("model name '{0}' matches no known provider family")]
    UnsupportedModel(String),
    #[error("duplicate model key '{0}'")]
    DuplicateKey(String),
    #[error("model '{key}' has a negative {side} price")]
    NegativePrice { key: String, side: &'static str },
    #[error("default model key '{0}' is not in the registry")]
    UnknownDefault(String),
}

/// Ordered, immutable mapping from model key to descriptor.
///
/// Built once at startup and injected into the components that need it.
#[derive(Debug, Clone)]
pub(crate) struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    default_key: String,
}

impl ModelRegistry {
    /// Build a registry from config entries, preserving their order.
    pub(crate) fn from_entries(
        entries: &[ModelEntry],
        default_key: &str,
    ) -> Result<Self, RegistryError> {
        let mut models: Vec<ModelDescriptor> = Vec::with_capacity(entries.len());

        for entry in entries {
            if models.iter().any(|m| m.key == entry.key) {
                return Err(RegistryError::DuplicateKey(entry.key.clone()));
            }
            if entry.input_price < 0.0 {
                return Err(RegistryError::NegativePrice {
                    key: entry.key.clone(),
                    side: "input",
                });
            }
            if entry.output_price < 0.0 {
                return Err(RegistryError::NegativePrice {
                    key: entry.key.clone(),
                    side: "output",
                });
            }
            let provider = match entry.provider {
                Some(p) => p,
                None => ProviderKind::infer(&entry.model_name)?,
            };
            models.push(ModelDescriptor {
                key: entry.key.clone(),
                button_text: entry.label.clone(),
                model_name: entry.model_name.clone(),
                provider,
                prices: Prices {
                    input: entry.input_price,
                    output: entry.output_price,
                },
            });
        }

        if !models.iter().any(|m| m.key == default_key) {
            return Err(RegistryError::UnknownDefault(default_key.to_string()));
        }

        Ok(Self {
            models,
            default_key: default_key.to_string(),
        })
    }

    /// Look up a descriptor by key.
    pub(crate) fn resolve(&self, key: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.key == key)
    }

    /// Keys in display/menu order. Stable across calls.
    pub(crate) fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter()
    }

    /// The fallback key. Always resolves.
    pub(crate) fn default_key(&self) -> &str {
        &self.default_key
    }

    /// Descriptor for the fallback model.
    pub(crate) fn default_descriptor(&self) -> &ModelDescriptor {
        // Construction guarantees the default key is present.
        self.resolve(&self.default_key).unwrap_or(&self.models[0])
    }
}

// ---------------------------------------------------------------------------
// Cost calculation
// ---------------------------------------------------------------------------

/// Monetary cost of one request, derived from provider-reported token counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total: f64,
}

/// Compute the cost of a request from token counts and the model's prices.
///
/// Pure and total. Prices are USD per million tokens; rounding is the
/// caller's concern.
pub(crate) fn compute_cost(
    descriptor: &ModelDescriptor,
    input_tokens: u64,
    output_tokens: u64,
) -> CostBreakdown {
    let input_cost = (input_tokens as f64 / 1_000_000.0) * descriptor.prices.input;
    let output_cost = (output_tokens as f64 / 1_000_000.0) * descriptor.prices.output;
    CostBreakdown {
        input_cost,
        output_cost,
        total: input_cost + output_cost,
    }
}

/// Render a cost as a dollar string with four decimal places (e.g. `$2.0000`).
pub(crate) fn format_cost(cost: f64) -> String {
    format!("${:.4}", cost)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
