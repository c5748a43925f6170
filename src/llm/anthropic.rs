// Anthropic Messages API client.
//
// Sends a single-message, non-streaming POST /v1/messages and normalizes
// the answer plus reported token usage.

use serde_json::{json, Value};

use super::{classify_http_error, Completion, LlmError, DEFAULT_MAX_TOKENS};

const PROVIDER: &str = "anthropic";

pub(crate) struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str, base_url: &str) -> anyhow::Result<Self> {
        let base_url = if base_url.is_empty() {
            "https://api.anthropic.com".to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()?,
            api_key: api_key.to_string(),
            base_url,
        })
    }

    pub(crate) async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = build_request_body(model, prompt);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(PROVIDER, status, &body));
        }

        let json_resp: Value = response.json().await.map_err(|e| LlmError::Request {
            provider: PROVIDER,
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_completion(&json_resp)
    }
}

/// Build the request body for the Messages API.
fn build_request_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "messages": [{ "role": "user", "content": prompt }],
    })
}

/// Extract the answer text and token usage from a Messages response.
///
/// The answer is the concatenation of all text content blocks.
fn parse_completion(body: &Value) -> Result<Completion, LlmError> {
    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| LlmError::MalformedResponse {
            provider: PROVIDER,
            reason: "missing content array".to_string(),
        })?;

    let answer: String = blocks
        .iter()
        .filter(|b| b["type"].as_str() == Some("text"))
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    if answer.is_empty() && blocks.is_empty() {
        return Err(LlmError::MalformedResponse {
            provider: PROVIDER,
            reason: "response contained no text blocks".to_string(),
        });
    }

    let usage = &body["usage"];
    let input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);

    Ok(Completion {
        answer,
        input_tokens,
        output_tokens,
    })
}
