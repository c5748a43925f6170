// OpenAI Chat Completions API client.
//
// Sends a single-message, non-streaming POST /v1/chat/completions and
// normalizes the answer plus reported token usage.

use serde_json::{json, Value};

use super::{classify_http_error, Completion, LlmError};

const PROVIDER: &str = "openai";

pub(crate) struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str) -> anyhow::Result<Self> {
        let base_url = if base_url.is_empty() {
            "https://api.openai.com/v1".to_string()
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request_body(model, prompt);

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
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

/// Build the request body for the Chat Completions API.
fn build_request_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": prompt }],
    })
}

/// Extract the answer text and token usage from a Chat Completions response.
fn parse_completion(body: &Value) -> Result<Completion, LlmError> {
    let answer = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| LlmError::MalformedResponse {
            provider: PROVIDER,
            reason: "missing choices[0].message.content".to_string(),
        })?
        .to_string();

    let usage = &body["usage"];
    let input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);

    Ok(Completion {
        answer,
        input_tokens,
        output_tokens,
    })
}
