// Telegram Bot API client.
//
// All method calls are POSTed as JSON to `{BASE_URL}{token}/{method}` and
// answered with an `{ "ok": ..., "result": ... }` envelope. Inbound updates
// arrive through `getUpdates` long polling.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Telegram Bot API base URL.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

// ---------------------------------------------------------------------------
// Inbound update types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IncomingMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<IncomingMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CallbackQuery {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub(crate) enum TelegramError {
    #[error("telegram request failed: {0}")]
    Request(String),
    #[error("telegram API error (code {code}): {description}")]
    Api { code: i64, description: String },
    #[error("failed to decode telegram response: {0}")]
    Decode(String),
}

// ---------------------------------------------------------------------------
// Markup escaping
// ---------------------------------------------------------------------------

/// Escape characters significant to Telegram's HTML parse mode so arbitrary
/// text (stack traces included) cannot break or inject markup.
pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ---------------------------------------------------------------------------
// Outbound transport seam
// ---------------------------------------------------------------------------

/// Outbound operations the dispatch pipeline needs from the chat transport.
#[async_trait]
pub(crate) trait ChatTransport: Send + Sync {
    /// Send plain text to a chat.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;

    /// Send HTML-formatted text to a chat.
    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), TelegramError>;

    /// Show the "typing" chat action.
    async fn send_typing(&self, chat_id: i64) -> Result<(), TelegramError>;

    /// Send a message with one inline-keyboard button per `(label, payload)`
    /// row.
    async fn send_menu(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, String)],
    ) -> Result<(), TelegramError>;

    /// Acknowledge a callback query with a short notice.
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TelegramError>;

    /// Replace the text of a previously sent message.
    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TelegramError>;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub(crate) struct TelegramBot {
    http: reqwest::Client,
    token: String,
}

impl TelegramBot {
    pub(crate) fn new(token: &str) -> anyhow::Result<Self> {
        // The client timeout must exceed the getUpdates long-poll window.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            token: token.to_string(),
        })
    }

    /// Build a full Bot API URL for the given method.
    fn api_url(&self, method: &str) -> String {
        format!("{}{}/{}", TELEGRAM_API_BASE, self.token, method)
    }

    /// POST a method call and return the `result` payload.
    async fn call(&self, method: &str, body: Value) -> Result<Value, TelegramError> {
        let url = self.api_url(method);
        debug!(method, "calling telegram API");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TelegramError::Request(e.to_string()))?;

        let json_resp: Value = response
            .json()
            .await
            .map_err(|e| TelegramError::Decode(e.to_string()))?;

        parse_telegram_response(&json_resp)?;
        Ok(json_resp.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Poll for updates past `offset`, blocking server-side for up to
    /// `timeout_secs`.
    pub(crate) async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": timeout_secs,
                    "allowed_updates": ["message", "callback_query"],
                }),
            )
            .await?;

        serde_json::from_value(result).map_err(|e| TelegramError::Decode(e.to_string()))
    }
}

/// Check the `ok` field of a Bot API response envelope.
///
/// Responses are `{ "ok": true, "result": ... }` on success, or
/// `{ "ok": false, "error_code": 400, "description": "..." }` on failure.
fn parse_telegram_response(response: &Value) -> Result<(), TelegramError> {
    let ok = response
        .get("ok")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if !ok {
        let code = response
            .get("error_code")
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);
        let description = response
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(TelegramError::Api { code, description });
    }

    Ok(())
}

#[async_trait]
impl ChatTransport for TelegramBot {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        self.call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        self.call(
            "sendMessage",
            json!({ "chat_id": chat_id, "text": text, "parse_mode": "HTML" }),
        )
        .await?;
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), TelegramError> {
        self.call(
            "sendChatAction",
            json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await?;
        Ok(())
    }

    async fn send_menu(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, String)],
    ) -> Result<(), TelegramError> {
        let keyboard: Vec<Value> = buttons
            .iter()
            .map(|(label, payload)| json!([{ "text": label, "callback_data": payload }]))
            .collect();

        self.call(
            "sendMessage",
            json!({
                "chat_id": chat_id,
                "text": text,
                "reply_markup": { "inline_keyboard": keyboard },
            }),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TelegramError> {
        self.call(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<(), TelegramError> {
        self.call(
            "editMessageText",
            json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
