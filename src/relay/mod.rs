// Message dispatch pipeline, model selection flow, and error escalation.
//
// One Relay instance handles every inbound update. It orchestrates the user
// store, the model registry, the provider backend, and the chat transport,
// and is the single recovery boundary for user-facing dispatch: any failure
// past the activation gate yields one generic apology to the user and one
// detailed report to each admin.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::llm::CompletionBackend;
use crate::models::{compute_cost, format_cost, ModelDescriptor, ModelRegistry};
use crate::store::UserDirectory;
use crate::telegram::{escape_html, CallbackQuery, ChatTransport, IncomingMessage, Update};

/// Callback payload prefix for model selection buttons.
const SELECT_MODEL_PREFIX: &str = "select_model:";

const WELCOME_TEXT: &str = "Welcome! Use /choosemodel to pick a model.";
const CHOOSE_MODEL_TEXT: &str = "Choose a model:";
const APOLOGY_TEXT: &str =
    "Something went wrong while processing your message.\nA report has been sent to the maintainer.";
const SELECTION_FAILED_TEXT: &str = "Failed to update the model, please try again.";

#[derive(Clone)]
pub(crate) struct Relay {
    registry: ModelRegistry,
    backend: Arc<dyn CompletionBackend>,
    store: Arc<dyn UserDirectory>,
    transport: Arc<dyn ChatTransport>,
}

impl Relay {
    pub(crate) fn new(
        registry: ModelRegistry,
        backend: Arc<dyn CompletionBackend>,
        store: Arc<dyn UserDirectory>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            registry,
            backend,
            store,
            transport,
        }
    }

    /// Entry point for one inbound update.
    pub(crate) async fn handle_update(&self, update: Update) {
        if let Some(message) = update.message {
            if message.text.is_some() {
                self.handle_message(message).await;
            }
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback).await;
        }
    }

    // -----------------------------------------------------------------------
    // Text messages
    // -----------------------------------------------------------------------

    async fn handle_message(&self, message: IncomingMessage) {
        let text = message.text.as_deref().unwrap_or_default().to_string();

        match text.as_str() {
            "/start" => self.handle_start(&message).await,
            "/choosemodel" => self.handle_choose_model(&message).await,
            // Anything else, command-like or not, is relayed verbatim.
            _ => self.relay_message(&message).await,
        }
    }

    async fn handle_start(&self, message: &IncomingMessage) {
        let chat_id = message.chat.id;

        // First contact: persist an inactive row so activation can be granted
        // externally. Existing rows are left untouched.
        let from = message.from.as_ref();
        let created = self
            .store
            .create_user(
                chat_id,
                from.and_then(|u| u.username.as_deref()),
                from.and_then(|u| u.first_name.as_deref()),
                from.and_then(|u| u.last_name.as_deref()),
                self.registry.default_key(),
            )
            .await;
        match created {
            Ok(true) => info!(user_id = chat_id, "created user"),
            Ok(false) => debug!(user_id = chat_id, "user already exists"),
            Err(e) => warn!(user_id = chat_id, error = %e, "failed to create user"),
        }

        if let Err(e) = self.transport.send_text(chat_id, WELCOME_TEXT).await {
            warn!(user_id = chat_id, error = %e, "failed to send welcome message");
        }
    }

    async fn handle_choose_model(&self, message: &IncomingMessage) {
        let chat_id = message.chat.id;
        let buttons: Vec<(String, String)> = self
            .registry
            .list()
            .map(|m| {
                (
                    m.button_text.clone(),
                    format!("{SELECT_MODEL_PREFIX}{}", m.key),
                )
            })
            .collect();

        if let Err(e) = self
            .transport
            .send_menu(chat_id, CHOOSE_MODEL_TEXT, &buttons)
            .await
        {
            warn!(user_id = chat_id, error = %e, "failed to send model menu");
        }
    }

    /// The dispatch pipeline for one user message.
    async fn relay_message(&self, message: &IncomingMessage) {
        let chat_id = message.chat.id;

        // Unknown senders are dropped without feedback. A store failure is
        // logged but treated the same way.
        let user = match self.store.get_user(chat_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(user_id = chat_id, "ignoring message from unknown user");
                return;
            }
            Err(e) => {
                warn!(user_id = chat_id, error = %e, "user lookup failed, dropping message");
                return;
            }
        };

        // An absent or stale selection falls back to the default model.
        let descriptor = user
            .selected_model_key
            .as_deref()
            .and_then(|key| self.registry.resolve(key))
            .unwrap_or_else(|| self.registry.default_descriptor());

        // Unactivated users get no reply of any kind.
        if !user.is_activated {
            debug!(user_id = chat_id, "ignoring message from unactivated user");
            return;
        }

        if let Err(err) = self.complete_and_reply(chat_id, message, descriptor).await {
            error!(user_id = chat_id, error = %err, "dispatch failed");
            if let Err(e) = self.transport.send_text(chat_id, APOLOGY_TEXT).await {
                warn!(user_id = chat_id, error = %e, "failed to send apology");
            }
            self.notify_admins(&err).await;
        }
    }

    async fn complete_and_reply(
        &self,
        chat_id: i64,
        message: &IncomingMessage,
        descriptor: &ModelDescriptor,
    ) -> anyhow::Result<()> {
        self.transport.send_typing(chat_id).await?;

        let text = message.text.as_deref().unwrap_or_default();
        let quoted = message
            .reply_to_message
            .as_ref()
            .and_then(|m| m.text.as_deref());
        let prompt = build_prompt(text, quoted);

        let completion = self.backend.complete(descriptor, &prompt).await?;
        let cost = compute_cost(descriptor, completion.input_tokens, completion.output_tokens);

        info!(
            user_id = chat_id,
            model = %descriptor.key,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            cost = %format_cost(cost.total),
            "relayed message"
        );

        let reply = format!("{}\n\n{}", completion.answer, cost_line(cost.total));
        self.transport.send_text(chat_id, &reply).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Model selection callbacks
    // -----------------------------------------------------------------------

    async fn handle_callback(&self, callback: CallbackQuery) {
        let Some(data) = callback.data.as_deref() else {
            return;
        };
        let Some(key) = data.strip_prefix(SELECT_MODEL_PREFIX) else {
            debug!(payload = data, "ignoring unrecognized callback payload");
            return;
        };

        // The registry is static, so this only fails on a stale button from
        // a previous configuration.
        let Some(descriptor) = self.registry.resolve(key) else {
            warn!(key, "callback for unknown model key");
            self.acknowledge(&callback.id, SELECTION_FAILED_TEXT).await;
            return;
        };

        let user_id = callback.from.id;
        match self.store.update_selected_model(user_id, key).await {
            Ok(()) => {
                self.acknowledge(&callback.id, &format!("You selected: {key}"))
                    .await;
                if let Some(menu) = callback.message.as_ref() {
                    let text = format!("Current model: {}", descriptor.button_text);
                    if let Err(e) = self
                        .transport
                        .edit_message_text(menu.chat.id, menu.message_id, &text)
                        .await
                    {
                        warn!(user_id, error = %e, "failed to update model menu");
                    }
                }
            }
            Err(e) => {
                warn!(user_id, key, error = %e, "failed to persist model selection");
                self.acknowledge(&callback.id, SELECTION_FAILED_TEXT).await;
            }
        }
    }

    async fn acknowledge(&self, callback_id: &str, text: &str) {
        if let Err(e) = self.transport.answer_callback(callback_id, text).await {
            warn!(error = %e, "failed to answer callback query");
        }
    }

    // -----------------------------------------------------------------------
    // Error escalation
    // -----------------------------------------------------------------------

    /// Broadcast an error report to every admin, best effort.
    ///
    /// Admins are looked up fresh on every call so promotions take effect on
    /// the next error. One failed delivery never aborts the rest.
    async fn notify_admins(&self, err: &anyhow::Error) {
        let admins = match self.store.list_admins().await {
            Ok(admins) => admins,
            Err(e) => {
                error!(error = %e, "failed to list admins, dropping error report");
                return;
            }
        };

        let report = format!(
            "\u{2757}Relay error:\n\n<pre><code>{}</code></pre>",
            escape_html(&error_report(err))
        );

        for admin in &admins {
            if let Err(e) = self.transport.send_html(admin.tg_id, &report).await {
                warn!(admin_id = admin.tg_id, error = %e, "failed to deliver error report");
            }
        }
    }
}

/// Build the effective prompt: quoted text, blank line, then the new text.
fn build_prompt(text: &str, quoted: Option<&str>) -> String {
    match quoted {
        Some(quoted) => format!("{quoted}\n\n{text}"),
        None => text.to_string(),
    }
}

/// Fixed-format cost line appended to every answer.
fn cost_line(total: f64) -> String {
    format!("Cost of this request: {}", format_cost(total))
}

/// Render an error and its full cause chain, one cause per line.
fn error_report(err: &anyhow::Error) -> String {
    let mut report = err.to_string();
    for cause in err.chain().skip(1) {
        report.push_str("\ncaused by: ");
        report.push_str(&cause.to_string());
    }
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::config::ModelEntry;
    use crate::llm::{Completion, LlmError};
    use crate::models::ProviderKind;
    use crate::store::{StoreError, User};
    use crate::telegram::{Chat, TelegramError, TgUser};

    // -- Fakes --

    #[derive(Default)]
    struct FakeStore {
        user: Option<User>,
        admins: Vec<User>,
        fail_get: bool,
        fail_update: bool,
        updates: Mutex<Vec<(i64, String)>>,
        created: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl UserDirectory for FakeStore {
        async fn get_user(&self, tg_id: i64) -> Result<Option<User>, StoreError> {
            if self.fail_get {
                return Err(StoreError::Connection("boom".into()));
            }
            Ok(self.user.clone().filter(|u| u.tg_id == tg_id))
        }

        async fn create_user(
            &self,
            tg_id: i64,
            _username: Option<&str>,
            _first_name: Option<&str>,
            _last_name: Option<&str>,
            _selected_model_key: &str,
        ) -> Result<bool, StoreError> {
            self.created.lock().unwrap().push(tg_id);
            Ok(self.user.is_none())
        }

        async fn update_selected_model(&self, tg_id: i64, key: &str) -> Result<(), StoreError> {
            if self.fail_update {
                return Err(StoreError::Connection("boom".into()));
            }
            self.updates.lock().unwrap().push((tg_id, key.to_string()));
            Ok(())
        }

        async fn list_admins(&self) -> Result<Vec<User>, StoreError> {
            Ok(self.admins.clone())
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        sent: Mutex<Vec<(i64, String)>>,
        html: Mutex<Vec<(i64, String)>>,
        typing: Mutex<Vec<i64>>,
        menus: Mutex<Vec<(i64, String, Vec<(String, String)>)>>,
        acks: Mutex<Vec<(String, String)>>,
        edits: Mutex<Vec<(i64, i64, String)>>,
        /// Chat id for which send_html fails.
        fail_html_for: Option<i64>,
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_html(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
            if self.fail_html_for == Some(chat_id) {
                return Err(TelegramError::Request("blocked".into()));
            }
            self.html.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_typing(&self, chat_id: i64) -> Result<(), TelegramError> {
            self.typing.lock().unwrap().push(chat_id);
            Ok(())
        }

        async fn send_menu(
            &self,
            chat_id: i64,
            text: &str,
            buttons: &[(String, String)],
        ) -> Result<(), TelegramError> {
            self.menus
                .lock()
                .unwrap()
                .push((chat_id, text.to_string(), buttons.to_vec()));
            Ok(())
        }

        async fn answer_callback(
            &self,
            callback_id: &str,
            text: &str,
        ) -> Result<(), TelegramError> {
            self.acks
                .lock()
                .unwrap()
                .push((callback_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn edit_message_text(
            &self,
            chat_id: i64,
            message_id: i64,
            text: &str,
        ) -> Result<(), TelegramError> {
            self.edits
                .lock()
                .unwrap()
                .push((chat_id, message_id, text.to_string()));
            Ok(())
        }
    }

    struct FakeBackend {
        completion: Result<Completion, String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeBackend {
        fn ok(answer: &str, input_tokens: u64, output_tokens: u64) -> Self {
            Self {
                completion: Ok(Completion {
                    answer: answer.to_string(),
                    input_tokens,
                    output_tokens,
                }),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                completion: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for FakeBackend {
        async fn complete(
            &self,
            descriptor: &ModelDescriptor,
            prompt: &str,
        ) -> Result<Completion, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((descriptor.key.clone(), prompt.to_string()));
            match &self.completion {
                Ok(c) => Ok(c.clone()),
                Err(message) => Err(LlmError::Request {
                    provider: "openai",
                    reason: message.clone(),
                }),
            }
        }
    }

    // -- Helpers --

    fn registry() -> ModelRegistry {
        let entries = vec![
            ModelEntry {
                key: "gpt-x".into(),
                label: "GPT-X".into(),
                model_name: "gpt-x".into(),
                provider: Some(ProviderKind::OpenAi),
                input_price: 1.0,
                output_price: 2.0,
            },
            ModelEntry {
                key: "claude-y".into(),
                label: "Claude Y".into(),
                model_name: "claude-y".into(),
                provider: Some(ProviderKind::Anthropic),
                input_price: 3.0,
                output_price: 15.0,
            },
        ];
        ModelRegistry::from_entries(&entries, "gpt-x").unwrap()
    }

    fn user(tg_id: i64, selected: Option<&str>, activated: bool) -> User {
        User {
            tg_id,
            username: None,
            first_name: None,
            last_name: None,
            selected_model_key: selected.map(String::from),
            is_activated: activated,
            is_admin: false,
            created_at: chrono::Utc::now().naive_utc(),
        }
    }

    fn admin(tg_id: i64) -> User {
        User {
            is_admin: true,
            ..user(tg_id, None, true)
        }
    }

    fn text_message(chat_id: i64, text: &str, quoted: Option<&str>) -> IncomingMessage {
        IncomingMessage {
            message_id: 1,
            from: Some(TgUser {
                id: chat_id,
                username: Some("alice".into()),
                first_name: Some("Alice".into()),
                last_name: None,
            }),
            chat: Chat { id: chat_id },
            text: Some(text.to_string()),
            reply_to_message: quoted.map(|q| {
                Box::new(IncomingMessage {
                    message_id: 0,
                    from: None,
                    chat: Chat { id: chat_id },
                    text: Some(q.to_string()),
                    reply_to_message: None,
                })
            }),
        }
    }

    fn text_update(chat_id: i64, text: &str) -> Update {
        Update {
            update_id: 1,
            message: Some(text_message(chat_id, text, None)),
            callback_query: None,
        }
    }

    fn callback_update(user_id: i64, data: Option<&str>) -> Update {
        Update {
            update_id: 2,
            message: None,
            callback_query: Some(CallbackQuery {
                id: "cb1".into(),
                from: TgUser {
                    id: user_id,
                    username: None,
                    first_name: None,
                    last_name: None,
                },
                message: Some(IncomingMessage {
                    message_id: 77,
                    from: None,
                    chat: Chat { id: user_id },
                    text: Some(CHOOSE_MODEL_TEXT.into()),
                    reply_to_message: None,
                }),
                data: data.map(String::from),
            }),
        }
    }

    fn relay(
        store: FakeStore,
        backend: FakeBackend,
        transport: FakeTransport,
    ) -> (Relay, Arc<FakeStore>, Arc<FakeBackend>, Arc<FakeTransport>) {
        let store = Arc::new(store);
        let backend = Arc::new(backend);
        let transport = Arc::new(transport);
        let relay = Relay::new(
            registry(),
            backend.clone(),
            store.clone(),
            transport.clone(),
        );
        (relay, store, backend, transport)
    }

    // -- Prompt building --

    #[test]
    fn prompt_without_quote_is_verbatim() {
        assert_eq!(build_prompt("A", None), "A");
    }

    #[test]
    fn prompt_with_quote_prepends_quoted_text() {
        assert_eq!(build_prompt("A", Some("Q")), "Q\n\nA");
    }

    // -- Dispatch pipeline --

    #[tokio::test]
    async fn unknown_sender_is_ignored() {
        let (relay, _, backend, transport) =
            relay(FakeStore::default(), FakeBackend::ok("hi", 1, 1), FakeTransport::default());

        relay.handle_update(text_update(42, "hello")).await;

        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_on_lookup_is_dropped_silently() {
        let store = FakeStore {
            fail_get: true,
            ..FakeStore::default()
        };
        let (relay, _, backend, transport) =
            relay(store, FakeBackend::ok("hi", 1, 1), FakeTransport::default());

        relay.handle_update(text_update(42, "hello")).await;

        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(transport.html.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unactivated_user_gets_no_reply_and_no_escalation() {
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), false)),
            admins: vec![admin(1)],
            ..FakeStore::default()
        };
        let (relay, _, backend, transport) =
            relay(store, FakeBackend::failing("boom"), FakeTransport::default());

        relay.handle_update(text_update(42, "hello")).await;

        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(transport.sent.lock().unwrap().is_empty());
        assert!(transport.typing.lock().unwrap().is_empty());
        assert!(transport.html.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_model_key_falls_back_to_default() {
        let store = FakeStore {
            user: Some(user(42, Some("nonexistent"), true)),
            ..FakeStore::default()
        };
        let (relay, _, backend, transport) =
            relay(store, FakeBackend::ok("hi", 0, 0), FakeTransport::default());

        relay.handle_update(text_update(42, "hello")).await;

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "gpt-x");
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn absent_model_key_falls_back_to_default() {
        let store = FakeStore {
            user: Some(user(42, None, true)),
            ..FakeStore::default()
        };
        let (relay, _, backend, _) =
            relay(store, FakeBackend::ok("hi", 0, 0), FakeTransport::default());

        relay.handle_update(text_update(42, "hello")).await;

        assert_eq!(backend.calls.lock().unwrap()[0].0, "gpt-x");
    }

    #[tokio::test]
    async fn quoted_message_is_prepended_to_prompt() {
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), true)),
            ..FakeStore::default()
        };
        let (relay, _, backend, _) =
            relay(store, FakeBackend::ok("hi", 0, 0), FakeTransport::default());

        let update = Update {
            update_id: 1,
            message: Some(text_message(42, "A", Some("Q"))),
            callback_query: None,
        };
        relay.handle_update(update).await;

        assert_eq!(backend.calls.lock().unwrap()[0].1, "Q\n\nA");
    }

    #[tokio::test]
    async fn reply_contains_answer_and_cost_line() {
        // gpt-x prices: $1/M input, $2/M output. 1M in + 0.5M out => $2.0000
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), true)),
            ..FakeStore::default()
        };
        let (relay, _, _, transport) = relay(
            store,
            FakeBackend::ok("hi", 1_000_000, 500_000),
            FakeTransport::default(),
        );

        relay.handle_update(text_update(42, "hello")).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert!(sent[0].1.starts_with("hi\n\n"));
        assert!(sent[0].1.ends_with("$2.0000"));
        // Typing indicator preceded the provider call.
        assert_eq!(*transport.typing.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn provider_failure_sends_apology_and_escalates() {
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), true)),
            admins: vec![admin(1)],
            ..FakeStore::default()
        };
        let (relay, _, _, transport) = relay(
            store,
            FakeBackend::failing("connection reset <auth & quota>"),
            FakeTransport::default(),
        );

        relay.handle_update(text_update(42, "hello")).await;

        // The user sees only the generic apology.
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, APOLOGY_TEXT);
        assert!(!sent[0].1.contains("connection reset"));

        // The admin sees the detail, inside an escaped code block.
        let html = transport.html.lock().unwrap();
        assert_eq!(html.len(), 1);
        assert_eq!(html[0].0, 1);
        assert!(html[0].1.contains("<pre><code>"));
        assert!(html[0].1.contains("&lt;auth &amp; quota&gt;"));
        assert!(!html[0].1.contains("<auth"));
    }

    #[tokio::test]
    async fn escalation_survives_individual_delivery_failures() {
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), true)),
            admins: vec![admin(1), admin(2), admin(3)],
            ..FakeStore::default()
        };
        let transport = FakeTransport {
            fail_html_for: Some(2),
            ..FakeTransport::default()
        };
        let (relay, _, _, transport) = relay(store, FakeBackend::failing("boom"), transport);

        relay.handle_update(text_update(42, "hello")).await;

        let recipients: Vec<i64> = transport.html.lock().unwrap().iter().map(|m| m.0).collect();
        assert_eq!(recipients, vec![1, 3]);
    }

    // -- Commands --

    #[tokio::test]
    async fn start_creates_user_and_replies() {
        let (relay, store, _, transport) = relay(
            FakeStore::default(),
            FakeBackend::ok("hi", 0, 0),
            FakeTransport::default(),
        );

        relay.handle_update(text_update(42, "/start")).await;

        assert_eq!(*store.created.lock().unwrap(), vec![42]);
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, WELCOME_TEXT);
    }

    #[tokio::test]
    async fn choosemodel_renders_one_button_per_model() {
        let (relay, _, _, transport) = relay(
            FakeStore::default(),
            FakeBackend::ok("hi", 0, 0),
            FakeTransport::default(),
        );

        relay.handle_update(text_update(42, "/choosemodel")).await;

        let menus = transport.menus.lock().unwrap();
        assert_eq!(menus.len(), 1);
        let (chat_id, text, buttons) = &menus[0];
        assert_eq!(*chat_id, 42);
        assert_eq!(text, CHOOSE_MODEL_TEXT);
        assert_eq!(
            *buttons,
            vec![
                ("GPT-X".to_string(), "select_model:gpt-x".to_string()),
                ("Claude Y".to_string(), "select_model:claude-y".to_string()),
            ]
        );
    }

    // -- Selection flow --

    #[tokio::test]
    async fn selecting_a_model_persists_and_acknowledges() {
        let (relay, store, _, transport) = relay(
            FakeStore::default(),
            FakeBackend::ok("hi", 0, 0),
            FakeTransport::default(),
        );

        relay
            .handle_update(callback_update(42, Some("select_model:claude-y")))
            .await;

        assert_eq!(
            *store.updates.lock().unwrap(),
            vec![(42, "claude-y".to_string())]
        );
        let acks = transport.acks.lock().unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1, "You selected: claude-y");
        let edits = transport.edits.lock().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].2, "Current model: Claude Y");
    }

    #[tokio::test]
    async fn reselecting_current_model_follows_the_same_success_path() {
        let store = FakeStore {
            user: Some(user(42, Some("gpt-x"), true)),
            ..FakeStore::default()
        };
        let (relay, store, _, transport) =
            relay(store, FakeBackend::ok("hi", 0, 0), FakeTransport::default());

        relay
            .handle_update(callback_update(42, Some("select_model:gpt-x")))
            .await;
        relay
            .handle_update(callback_update(42, Some("select_model:gpt-x")))
            .await;

        assert_eq!(
            *store.updates.lock().unwrap(),
            vec![(42, "gpt-x".to_string()), (42, "gpt-x".to_string())]
        );
        let acks = transport.acks.lock().unwrap();
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|(_, text)| text == "You selected: gpt-x"));
    }

    #[tokio::test]
    async fn selection_store_failure_acknowledges_with_generic_error() {
        let store = FakeStore {
            fail_update: true,
            ..FakeStore::default()
        };
        let (relay, _, _, transport) =
            relay(store, FakeBackend::ok("hi", 0, 0), FakeTransport::default());

        relay
            .handle_update(callback_update(42, Some("select_model:gpt-x")))
            .await;

        let acks = transport.acks.lock().unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].1, SELECTION_FAILED_TEXT);
        assert!(transport.edits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn selection_of_unknown_key_is_rejected() {
        let (relay, store, _, transport) = relay(
            FakeStore::default(),
            FakeBackend::ok("hi", 0, 0),
            FakeTransport::default(),
        );

        relay
            .handle_update(callback_update(42, Some("select_model:ghost")))
            .await;

        assert!(store.updates.lock().unwrap().is_empty());
        assert_eq!(transport.acks.lock().unwrap()[0].1, SELECTION_FAILED_TEXT);
    }

    #[tokio::test]
    async fn unrelated_callback_payload_is_ignored() {
        let (relay, store, _, transport) = relay(
            FakeStore::default(),
            FakeBackend::ok("hi", 0, 0),
            FakeTransport::default(),
        );

        relay.handle_update(callback_update(42, Some("other:x"))).await;
        relay.handle_update(callback_update(42, None)).await;

        assert!(store.updates.lock().unwrap().is_empty());
        assert!(transport.acks.lock().unwrap().is_empty());
    }

    // -- Error report formatting --

    #[test]
    fn error_report_includes_cause_chain() {
        let root = anyhow::anyhow!("socket closed");
        let err = root.context("openai request failed");
        let report = error_report(&err);
        assert!(report.starts_with("openai request failed"));
        assert!(report.contains("caused by: socket closed"));
    }
}
