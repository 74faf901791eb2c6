//! Stream reconciler.
//!
//! Owns one exchange end-to-end: it persists the user message and the
//! assistant placeholder, opens the model call, folds streamed deltas into
//! the placeholder and finalises it exactly once.
//!
//! # Write ordering
//!
//! Every store write for an exchange happens while holding that exchange's
//! async lock. The lock also guards the `finished` flag, which is set by
//! whichever of completion, failure or cancellation gets there first. Once
//! it is set no further write for the exchange is issued, so after
//! [`ExchangeHandle::cancel`] returns the placeholder is frozen.
//!
//! # Example
//!
//! ```ignore
//! let reconciler = StreamReconciler::new(store, transport, config);
//! if let Some(exchange) = reconciler.begin(chat_id, "hello", &credential, "").await? {
//!     let handle = exchange.handle();
//!     let outcome = exchange.run().await;
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};

use crate::config::ModelConfig;
use crate::domain::conversation::{Chat, ExchangeState, Message, ResponseBuffer, StreamFrame};
use crate::domain::foundation::{ChatId, DomainError, MessageId, StateMachine, Timestamp};
use crate::ports::{
    ChatRequest, Connection, ConnectionHandle, ConversationStore, Credential, ModelTransport,
    StoreError, TransportError, TransportEvent,
};

/// Errors returned while setting up an exchange.
///
/// Transport problems never appear here; they finish the exchange as
/// [`ExchangeOutcome::Failed`] instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<ReconcileError> for DomainError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Storage(inner) => DomainError::from(inner),
        }
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed { content: String },
    Cancelled,
    Failed { message: String },
}

/// Starts exchanges against a store and a model transport.
#[derive(Clone)]
pub struct StreamReconciler {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn ModelTransport>,
    config: ModelConfig,
    generations: Arc<AtomicU64>,
}

impl StreamReconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn ModelTransport>,
        config: ModelConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Persists the user turn and opens the model call.
    ///
    /// Returns `Ok(None)` for blank text, leaving the store untouched.
    ///
    /// # Errors
    ///
    /// - `Storage` if the chat, the user message or the placeholder could not
    ///   be written
    pub async fn begin(
        &self,
        chat_id: ChatId,
        text: &str,
        credential: &Credential,
        model: &str,
    ) -> Result<Option<Exchange>, ReconcileError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        let mut chat = match self.store.get_chat(&chat_id).await? {
            Some(chat) => chat,
            None => {
                let chat = Chat::for_first_message(chat_id, text);
                self.store.insert_chat(&chat).await?;
                tracing::debug!(chat_id = %chat_id, title = %chat.title, "Created chat");
                chat
            }
        };

        let history = self.recover_orphans(chat_id).await?;

        let mut user_message = Message::user(chat_id, text);
        if let Some(latest) = history.last() {
            user_message.timestamp = Timestamp::now_not_before(latest.timestamp);
        }
        self.store.insert_message(&user_message).await?;
        chat = chat.touched();
        self.store.update_chat(&chat).await?;

        let placeholder = Message::assistant_placeholder(chat_id, user_message.timestamp);
        self.store.insert_message(&placeholder).await?;
        chat = chat.touched();
        self.store.update_chat(&chat).await?;

        let request = self.build_request(model, &history, &user_message);
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

        let model = request.model.clone();
        let stream = request.stream;
        let (source, connection) = if stream {
            match self.transport.streaming_call(credential, request) {
                Ok(connection) => {
                    let handle = connection.handle();
                    (Source::Streaming(connection), handle)
                }
                Err(error) => (Source::Rejected(error), ConnectionHandle::new()),
            }
        } else {
            let source = Source::SingleShot {
                transport: Arc::clone(&self.transport),
                credential: credential.clone(),
                request,
            };
            (source, ConnectionHandle::new())
        };

        let (state_tx, _) = watch::channel(ExchangeState::Idle);
        let shared = Arc::new(Shared {
            store: Arc::clone(&self.store),
            placeholder,
            generation,
            guard: Mutex::new(WriteGuard::default()),
            state: state_tx,
            connection,
            cancelled: Notify::new(),
        });
        shared.advance(ExchangeState::Sending);

        tracing::info!(
            chat_id = %chat_id,
            message_id = %shared.placeholder.id,
            generation,
            model = %model,
            stream,
            "Exchange started"
        );

        Ok(Some(Exchange { shared, source }))
    }

    /// Loads the chat's messages, finalising placeholders left streaming by
    /// an exchange that was dropped without being cancelled.
    ///
    /// Each orphan keeps whatever content it had committed.
    async fn recover_orphans(&self, chat_id: ChatId) -> Result<Vec<Message>, ReconcileError> {
        let mut history = self.store.get_messages(&chat_id).await?;
        for message in history.iter_mut().filter(|m| m.is_streaming) {
            let recovered = message.finalized(message.content.clone());
            self.store.update_message(&recovered).await?;
            tracing::warn!(
                chat_id = %chat_id,
                message_id = %message.id,
                "Finalised orphaned streaming message"
            );
            *message = recovered;
        }
        Ok(history)
    }

    fn build_request(&self, model: &str, history: &[Message], user: &Message) -> ChatRequest {
        let prior = history.iter().filter(|message| !message.content.is_empty());

        ChatRequest::new(self.config.resolve_model(model))
            .with_history(prior.chain(std::iter::once(user)))
            .with_stream(self.config.stream)
            .with_temperature(self.config.temperature)
            .with_top_p(self.config.top_p)
            .with_max_tokens(self.config.max_tokens)
    }
}

enum Source {
    Streaming(Connection),
    SingleShot {
        transport: Arc<dyn ModelTransport>,
        credential: Credential,
        request: ChatRequest,
    },
    Rejected(TransportError),
}

/// One in-flight user turn and its assistant reply.
pub struct Exchange {
    shared: Arc<Shared>,
    source: Source,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("message_id", &self.shared.placeholder.id)
            .field("generation", &self.shared.generation)
            .finish()
    }
}

impl Exchange {
    pub fn handle(&self) -> ExchangeHandle {
        ExchangeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drives the exchange until it completes, fails or is cancelled.
    pub async fn run(self) -> ExchangeOutcome {
        let Exchange { shared, source } = self;
        match source {
            Source::Streaming(connection) => shared.consume(connection).await,
            Source::SingleShot {
                transport,
                credential,
                request,
            } => shared.single_shot(transport, credential, request).await,
            Source::Rejected(error) => {
                tracing::warn!(
                    generation = shared.generation,
                    error = %error,
                    "Streaming call rejected"
                );
                shared.fail(&error.to_string()).await
            }
        }
    }
}

/// Cloneable control surface of an exchange.
#[derive(Clone)]
pub struct ExchangeHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("message_id", &self.shared.placeholder.id)
            .field("generation", &self.shared.generation)
            .finish()
    }
}

impl ExchangeHandle {
    /// Cancels the exchange.
    ///
    /// Closes the connection and, unless the exchange already finished,
    /// finalises the placeholder with the last committed content. No store
    /// write for this exchange happens after this returns.
    pub async fn cancel(&self) {
        let shared = &self.shared;
        if shared.state.borrow().is_terminal() {
            return;
        }
        shared.connection.close();
        shared.cancelled.notify_one();

        let mut guard = shared.guard.lock().await;
        if guard.finished {
            return;
        }
        guard.finished = true;

        let last = shared.placeholder.finalized(guard.committed.clone());
        if let Err(e) = shared.store.update_message(&last).await {
            tracing::error!(
                message_id = %shared.placeholder.id,
                generation = shared.generation,
                error = %e,
                "Failed to finalise cancelled message"
            );
        }
        shared.advance(ExchangeState::Cancelled);
        tracing::warn!(
            message_id = %shared.placeholder.id,
            generation = shared.generation,
            "Exchange cancelled"
        );
    }

    /// Closes the connection without touching the store.
    ///
    /// Used on teardown paths that cannot await. The placeholder keeps its
    /// last committed content and stays marked as streaming.
    pub fn interrupt(&self) {
        self.shared.connection.close();
        self.shared.cancelled.notify_one();
    }

    pub fn state(&self) -> watch::Receiver<ExchangeState> {
        self.shared.state.subscribe()
    }

    pub fn current_state(&self) -> ExchangeState {
        *self.shared.state.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn chat_id(&self) -> ChatId {
        self.shared.placeholder.chat_id
    }

    /// Id of the assistant placeholder this exchange writes.
    pub fn message_id(&self) -> MessageId {
        self.shared.placeholder.id
    }
}

#[derive(Debug, Default)]
struct WriteGuard {
    finished: bool,
    committed: String,
}

struct Shared {
    store: Arc<dyn ConversationStore>,
    placeholder: Message,
    generation: u64,
    guard: Mutex<WriteGuard>,
    state: watch::Sender<ExchangeState>,
    connection: ConnectionHandle,
    cancelled: Notify,
}

impl Shared {
    fn advance(&self, target: ExchangeState) {
        let current = *self.state.borrow();
        match current.transition_to(target) {
            Ok(next) => {
                tracing::debug!(generation = self.generation, from = ?current, to = ?next, "Exchange state");
                self.state.send_replace(next);
            }
            Err(e) => {
                tracing::debug!(generation = self.generation, error = %e, "Ignored state change");
            }
        }
    }

    async fn consume(&self, mut connection: Connection) -> ExchangeOutcome {
        let mut buffer = ResponseBuffer::new();

        loop {
            let event = tokio::select! {
                event = connection.next_event() => event,
                _ = self.cancelled.notified() => None,
            };

            match event {
                Some(TransportEvent::Opened) => {
                    if self.guard.lock().await.finished {
                        return ExchangeOutcome::Cancelled;
                    }
                    self.advance(ExchangeState::Streaming);
                }
                Some(TransportEvent::Data(raw)) => match StreamFrame::parse(&raw) {
                    StreamFrame::Done => {
                        tracing::debug!(generation = self.generation, "Done sentinel");
                    }
                    StreamFrame::Delta(text) => {
                        buffer.push(&text);
                        if let Some(outcome) = self.commit(buffer.as_str()).await {
                            return outcome;
                        }
                    }
                    StreamFrame::Empty => {}
                    StreamFrame::Malformed(reason) => {
                        tracing::debug!(generation = self.generation, reason = %reason, "Skipped frame");
                    }
                },
                Some(TransportEvent::Closed) => {
                    tracing::debug!(
                        generation = self.generation,
                        fragments = buffer.fragment_count(),
                        "Stream closed"
                    );
                    return self.complete(buffer.into_string()).await;
                }
                Some(TransportEvent::Failed(error)) => {
                    tracing::warn!(generation = self.generation, error = %error, "Stream failed");
                    return self.fail(&error.to_string()).await;
                }
                None => {
                    if self.connection.is_closed() {
                        return ExchangeOutcome::Cancelled;
                    }
                    return self.complete(buffer.into_string()).await;
                }
            }
        }
    }

    /// Writes the cumulative text. Returns an outcome when the exchange ended.
    async fn commit(&self, content: &str) -> Option<ExchangeOutcome> {
        let mut guard = self.guard.lock().await;
        if guard.finished {
            return Some(ExchangeOutcome::Cancelled);
        }
        match self
            .store
            .update_message(&self.placeholder.with_content(content))
            .await
        {
            Ok(()) => {
                guard.committed = content.to_string();
                None
            }
            Err(e) => {
                tracing::error!(
                    message_id = %self.placeholder.id,
                    generation = self.generation,
                    error = %e,
                    "Failed to write streamed content"
                );
                self.connection.close();
                Some(self.finish_failed(&mut guard, &e.to_string()).await)
            }
        }
    }

    async fn complete(&self, content: String) -> ExchangeOutcome {
        let mut guard = self.guard.lock().await;
        if guard.finished {
            return ExchangeOutcome::Cancelled;
        }
        match self
            .store
            .update_message(&self.placeholder.finalized(content.clone()))
            .await
        {
            Ok(()) => {
                guard.finished = true;
                guard.committed = content.clone();
                self.advance(ExchangeState::Completed);
                tracing::info!(
                    message_id = %self.placeholder.id,
                    generation = self.generation,
                    chars = content.chars().count(),
                    "Exchange completed"
                );
                ExchangeOutcome::Completed { content }
            }
            Err(e) => {
                tracing::error!(
                    message_id = %self.placeholder.id,
                    generation = self.generation,
                    error = %e,
                    "Failed to finalise message"
                );
                self.finish_failed(&mut guard, &e.to_string()).await
            }
        }
    }

    async fn fail(&self, cause: &str) -> ExchangeOutcome {
        let mut guard = self.guard.lock().await;
        if guard.finished {
            return ExchangeOutcome::Cancelled;
        }
        self.finish_failed(&mut guard, cause).await
    }

    async fn finish_failed(&self, guard: &mut WriteGuard, cause: &str) -> ExchangeOutcome {
        guard.finished = true;
        let content = format!("Error: {}", cause);
        if let Err(e) = self
            .store
            .update_message(&self.placeholder.finalized(content.clone()))
            .await
        {
            tracing::error!(
                message_id = %self.placeholder.id,
                generation = self.generation,
                error = %e,
                "Failed to record exchange error"
            );
        } else {
            guard.committed = content;
        }
        self.advance(ExchangeState::Failed);
        tracing::warn!(
            message_id = %self.placeholder.id,
            generation = self.generation,
            cause,
            "Exchange failed"
        );
        ExchangeOutcome::Failed {
            message: cause.to_string(),
        }
    }

    async fn single_shot(
        &self,
        transport: Arc<dyn ModelTransport>,
        credential: Credential,
        request: ChatRequest,
    ) -> ExchangeOutcome {
        let result = tokio::select! {
            result = transport.single_shot_call(&credential, request) => result,
            _ = self.cancelled.notified() => return ExchangeOutcome::Cancelled,
        };

        match result {
            Ok(response) => self.complete(response.content().to_string()).await,
            Err(error) => {
                tracing::warn!(generation = self.generation, error = %error, "Single-shot call failed");
                self.fail(&error.to_string()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{delta_payload, InMemoryConversationStore, ScriptedTransport};
    use std::time::Duration;

    fn credential() -> Credential {
        Credential::new("sk-test")
    }

    fn reconciler_with(
        store: &InMemoryConversationStore,
        transport: &ScriptedTransport,
        config: ModelConfig,
    ) -> StreamReconciler {
        StreamReconciler::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            config,
        )
    }

    fn reconciler(
        store: &InMemoryConversationStore,
        transport: &ScriptedTransport,
    ) -> StreamReconciler {
        reconciler_with(store, transport, ModelConfig::default())
    }

    async fn placeholder_of(store: &InMemoryConversationStore, handle: &ExchangeHandle) -> Message {
        store
            .get_messages(&handle.chat_id())
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.id == handle.message_id())
            .unwrap()
    }

    async fn wait_for_content(store: &InMemoryConversationStore, handle: &ExchangeHandle, expected: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if placeholder_of(store, handle).await.content == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    mod begin {
        use super::*;

        #[tokio::test]
        async fn blank_text_changes_nothing() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "   \n\t", &credential(), "")
                .await
                .unwrap();

            assert!(exchange.is_none());
            assert_eq!(store.message_count().await, 0);
            assert_eq!(transport.call_count(), 0);
        }

        #[tokio::test]
        async fn persists_user_message_and_streaming_placeholder() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_deltas(&["ok"]);
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();

            let exchange = reconciler
                .begin(chat_id, "hello", &credential(), "")
                .await
                .unwrap()
                .unwrap();

            let messages = store.get_messages(&chat_id).await.unwrap();
            assert_eq!(messages.len(), 2);
            assert!(messages[0].is_user);
            assert!(!messages[0].is_streaming);
            assert_eq!(messages[0].content, "hello");
            assert!(!messages[1].is_user);
            assert!(messages[1].is_streaming);
            assert!(messages[1].content.is_empty());
            assert!(!messages[1].timestamp.is_before(&messages[0].timestamp));
            assert_eq!(exchange.handle().message_id(), messages[1].id);
            assert_eq!(exchange.handle().current_state(), ExchangeState::Sending);
        }

        #[tokio::test]
        async fn creates_missing_chat_with_derived_title() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();

            reconciler
                .begin(chat_id, "  Plan a trip to Kyoto\nin spring", &credential(), "")
                .await
                .unwrap();

            let chat = store.get_chat(&chat_id).await.unwrap().unwrap();
            assert_eq!(chat.title, "Plan a trip to Kyoto");
            assert!(!chat.updated_at.is_before(&chat.created_at));
        }

        #[tokio::test]
        async fn request_carries_history_then_new_message() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();
            store.insert_chat(&Chat::with_id(chat_id, "t")).await.unwrap();
            store.insert_message(&Message::user(chat_id, "q1")).await.unwrap();
            store
                .insert_message(&Message::assistant(chat_id, "a1"))
                .await
                .unwrap();

            reconciler
                .begin(chat_id, "q2", &credential(), "glm-4-flash")
                .await
                .unwrap();

            let request = &transport.calls()[0];
            let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["q1", "a1", "q2"]);
            assert_eq!(request.model, "glm-4-flash");
            assert!(request.stream);
        }

        #[tokio::test]
        async fn orphaned_placeholder_is_finalised_and_joins_history() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();
            store.insert_chat(&Chat::with_id(chat_id, "t")).await.unwrap();
            let question = Message::user(chat_id, "q1");
            store.insert_message(&question).await.unwrap();
            let orphan = Message::assistant_placeholder(chat_id, question.timestamp)
                .with_content("half an ans");
            store.insert_message(&orphan).await.unwrap();

            reconciler
                .begin(chat_id, "q2", &credential(), "")
                .await
                .unwrap();

            let messages = store.get_messages(&chat_id).await.unwrap();
            let recovered = messages.iter().find(|m| m.id == orphan.id).unwrap();
            assert!(!recovered.is_streaming);
            assert_eq!(recovered.content, "half an ans");

            let calls = transport.calls();
            let contents: Vec<&str> = calls[0]
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect();
            assert_eq!(contents, vec!["q1", "half an ans", "q2"]);
        }

        #[tokio::test]
        async fn user_message_never_sorts_before_history() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();
            store.insert_chat(&Chat::with_id(chat_id, "t")).await.unwrap();
            let mut ahead = Message::assistant(chat_id, "from a fast clock");
            ahead.timestamp = Timestamp::from_unix_millis(Timestamp::now().as_unix_millis() + 60_000);
            store.insert_message(&ahead).await.unwrap();

            reconciler
                .begin(chat_id, "next", &credential(), "")
                .await
                .unwrap();

            let messages = store.get_messages(&chat_id).await.unwrap();
            let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["from a fast clock", "next", ""]);
            assert!(!messages[1].timestamp.is_before(&ahead.timestamp));
        }

        #[tokio::test]
        async fn blank_model_uses_configured_default() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);

            reconciler
                .begin(ChatId::new(), "hi", &credential(), " ")
                .await
                .unwrap();

            assert_eq!(transport.calls()[0].model, "glm-4");
        }

        #[tokio::test]
        async fn storage_failure_is_returned() {
            let store = InMemoryConversationStore::new();
            store.set_fail_writes(true);
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);

            let result = reconciler.begin(ChatId::new(), "hi", &credential(), "").await;

            assert!(matches!(result, Err(ReconcileError::Storage(_))));
            assert_eq!(transport.call_count(), 0);
        }

        #[tokio::test]
        async fn generations_increase() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let reconciler = reconciler(&store, &transport);
            let chat_id = ChatId::new();

            let first = reconciler.begin(chat_id, "a", &credential(), "").await.unwrap().unwrap();
            let second = reconciler.begin(chat_id, "b", &credential(), "").await.unwrap().unwrap();

            assert!(second.handle().generation() > first.handle().generation());
        }
    }

    mod run {
        use super::*;

        #[tokio::test]
        async fn deltas_accumulate_into_final_content() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_deltas(&["Hi", " there"]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "hello", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let outcome = exchange.run().await;

            assert_eq!(
                outcome,
                ExchangeOutcome::Completed {
                    content: "Hi there".to_string()
                }
            );
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "Hi there");
            assert!(!message.is_streaming);
            assert_eq!(handle.current_state(), ExchangeState::Completed);
        }

        #[tokio::test]
        async fn empty_and_malformed_frames_are_skipped() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_events(vec![
                TransportEvent::Opened,
                TransportEvent::Data(delta_payload("A")),
                TransportEvent::Data(r#"{"choices":[{"delta":{}}]}"#.to_string()),
                TransportEvent::Data("not json".to_string()),
                TransportEvent::Data(delta_payload("")),
                TransportEvent::Data(delta_payload("B")),
                TransportEvent::Data("[DONE]".to_string()),
                TransportEvent::Closed,
            ]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let outcome = exchange.run().await;

            assert_eq!(
                outcome,
                ExchangeOutcome::Completed {
                    content: "AB".to_string()
                }
            );
        }

        #[tokio::test]
        async fn done_sentinel_never_appends() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_events(vec![
                TransportEvent::Opened,
                TransportEvent::Data("[DONE]".to_string()),
                TransportEvent::Closed,
            ]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            exchange.run().await;

            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "");
            assert!(!message.is_streaming);
        }

        #[tokio::test]
        async fn channel_end_without_close_counts_as_closed() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_events(vec![
                TransportEvent::Opened,
                TransportEvent::Data(delta_payload("partial")),
            ]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();

            assert_eq!(
                exchange.run().await,
                ExchangeOutcome::Completed {
                    content: "partial".to_string()
                }
            );
        }

        #[tokio::test]
        async fn transport_failure_writes_error_content() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_events(vec![
                TransportEvent::Opened,
                TransportEvent::Failed(TransportError::Timeout { timeout_secs: 30 }),
            ]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let outcome = exchange.run().await;

            assert!(matches!(outcome, ExchangeOutcome::Failed { .. }));
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "Error: request timed out after 30s");
            assert!(!message.is_streaming);
            assert_eq!(handle.current_state(), ExchangeState::Failed);
        }

        #[tokio::test]
        async fn synchronous_rejection_fails_the_exchange() {
            let store = InMemoryConversationStore::new();
            let transport =
                ScriptedTransport::new().with_rejection(TransportError::AuthenticationFailed);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let outcome = exchange.run().await;

            assert_eq!(
                outcome,
                ExchangeOutcome::Failed {
                    message: "authentication failed".to_string()
                }
            );
            assert_eq!(
                placeholder_of(&store, &handle).await.content,
                "Error: authentication failed"
            );
        }

        #[tokio::test]
        async fn storage_failure_mid_stream_fails_and_closes() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let driver = transport.manual_stream(8);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            store.set_fail_writes(true);

            let task = tokio::spawn(exchange.run());
            driver.emit(TransportEvent::Opened).await;
            driver.delta("boom").await;

            let outcome = task.await.unwrap();
            assert!(matches!(outcome, ExchangeOutcome::Failed { .. }));
            assert!(driver.is_closed());
        }
    }

    mod cancel {
        use super::*;

        #[tokio::test]
        async fn freezes_last_committed_content() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let driver = transport.manual_stream(8);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let task = tokio::spawn(exchange.run());

            driver.emit(TransportEvent::Opened).await;
            driver.delta("Hi").await;
            wait_for_content(&store, &handle, "Hi").await;

            handle.cancel().await;
            let writes_after_cancel = store.message_writes();

            driver.delta(" more").await;
            driver.emit(TransportEvent::Closed).await;
            let outcome = task.await.unwrap();

            assert_eq!(outcome, ExchangeOutcome::Cancelled);
            assert_eq!(store.message_writes(), writes_after_cancel);
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "Hi");
            assert!(!message.is_streaming);
            assert!(driver.is_closed());
            assert_eq!(handle.current_state(), ExchangeState::Cancelled);
        }

        #[tokio::test]
        async fn before_open_finalises_empty_placeholder() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new();
            let _driver = transport.manual_stream(8);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();

            handle.cancel().await;
            let outcome = exchange.run().await;

            assert_eq!(outcome, ExchangeOutcome::Cancelled);
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "");
            assert!(!message.is_streaming);
        }

        #[tokio::test]
        async fn is_idempotent() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_open_stream(&["a"]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let task = tokio::spawn(exchange.run());
            wait_for_content(&store, &handle, "a").await;

            handle.cancel().await;
            let writes = store.message_writes();
            handle.cancel().await;

            assert_eq!(store.message_writes(), writes);
            assert_eq!(task.await.unwrap(), ExchangeOutcome::Cancelled);
        }

        #[tokio::test]
        async fn after_completion_is_a_no_op() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_deltas(&["done"]);
            let reconciler = reconciler(&store, &transport);

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            exchange.run().await;
            let writes = store.message_writes();

            handle.cancel().await;

            assert_eq!(store.message_writes(), writes);
            assert_eq!(placeholder_of(&store, &handle).await.content, "done");
            assert_eq!(handle.current_state(), ExchangeState::Completed);
        }
    }

    mod single_shot {
        use super::*;

        fn non_streaming() -> ModelConfig {
            ModelConfig {
                stream: false,
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn writes_full_reply_once() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_reply("Whole answer");
            let reconciler = reconciler_with(&store, &transport, non_streaming());

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let outcome = exchange.run().await;

            assert_eq!(
                outcome,
                ExchangeOutcome::Completed {
                    content: "Whole answer".to_string()
                }
            );
            assert!(!transport.calls()[0].stream);
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "Whole answer");
            assert!(!message.is_streaming);
        }

        #[tokio::test]
        async fn failure_writes_error_content() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new().with_reply_error(TransportError::RateLimited);
            let reconciler = reconciler_with(&store, &transport, non_streaming());

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            exchange.run().await;

            assert_eq!(
                placeholder_of(&store, &handle).await.content,
                "Error: rate limited by the model API"
            );
        }

        #[tokio::test]
        async fn cancel_races_the_call() {
            let store = InMemoryConversationStore::new();
            let transport = ScriptedTransport::new()
                .with_delayed_reply("too late", Duration::from_secs(30));
            let reconciler = reconciler_with(&store, &transport, non_streaming());

            let exchange = reconciler
                .begin(ChatId::new(), "x", &credential(), "")
                .await
                .unwrap()
                .unwrap();
            let handle = exchange.handle();
            let task = tokio::spawn(exchange.run());

            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel().await;

            let outcome = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(outcome, ExchangeOutcome::Cancelled);
            let message = placeholder_of(&store, &handle).await;
            assert_eq!(message.content, "");
            assert!(!message.is_streaming);
        }
    }
}
