//! Model transport port - interface to the remote chat-completions API.
//!
//! The transport turns a [`ChatRequest`] into either a long-lived streaming
//! call, surfaced as an ordered sequence of [`TransportEvent`]s, or a single
//! blocking call returning the whole reply.
//!
//! # Streaming contract
//!
//! - `streaming_call` returns immediately; I/O happens on a spawned task.
//! - Events arrive in order: `Opened`, any number of `Data`, then exactly one
//!   of `Closed` or `Failed`.
//! - `Data` carries the raw SSE `data:` payload. Interpreting it (including
//!   the `[DONE]` sentinel) is the consumer's job.
//! - Once the [`ConnectionHandle`] is closed no further events are delivered.

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::domain::conversation::{Message, Role};

/// Port for the remote model API.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Opens a streaming completion.
    ///
    /// Errors returned here mean the call could not even be started
    /// (bad credential, unserialisable request). Everything that happens on
    /// the wire is reported through `TransportEvent::Failed`.
    fn streaming_call(
        &self,
        credential: &Credential,
        request: ChatRequest,
    ) -> Result<Connection, TransportError>;

    /// Performs a non-streaming completion and waits for the full reply.
    async fn single_shot_call(
        &self,
        credential: &Credential,
        request: ChatRequest,
    ) -> Result<ChatResponse, TransportError>;
}

/// Opaque bearer token supplied by the caller at send time.
#[derive(Clone)]
pub struct Credential(Secret<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    /// Exposes the token (for building the Authorization header).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.0.expose_secret().trim().is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Request body for the chat-completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Default sampling temperature.
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    /// Default nucleus sampling mass.
    pub const DEFAULT_TOP_P: f32 = 0.9;

    /// Creates a streaming request with default sampling settings.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            stream: true,
            temperature: Self::DEFAULT_TEMPERATURE,
            top_p: Self::DEFAULT_TOP_P,
            max_tokens: None,
        }
    }

    /// Adds a message to the conversation.
    pub fn with_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
        self
    }

    /// Appends persisted messages in order, mapping `is_user` to a role.
    pub fn with_history<'a>(mut self, history: impl IntoIterator<Item = &'a Message>) -> Self {
        self.messages
            .extend(history.into_iter().map(ChatMessage::from_message));
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            role: message.role(),
            content: message.content.clone(),
        }
    }
}

/// Non-streaming response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Content of the first choice, or an empty string if there is none.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage reported by the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Protocol-level event of a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Response headers received with a success status.
    Opened,
    /// Raw `data:` payload of one server-sent event.
    Data(String),
    /// The server finished the body.
    Closed,
    /// The call failed; no further events follow.
    Failed(TransportError),
}

/// An open streaming call: its events plus the handle that closes it.
#[derive(Debug)]
pub struct Connection {
    events: mpsc::Receiver<TransportEvent>,
    handle: ConnectionHandle,
}

impl Connection {
    pub fn new(events: mpsc::Receiver<TransportEvent>, handle: ConnectionHandle) -> Self {
        Self { events, handle }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Receives the next event, or `None` once the call is over or closed.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.handle.is_closed() {
            return None;
        }
        let event = self.events.recv().await;
        if self.handle.is_closed() {
            return None;
        }
        event
    }
}

/// Cloneable handle that cancels a streaming call.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug, Default)]
struct HandleInner {
    closed: AtomicBool,
    io_task: OnceLock<AbortHandle>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the I/O task so that closing the handle aborts it.
    ///
    /// If the handle was closed already the task is aborted right away.
    pub fn attach(&self, io_task: AbortHandle) {
        let io_task = self.inner.io_task.get_or_init(|| io_task);
        if self.is_closed() {
            io_task.abort();
        }
    }

    /// Closes the call. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            if let Some(io_task) = self.inner.io_task.get() {
                io_task.abort();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("rate limited by the model API")]
    RateLimited,

    #[error("unexpected status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Maps a non-success HTTP status and body to an error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed,
            429 => Self::RateLimited,
            _ => Self::Http {
                status,
                body: body.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::ChatId;

    #[test]
    fn model_transport_is_object_safe() {
        fn _accepts_dyn(_transport: &dyn ModelTransport) {}
    }

    #[test]
    fn request_serializes_wire_names() {
        let request = ChatRequest::new("glm-4").with_message(Role::User, "hello");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "glm-4");
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hello");
        assert!(json.get("top_p").is_some());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn request_includes_max_tokens_when_set() {
        let request = ChatRequest::new("glm-4").with_max_tokens(Some(256));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_tokens"], 256);
    }

    #[test]
    fn history_maps_roles() {
        let chat_id = ChatId::new();
        let history = vec![
            Message::user(chat_id, "q"),
            Message::assistant(chat_id, "a"),
        ];
        let request = ChatRequest::new("m").with_history(&history);

        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[1].role, Role::Assistant);
        assert_eq!(request.messages[1].content, "a");
    }

    #[test]
    fn response_content_reads_first_choice() {
        let raw = r#"{"id":"x","object":"chat.completion","created":1,"model":"glm-4",
            "choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}],
            "usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.content(), "Hello");
        assert_eq!(response.usage.unwrap().total_tokens, 4);
    }

    #[test]
    fn response_without_choices_has_empty_content() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert_eq!(response.content(), "");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("sk-secret");
        assert!(!format!("{:?}", credential).contains("sk-secret"));
        assert_eq!(credential.expose(), "sk-secret");
        assert!(Credential::new("  ").is_blank());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            TransportError::from_status(401, ""),
            TransportError::AuthenticationFailed
        );
        assert_eq!(TransportError::from_status(429, ""), TransportError::RateLimited);
        assert!(matches!(
            TransportError::from_status(500, "boom"),
            TransportError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn timeout_displays_seconds() {
        let err = TransportError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "request timed out after 30s");
    }

    #[tokio::test]
    async fn closed_connection_yields_no_events() {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new();
        let mut connection = Connection::new(rx, handle.clone());

        tx.send(TransportEvent::Opened).await.unwrap();
        assert_eq!(connection.next_event().await, Some(TransportEvent::Opened));

        tx.send(TransportEvent::Data("x".into())).await.unwrap();
        handle.close();
        assert_eq!(connection.next_event().await, None);
    }

    #[tokio::test]
    async fn close_aborts_attached_task() {
        let handle = ConnectionHandle::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        handle.attach(task.abort_handle());
        handle.close();
        handle.close();

        let result = task.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn attach_after_close_aborts_immediately() {
        let handle = ConnectionHandle::new();
        handle.close();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        handle.attach(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
