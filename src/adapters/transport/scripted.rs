//! Scripted model transport for testing.
//!
//! Replays pre-configured event sequences instead of calling a real API.
//!
//! # Features
//!
//! - Scripted event sequences with pauses, consumed one per call
//! - Streams that hold open until closed, for cancellation tests
//! - Manually driven streams, for tests that need exact interleaving
//! - Synchronous rejection and single-shot replies
//! - Call tracking for verification
//!
//! # Example
//!
//! ```ignore
//! let transport = ScriptedTransport::new().with_deltas(&["Hi", " there"]);
//! let connection = transport.streaming_call(&credential, request)?;
//! ```

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::domain::conversation::DONE_SENTINEL;
use crate::ports::{
    ChatRequest, ChatResponse, Connection, ConnectionHandle, Credential, ModelTransport,
    ResponseChoice, ResponseMessage, TransportError, TransportEvent,
};

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver an event.
    Emit(TransportEvent),
    /// Wait before the next step.
    Pause(Duration),
    /// Keep the stream open until the connection is closed.
    Hold,
}

#[derive(Debug)]
enum Script {
    Stream(Vec<ScriptStep>),
    Manual(ManualStream),
    Reject(TransportError),
    Reply {
        result: Result<String, TransportError>,
        delay: Duration,
    },
}

/// Consumer end of a manually driven stream, parked until the next call.
#[derive(Debug)]
struct ManualStream {
    events: mpsc::Receiver<TransportEvent>,
    handle: ConnectionHandle,
}

/// Sender half returned to the test for a manual stream.
#[derive(Debug, Clone)]
pub struct StreamDriver {
    tx: mpsc::Sender<TransportEvent>,
    handle: ConnectionHandle,
}

impl StreamDriver {
    /// Delivers an event; returns false once the consumer is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Delivers a content delta chunk.
    pub async fn delta(&self, text: &str) -> bool {
        self.emit(TransportEvent::Data(delta_payload(text))).await
    }

    /// True once the consumer closed the connection.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Scripted transport for testing.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    calls: Arc<Mutex<Vec<ChatRequest>>>,
    handles: Arc<Mutex<Vec<ConnectionHandle>>>,
}

/// Builds an OpenAI-style streaming chunk carrying `text` as delta content.
pub fn delta_payload(text: &str) -> String {
    json!({
        "id": "chatcmpl-scripted",
        "object": "chat.completion.chunk",
        "choices": [{ "index": 0, "delta": { "content": text } }]
    })
    .to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a stream made of explicit steps.
    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.push(Script::Stream(steps));
        self
    }

    /// Queues a stream that only delivers the given events.
    pub fn with_events(self, events: Vec<TransportEvent>) -> Self {
        self.with_script(events.into_iter().map(ScriptStep::Emit).collect())
    }

    /// Queues a well-formed reply: `Opened`, one chunk per delta, `[DONE]`, `Closed`.
    pub fn with_deltas(self, deltas: &[&str]) -> Self {
        let mut events = vec![TransportEvent::Opened];
        events.extend(
            deltas
                .iter()
                .map(|text| TransportEvent::Data(delta_payload(text))),
        );
        events.push(TransportEvent::Data(DONE_SENTINEL.to_string()));
        events.push(TransportEvent::Closed);
        self.with_events(events)
    }

    /// Queues a stream that opens, delivers `deltas` and then stays open.
    pub fn with_open_stream(self, deltas: &[&str]) -> Self {
        let mut steps = vec![ScriptStep::Emit(TransportEvent::Opened)];
        steps.extend(
            deltas
                .iter()
                .map(|text| ScriptStep::Emit(TransportEvent::Data(delta_payload(text)))),
        );
        steps.push(ScriptStep::Hold);
        self.with_script(steps)
    }

    /// Queues a stream driven by the returned [`StreamDriver`].
    pub fn manual_stream(&self, buffer: usize) -> StreamDriver {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = ConnectionHandle::new();
        self.push(Script::Manual(ManualStream {
            events: rx,
            handle: handle.clone(),
        }));
        StreamDriver { tx, handle }
    }

    /// Queues a synchronous rejection of the next streaming call.
    pub fn with_rejection(self, error: TransportError) -> Self {
        self.push(Script::Reject(error));
        self
    }

    /// Queues a single-shot reply.
    pub fn with_reply(self, content: impl Into<String>) -> Self {
        self.push(Script::Reply {
            result: Ok(content.into()),
            delay: Duration::ZERO,
        });
        self
    }

    /// Queues a single-shot reply that arrives after `delay`.
    pub fn with_delayed_reply(self, content: impl Into<String>, delay: Duration) -> Self {
        self.push(Script::Reply {
            result: Ok(content.into()),
            delay,
        });
        self
    }

    /// Queues a single-shot failure.
    pub fn with_reply_error(self, error: TransportError) -> Self {
        self.push(Script::Reply {
            result: Err(error),
            delay: Duration::ZERO,
        });
        self
    }

    /// Requests received so far, in call order.
    pub fn calls(&self) -> Vec<ChatRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Handles of every streaming connection handed out.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        lock(&self.handles).clone()
    }

    fn push(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    fn next_script(&self) -> Option<Script> {
        lock(&self.scripts).pop_front()
    }

    fn record(&self, request: ChatRequest) {
        lock(&self.calls).push(request);
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    fn streaming_call(
        &self,
        _credential: &Credential,
        request: ChatRequest,
    ) -> Result<Connection, TransportError> {
        self.record(request);

        let steps = match self.next_script() {
            Some(Script::Stream(steps)) => steps,
            Some(Script::Manual(manual)) => {
                lock(&self.handles).push(manual.handle.clone());
                return Ok(Connection::new(manual.events, manual.handle));
            }
            Some(Script::Reject(error)) => return Err(error),
            Some(Script::Reply { .. }) => {
                return Err(TransportError::InvalidRequest(
                    "single-shot reply scripted for a streaming call".into(),
                ))
            }
            None => vec![
                ScriptStep::Emit(TransportEvent::Opened),
                ScriptStep::Emit(TransportEvent::Closed),
            ],
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::InvalidRequest(format!("No async runtime: {}", e)))?;
        let (tx, rx) = mpsc::channel(steps.len().max(1));
        let handle = ConnectionHandle::new();

        let io_task = runtime.spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Pause(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Hold => std::future::pending::<()>().await,
                }
            }
        });
        handle.attach(io_task.abort_handle());
        lock(&self.handles).push(handle.clone());

        Ok(Connection::new(rx, handle))
    }

    async fn single_shot_call(
        &self,
        _credential: &Credential,
        request: ChatRequest,
    ) -> Result<ChatResponse, TransportError> {
        let model = request.model.clone();
        self.record(request);

        let (result, delay) = match self.next_script() {
            Some(Script::Reply { result, delay }) => (result, delay),
            Some(_) => {
                return Err(TransportError::InvalidRequest(
                    "streaming script queued for a single-shot call".into(),
                ))
            }
            None => (Ok(String::new()), Duration::ZERO),
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        result.map(|content| ChatResponse {
            id: Some("chatcmpl-scripted".to_string()),
            model: Some(model),
            choices: vec![ResponseChoice {
                index: 0,
                message: ResponseMessage {
                    role: Some("assistant".to_string()),
                    content: Some(content),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        })
    }
}
