//! Conversation controller.
//!
//! Per-conversation session object for a presentation layer. It exposes the
//! ordered messages of the observed chat, a status and a loading flag, all
//! as `watch` receivers, and owns at most one active exchange.
//!
//! Every exchange carries a generation number. Its driver task only touches
//! status and loading while that generation is still the current one. The
//! check and the write happen under one lock, and a superseded driver is
//! awaited before the next generation is installed, so an exchange finishing
//! late cannot clobber its successor's state.

use std::sync::{Arc, MutexGuard, PoisonError};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::reconciler::{ExchangeHandle, ExchangeOutcome, StreamReconciler};
use crate::domain::conversation::{ExchangeState, Message};
use crate::domain::foundation::{ChatId, DomainError};
use crate::ports::{ConversationStore, Credential};

/// Generation value meaning no exchange is current. Real generations start at 1.
const NO_EXCHANGE: u64 = 0;

/// Coarse status of the conversation as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChatStatus {
    #[default]
    Initial,
    Ready,
    Error(String),
}

/// Observable session over one conversation at a time.
pub struct ConversationController {
    reconciler: StreamReconciler,
    store: Arc<dyn ConversationStore>,
    messages: watch::Sender<Vec<Message>>,
    signals: Arc<Signals>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    observed: Option<Observation>,
    active: Option<ActiveExchange>,
}

struct Observation {
    chat_id: ChatId,
    forwarder: JoinHandle<()>,
}

struct ActiveExchange {
    handle: ExchangeHandle,
    driver: JoinHandle<()>,
}

impl ActiveExchange {
    /// Cancels the exchange and waits for its driver to publish its last signal.
    async fn retire(self) {
        self.handle.cancel().await;
        if let Err(e) = self.driver.await {
            tracing::warn!(generation = self.handle.generation(), error = %e, "Exchange driver ended abnormally");
        }
    }
}

/// Status and loading, shared with driver tasks.
struct Signals {
    status: watch::Sender<ChatStatus>,
    loading: watch::Sender<bool>,
    current: std::sync::Mutex<u64>,
}

impl Signals {
    fn current(&self) -> MutexGuard<'_, u64> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes `generation` current with loading mirroring its state.
    fn install(&self, generation: u64, state: ExchangeState) {
        let mut current = self.current();
        *current = generation;
        self.loading.send_replace(state.is_active());
    }

    /// Drops the current generation, clearing loading.
    fn clear(&self, status: Option<ChatStatus>) {
        let mut current = self.current();
        *current = NO_EXCHANGE;
        if let Some(status) = status {
            self.status.send_replace(status);
        }
        self.loading.send_replace(false);
    }

    fn state_changed(&self, generation: u64, state: ExchangeState) {
        let current = self.current();
        if *current != generation {
            return;
        }
        if state == ExchangeState::Streaming {
            self.status.send_replace(ChatStatus::Ready);
        }
        self.loading.send_replace(state.is_active());
    }

    fn finished(&self, generation: u64, outcome: &ExchangeOutcome) {
        let current = self.current();
        if *current != generation {
            tracing::debug!(generation, current = *current, "Stale exchange finished");
            return;
        }
        match outcome {
            ExchangeOutcome::Completed { .. } => {
                self.status.send_replace(ChatStatus::Ready);
            }
            ExchangeOutcome::Failed { message } => {
                self.status.send_replace(ChatStatus::Error(message.clone()));
            }
            ExchangeOutcome::Cancelled => {}
        }
        self.loading.send_replace(false);
    }
}

impl ConversationController {
    pub fn new(store: Arc<dyn ConversationStore>, reconciler: StreamReconciler) -> Self {
        let (messages, _) = watch::channel(Vec::new());
        let (status, _) = watch::channel(ChatStatus::Initial);
        let (loading, _) = watch::channel(false);
        Self {
            reconciler,
            store,
            messages,
            signals: Arc::new(Signals {
                status,
                loading,
                current: std::sync::Mutex::new(NO_EXCHANGE),
            }),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Live ordered message list of the observed chat.
    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ChatStatus> {
        self.signals.status.subscribe()
    }

    /// True while the active exchange is sending or streaming.
    pub fn loading(&self) -> watch::Receiver<bool> {
        self.signals.loading.subscribe()
    }

    /// Chat currently observed, if any.
    pub async fn observed_chat(&self) -> Option<ChatId> {
        self.inner.lock().await.observed.as_ref().map(|o| o.chat_id)
    }

    /// Handle of the active exchange, if one is running.
    pub async fn active_exchange(&self) -> Option<ExchangeHandle> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.handle.clone())
    }

    /// Starts re-emitting the messages of `chat_id` through [`Self::messages`].
    ///
    /// Observing the chat already observed does nothing. Switching chats
    /// stops forwarding the previous one.
    pub async fn observe_messages(&self, chat_id: ChatId) -> Result<(), DomainError> {
        let mut inner = self.inner.lock().await;
        if inner.observed.as_ref().map(|o| o.chat_id) == Some(chat_id) {
            return Ok(());
        }
        if let Some(previous) = inner.observed.take() {
            previous.forwarder.abort();
        }

        let mut feed = self
            .store
            .subscribe_messages(&chat_id)
            .await
            .map_err(|e| DomainError::from(e).with_detail("chat_id", chat_id.to_string()))?;
        self.messages.send_replace(feed.current());

        let messages = self.messages.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(list) = feed.changed().await {
                messages.send_replace(list);
            }
        });

        tracing::debug!(chat_id = %chat_id, "Observing chat");
        inner.observed = Some(Observation { chat_id, forwarder });
        Ok(())
    }

    /// Sends a user message and starts streaming the reply.
    ///
    /// Blank text is ignored. An active exchange is cancelled, and its
    /// cancellation finished, before the new one begins.
    pub async fn send(&self, chat_id: ChatId, text: &str, credential: &Credential, model: &str) {
        if text.trim().is_empty() {
            return;
        }

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.active.take() {
            tracing::debug!(generation = previous.handle.generation(), "Superseding exchange");
            previous.retire().await;
        }

        let exchange = match self.reconciler.begin(chat_id, text, credential, model).await {
            Ok(Some(exchange)) => exchange,
            Ok(None) => return,
            Err(e) => {
                let err = DomainError::from(e).with_detail("chat_id", chat_id.to_string());
                tracing::error!(chat_id = %chat_id, code = %err.code, error = %err.message, "Failed to start exchange");
                self.signals.clear(Some(ChatStatus::Error(err.message)));
                return;
            }
        };

        let handle = exchange.handle();
        let generation = handle.generation();
        let mut states = handle.state();
        self.signals.install(generation, *states.borrow_and_update());

        let signals = Arc::clone(&self.signals);
        let driver = tokio::spawn(async move {
            let run = exchange.run();
            tokio::pin!(run);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    Ok(()) = states.changed() => {
                        let state = *states.borrow_and_update();
                        signals.state_changed(generation, state);
                    }
                }
            };
            signals.finished(generation, &outcome);
        });

        inner.active = Some(ActiveExchange { handle, driver });
    }

    /// Cancels the active exchange, if any, and clears loading.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.active.take() {
            active.retire().await;
        }
        self.signals.clear(None);
    }

    /// Cancels any active exchange and stops observing.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.active.take() {
            active.retire().await;
        }
        if let Some(observed) = inner.observed.take() {
            observed.forwarder.abort();
        }
        self.signals.clear(None);
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(active) = inner.active.take() {
            active.handle.interrupt();
            active.driver.abort();
        }
        if let Some(observed) = inner.observed.take() {
            observed.forwarder.abort();
        }
    }
}
