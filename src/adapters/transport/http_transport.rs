//! HTTP model transport over reqwest.
//!
//! Streaming calls POST with `stream: true` and decode the SSE body on a
//! spawned task. The client carries a connect timeout only: a streamed
//! reply may stay open for as long as the model keeps talking, so the
//! receive phase is unbounded. Sending the request and waiting for the
//! response headers is bounded by the write timeout.
//!
//! # Errors
//!
//! | Status | Error |
//! |--------|-------|
//! | 401/403 | `AuthenticationFailed` |
//! | 429 | `RateLimited` |
//! | other non-2xx | `Http { status, body }` |

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use std::time::Duration;
use tokio::sync::mpsc;

use super::SseDecoder;
use crate::config::ModelConfig;
use crate::ports::{
    ChatRequest, ChatResponse, Connection, ConnectionHandle, Credential, ModelTransport,
    TransportError, TransportEvent,
};

/// Chat-completions transport for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct HttpModelTransport {
    client: Client,
    config: ModelConfig,
}

impl HttpModelTransport {
    /// Builds the HTTP client from model configuration.
    pub fn new(config: ModelConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn post(&self, credential: &Credential, request: &ChatRequest) -> reqwest::RequestBuilder {
        self.client
            .post(self.config.completions_url())
            .bearer_auth(credential.expose())
            .json(request)
    }
}

#[async_trait]
impl ModelTransport for HttpModelTransport {
    fn streaming_call(
        &self,
        credential: &Credential,
        request: ChatRequest,
    ) -> Result<Connection, TransportError> {
        if credential.is_blank() {
            return Err(TransportError::AuthenticationFailed);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::InvalidRequest(format!("No async runtime: {}", e)))?;

        let request = request.with_stream(true);
        let builder = self
            .post(credential, &request)
            .header(ACCEPT, "text/event-stream");
        let write_timeout = self.config.write_timeout();

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let handle = ConnectionHandle::new();

        tracing::debug!(model = %request.model, messages = request.messages.len(), "Opening streaming call");
        let io_task = runtime.spawn(drive_stream(builder, write_timeout, tx));
        handle.attach(io_task.abort_handle());

        Ok(Connection::new(rx, handle))
    }

    async fn single_shot_call(
        &self,
        credential: &Credential,
        request: ChatRequest,
    ) -> Result<ChatResponse, TransportError> {
        if credential.is_blank() {
            return Err(TransportError::AuthenticationFailed);
        }
        let request = request.with_stream(false);
        let timeout = self.config.request_timeout();

        let response = self
            .post(credential, &request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;
        let response = check_status(response).await?;

        response
            .json::<ChatResponse>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                } else {
                    TransportError::parse(format!("Failed to parse response: {}", e))
                }
            })
    }
}

/// Runs one streaming call to completion, forwarding events to `tx`.
///
/// Stops quietly once the receiving side is gone.
async fn drive_stream(
    builder: reqwest::RequestBuilder,
    write_timeout: Duration,
    tx: mpsc::Sender<TransportEvent>,
) {
    let response = match tokio::time::timeout(write_timeout, builder.send()).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let _ = tx
                .send(TransportEvent::Failed(map_send_error(e, write_timeout)))
                .await;
            return;
        }
        Err(_) => {
            let _ = tx
                .send(TransportEvent::Failed(TransportError::Timeout {
                    timeout_secs: write_timeout.as_secs(),
                }))
                .await;
            return;
        }
    };

    let response = match check_status(response).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Streaming call rejected");
            let _ = tx.send(TransportEvent::Failed(e)).await;
            return;
        }
    };

    if tx.send(TransportEvent::Opened).await.is_err() {
        return;
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for payload in decoder.push(&bytes) {
                    if tx.send(TransportEvent::Data(payload)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Streaming body read failed");
                let _ = tx
                    .send(TransportEvent::Failed(TransportError::network(e.to_string())))
                    .await;
                return;
            }
        }
    }

    if let Some(payload) = decoder.finish() {
        if tx.send(TransportEvent::Data(payload)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(TransportEvent::Closed).await;
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            timeout_secs: timeout.as_secs(),
        }
    } else if e.is_connect() {
        TransportError::network(format!("Connection failed: {}", e))
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::network(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::from_status(status.as_u16(), body))
}
