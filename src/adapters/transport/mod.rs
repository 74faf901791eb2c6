//! Model transport adapters.

mod http_transport;
mod scripted;
mod sse;

pub use http_transport::HttpModelTransport;
pub use scripted::{delta_payload, ScriptStep, ScriptedTransport, StreamDriver};
pub use sse::SseDecoder;
