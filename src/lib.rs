//! chat-stream - streaming conversation engine
//!
//! Persists conversations locally and streams assistant replies from an
//! OpenAI-compatible chat-completions API over Server-Sent Events. Streamed
//! tokens are committed to the store as they arrive; the presentation layer
//! renders from the store's per-chat feeds.
//!
//! # Layout
//!
//! - `domain` - chats, messages, exchange lifecycle, stream frames
//! - `ports` - `ConversationStore` and `ModelTransport`
//! - `adapters` - in-memory and SQLite stores, HTTP and scripted transports
//! - `application` - reconciler, controller and chat library
//! - `config` / `telemetry` - environment configuration and tracing setup

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;
pub mod telemetry;
