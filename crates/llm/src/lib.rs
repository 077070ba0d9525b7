//! # Lore LLM
//!
//! Chat-completion transport for the analysis engine.
//!
//! - [`CompletionClient`]: the one seam the engine calls through
//! - [`HttpCompletionClient`]: OpenAI-compatible or Ollama servers over HTTP
//! - [`ScriptedClient`]: deterministic in-process replies (tests, `LORE_LLM_MODE=stub`)
//! - [`decode_lenient`]: recovers a JSON object from prose-wrapped replies

mod client;
mod error;
mod http;
mod json;
mod mode;
mod scripted;
mod types;

pub use client::CompletionClient;
pub use error::{LlmError, Result};
pub use http::{
    parse_ollama_completion, parse_openai_completion, Backend, HttpClientConfig,
    HttpCompletionClient,
};
pub use json::{decode_lenient, extract_json_object};
pub use mode::{LlmMode, LLM_MODE_ENV};
pub use scripted::{Responder, ScriptedClient};
pub use types::{ChatMessage, CompletionRequest, Role, DEFAULT_REQUEST_TIMEOUT};
