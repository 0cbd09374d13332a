//! BYO-key LLM client used to generate chat replies.
//!
//! Pure HTTP client. OpenAI-compatible vendors are reached through
//! `LlmClient::with_base_url`.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
