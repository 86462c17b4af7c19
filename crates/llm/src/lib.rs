//! LLM ports consumed by the MetaMCP core: a JSON-mode chat completions
//! client, an embedding provider, and a cached token counter.

#![deny(missing_docs)]

mod chat;
mod embeddings;
mod error;
mod token_counter;

pub use chat::{ChatClient, ChatClientConfig, ChatJson, ChatJsonRequest};
pub use embeddings::{Embeddings, HttpEmbeddings, HttpEmbeddingsConfig, normalize};
pub use error::LlmError;
pub use token_counter::TokenCounter;

/// Convenience result type for this crate.
pub type Result<T> = std::result::Result<T, LlmError>;
