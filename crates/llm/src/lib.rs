//! LLM integration crate for sift.
//!
//! This crate provides a provider-agnostic abstraction for interacting with
//! Large Language Models. Providers advertise which call shapes they support
//! (incremental stream, async completion, synchronous completion) so callers
//! can pick a strategy by probing instead of by trial and error.
//!
//! # Providers
//! - **Ollama**: Local LLM runtime (default)
//! - **Scripted**: Deterministic replies for offline runs and tests
//!
//! # Example
//! ```no_run
//! use sift_llm::{LlmClient, LlmRequest, providers::OllamaClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OllamaClient::new();
//! let request = LlmRequest::new("Hello, world!", "llama3");
//! let response = client.complete(&request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod factory;
pub mod providers;
pub mod types;

// Re-export main types
pub use client::{
    LlmCapabilities, LlmClient, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk, LlmUsage,
};
pub use factory::create_client;
pub use providers::{OllamaClient, ScriptedClient};
pub use types::ProviderType;
