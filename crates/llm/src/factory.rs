//! LLM provider factory.
//!
//! Resolves a provider name from configuration into a shared client.

use crate::client::LlmClient;
use crate::providers::{OllamaClient, ScriptedClient};
use crate::types::ProviderType;
use sift_core::{AppError, AppResult};
use std::sync::Arc;

/// Default base URL for a local Ollama daemon.
pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";

/// Reply used by the offline scripted provider.
const SCRIPTED_REPLY: &str =
    "Offline mode: no model is configured, so this answer is a fixed placeholder. \
     Configure the `ollama` provider to get generated answers.";

/// Create an LLM client based on the provider name.
///
/// # Arguments
/// * `provider` - Provider identifier ("ollama", "scripted")
/// * `endpoint` - Optional custom endpoint URL (ignored by `scripted`)
///
/// # Errors
/// Returns `AppError::Config` if the provider is unknown.
pub fn create_client(provider: &str, endpoint: Option<&str>) -> AppResult<Arc<dyn LlmClient>> {
    let provider_type = ProviderType::parse(provider)
        .ok_or_else(|| AppError::Config(format!("Unknown provider: {}", provider)))?;

    tracing::debug!(provider = provider_type.as_str(), "creating LLM client");

    match provider_type {
        ProviderType::Ollama => {
            let base_url = endpoint.unwrap_or(DEFAULT_OLLAMA_ENDPOINT);
            Ok(Arc::new(OllamaClient::with_base_url(base_url)))
        }
        // The analysis prompt asks for JSON; an empty object makes the
        // extractor fall back to pattern matching.
        ProviderType::Scripted => Ok(Arc::new(
            ScriptedClient::new(SCRIPTED_REPLY).with_rule("single JSON object", "{}"),
        )),
    }
}
