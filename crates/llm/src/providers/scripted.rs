//! Scripted LLM provider.
//!
//! Returns canned replies selected by substring rules over the prompt. It is
//! used for offline runs (`--provider scripted`) and as the model double in
//! pipeline tests, where the advertised capabilities, latency and failure
//! points need to be controlled precisely.

use crate::client::{
    LlmCapabilities, LlmClient, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk, LlmUsage,
};
use futures::StreamExt;
use sift_core::{AppError, AppResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic LLM client.
#[derive(Debug, Clone)]
pub struct ScriptedClient {
    default_reply: String,
    rules: Vec<(String, String)>,
    capabilities: LlmCapabilities,
    chunk_chars: usize,
    latency: Duration,
    failure: Option<String>,
    fail_stream_after: Option<usize>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedClient {
    /// Create a client that answers every prompt with `reply` and supports
    /// all call shapes.
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            default_reply: reply.into(),
            rules: Vec::new(),
            capabilities: LlmCapabilities::all(),
            chunk_chars: 8,
            latency: Duration::ZERO,
            failure: None,
            fail_stream_after: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer with `reply` when the prompt contains `needle`.
    /// Rules are checked in insertion order.
    pub fn with_rule(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push((needle.into(), reply.into()));
        self
    }

    pub fn with_capabilities(mut self, capabilities: LlmCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Size of each streamed chunk in characters.
    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    /// Delay applied before a reply (and before each streamed chunk).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every call fail with an LLM error.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Make streams fail after emitting `chunks` chunks.
    pub fn failing_stream_after(mut self, chunks: usize) -> Self {
        self.fail_stream_after = Some(chunks);
        self
    }

    /// Number of calls made against this client (shared across clones).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn reply_for(&self, prompt: &str) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.failure {
            return Err(AppError::Llm(message.clone()));
        }

        let reply = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone());

        Ok(reply)
    }

    fn response(&self, request: &LlmRequest, content: String) -> LlmResponse {
        let usage = LlmUsage::new(
            request.prompt.split_whitespace().count() as u32,
            content.split_whitespace().count() as u32,
        );
        LlmResponse {
            content,
            model: request.model.clone(),
            usage,
            done: true,
        }
    }

    fn split_chunks(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_chars)
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> LlmCapabilities {
        self.capabilities
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        if !self.capabilities.completion {
            return Err(AppError::Unsupported(
                "scripted client has completion disabled".to_string(),
            ));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let content = self.reply_for(&request.prompt)?;
        Ok(self.response(request, content))
    }

    async fn stream(&self, request: &LlmRequest) -> AppResult<LlmStream> {
        if !self.capabilities.streaming {
            return Err(AppError::Unsupported(
                "scripted client has streaming disabled".to_string(),
            ));
        }
        let content = self.reply_for(&request.prompt)?;
        let model = request.model.clone();
        let latency = self.latency;
        let fail_after = self.fail_stream_after;

        let mut items: Vec<AppResult<LlmStreamChunk>> = Vec::new();
        let mut interrupted = false;
        for (i, piece) in self.split_chunks(&content).into_iter().enumerate() {
            if fail_after == Some(i) {
                items.push(Err(AppError::Llm("stream interrupted".to_string())));
                interrupted = true;
                break;
            }
            items.push(Ok(LlmStreamChunk {
                content: piece,
                model: model.clone(),
                done: false,
                usage: None,
            }));
        }
        if !interrupted {
            items.push(Ok(LlmStreamChunk {
                content: String::new(),
                model,
                done: true,
                usage: Some(LlmUsage::default()),
            }));
        }

        let stream = futures::stream::iter(items).then(move |item| async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            item
        });

        Ok(Box::pin(stream))
    }

    fn complete_blocking(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        if !self.capabilities.blocking {
            return Err(AppError::Unsupported(
                "scripted client has blocking completion disabled".to_string(),
            ));
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let content = self.reply_for(&request.prompt)?;
        Ok(self.response(request, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_select_reply() {
        let client = ScriptedClient::new("default").with_rule("json", "{\"intent\":\"compare\"}");

        let a = client
            .complete(&LlmRequest::new("please answer in json", "m"))
            .await
            .unwrap();
        let b = client.complete(&LlmRequest::new("hello", "m")).await.unwrap();

        assert_eq!(a.content, "{\"intent\":\"compare\"}");
        assert_eq!(b.content, "default");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_concatenates_to_reply() {
        let client = ScriptedClient::new("The quick brown fox").with_chunk_chars(4);
        let mut stream = client.stream(&LlmRequest::new("q", "m")).await.unwrap();

        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.content);
            saw_done |= chunk.done;
        }

        assert_eq!(text, "The quick brown fox");
        assert!(saw_done);
    }

    #[tokio::test]
    async fn test_stream_failure_midway() {
        let client = ScriptedClient::new("abcdefgh")
            .with_chunk_chars(2)
            .failing_stream_after(2);
        let items: Vec<_> = client
            .stream(&LlmRequest::new("q", "m"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_disabled_capabilities() {
        let client = ScriptedClient::new("x").with_capabilities(LlmCapabilities {
            streaming: false,
            completion: true,
            blocking: false,
        });
        let request = LlmRequest::new("q", "m");

        assert!(client.stream(&request).await.err().unwrap().is_unsupported());
        assert!(client.complete_blocking(&request).unwrap_err().is_unsupported());
        assert!(client.complete(&request).await.is_ok());
    }

    #[test]
    fn test_failing_client() {
        let client = ScriptedClient::new("x").failing("model offline");
        let err = client
            .complete_blocking(&LlmRequest::new("q", "m"))
            .unwrap_err();
        assert!(err.to_string().contains("model offline"));
    }
}
