//! Phase 4: streaming generation.
//!
//! Tokens are produced by a spawned task and relayed through a bounded
//! channel, so a slow consumer stalls the producer instead of losing tokens.
//! Every strategy writes into the same channel; the consumer never needs to
//! know which one ran.

use crate::assembler::render_context;
use crate::cache::{normalize_query, PhaseCache};
use crate::types::{Analysis, AssembledContext, GeneratedText, PipelineRequest};
use futures::StreamExt;
use sift_core::{AppError, AppResult};
use sift_llm::{LlmCapabilities, LlmClient, LlmRequest};
use sift_prompt::{build_prompt, PromptDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Item delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationToken {
    Text(String),
    /// Generation stopped early; `End` follows
    Error(String),
    /// Always the last item
    End,
}

/// Generation settings.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub model: String,
    pub chunk_chars: usize,
    pub replay_delay: Duration,
    pub model_timeout: Duration,
    pub channel_capacity: usize,
    pub key_items: usize,
    pub max_tokens: Option<u32>,
}

/// Receiving end of a generation.
///
/// Dropping it aborts the producer task.
pub struct TokenStream {
    rx: mpsc::Receiver<GenerationToken>,
    handle: Option<JoinHandle<GeneratedText>>,
}

impl TokenStream {
    pub async fn recv(&mut self) -> Option<GenerationToken> {
        self.rx.recv().await
    }

    /// Wait for the producer and return what it generated.
    pub async fn finish(mut self) -> GeneratedText {
        self.rx.close();
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return GeneratedText::default(),
        };
        match handle.await {
            Ok(generated) => generated,
            Err(e) => GeneratedText {
                degraded: Some(format!("generation task failed: {}", e)),
                ..Default::default()
            },
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Producer-side handle: forwards tokens and records them.
struct TokenSink {
    tx: mpsc::Sender<GenerationToken>,
    generated: GeneratedText,
}

impl TokenSink {
    async fn push(&mut self, text: &str) -> AppResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.tx
            .send(GenerationToken::Text(text.to_string()))
            .await
            .map_err(|_| AppError::Cancelled)?;
        self.generated.push(text);
        Ok(())
    }

    async fn push_chunked(&mut self, text: &str, chunk_chars: usize, delay: Duration) -> AppResult<()> {
        for chunk in chunk_text(text, chunk_chars) {
            self.push(&chunk).await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn close(self, error: Option<String>) -> GeneratedText {
        let mut generated = self.generated;
        if let Some(message) = error {
            let _ = self.tx.send(GenerationToken::Error(message.clone())).await;
            generated.degraded = Some(message);
        } else if generated.text.is_empty() {
            generated.degraded = Some("model returned no text".to_string());
        }
        let _ = self.tx.send(GenerationToken::End).await;
        generated
    }
}

/// Split `text` into pieces of at most `chunk_chars` characters.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// One way of getting tokens out of the model client.
#[async_trait::async_trait]
trait GenerationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported(&self, caps: LlmCapabilities) -> bool;

    async fn run(
        &self,
        client: Arc<dyn LlmClient>,
        request: LlmRequest,
        settings: &GeneratorSettings,
        sink: &mut TokenSink,
    ) -> AppResult<()>;
}

/// Incremental tokens straight from the client.
struct NativeStream;

#[async_trait::async_trait]
impl GenerationStrategy for NativeStream {
    fn name(&self) -> &'static str {
        "native_stream"
    }

    fn supported(&self, caps: LlmCapabilities) -> bool {
        caps.streaming
    }

    async fn run(
        &self,
        client: Arc<dyn LlmClient>,
        request: LlmRequest,
        settings: &GeneratorSettings,
        sink: &mut TokenSink,
    ) -> AppResult<()> {
        let limit = settings.model_timeout;
        let mut stream = tokio::time::timeout(limit, client.stream(&request))
            .await
            .map_err(|_| AppError::Timeout("model stream did not start".to_string()))??;

        loop {
            let next = tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| AppError::Timeout("model stream stalled".to_string()))?;
            match next {
                Some(Ok(chunk)) => {
                    sink.push(&chunk.content).await?;
                    if chunk.done {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

/// One async completion, re-chunked into pseudo-tokens.
struct ChunkedCompletion;

#[async_trait::async_trait]
impl GenerationStrategy for ChunkedCompletion {
    fn name(&self) -> &'static str {
        "chunked_completion"
    }

    fn supported(&self, caps: LlmCapabilities) -> bool {
        caps.completion
    }

    async fn run(
        &self,
        client: Arc<dyn LlmClient>,
        request: LlmRequest,
        settings: &GeneratorSettings,
        sink: &mut TokenSink,
    ) -> AppResult<()> {
        let response = tokio::time::timeout(settings.model_timeout, client.complete(&request))
            .await
            .map_err(|_| AppError::Timeout("model completion".to_string()))??;
        sink.push_chunked(&response.content, settings.chunk_chars, settings.replay_delay)
            .await
    }
}

/// A blocking call on the blocking pool, relayed through a queue.
struct BlockingRelay;

#[async_trait::async_trait]
impl GenerationStrategy for BlockingRelay {
    fn name(&self) -> &'static str {
        "blocking_relay"
    }

    fn supported(&self, caps: LlmCapabilities) -> bool {
        caps.blocking
    }

    async fn run(
        &self,
        client: Arc<dyn LlmClient>,
        request: LlmRequest,
        settings: &GeneratorSettings,
        sink: &mut TokenSink,
    ) -> AppResult<()> {
        let (relay_tx, mut relay_rx) = mpsc::channel::<AppResult<String>>(settings.channel_capacity);
        let chunk_chars = settings.chunk_chars;

        // The thread cannot be interrupted; on timeout it finishes on its own
        // and its sends fail harmlessly.
        tokio::task::spawn_blocking(move || match client.complete_blocking(&request) {
            Ok(response) => {
                for chunk in chunk_text(&response.content, chunk_chars) {
                    if relay_tx.blocking_send(Ok(chunk)).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                let _ = relay_tx.blocking_send(Err(e));
            }
        });

        loop {
            let next = tokio::time::timeout(settings.model_timeout, relay_rx.recv())
                .await
                .map_err(|_| AppError::Timeout("blocking model call".to_string()))?;
            match next {
                Some(Ok(chunk)) => sink.push(&chunk).await?,
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

/// Phase 4 entry point.
pub struct StreamingGenerator {
    client: Arc<dyn LlmClient>,
    prompt: PromptDefinition,
    cache: PhaseCache,
    settings: GeneratorSettings,
    strategies: Arc<Vec<Box<dyn GenerationStrategy>>>,
}

impl StreamingGenerator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        prompt: PromptDefinition,
        cache: PhaseCache,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            client,
            prompt,
            cache,
            settings,
            strategies: Arc::new(vec![
                Box::new(NativeStream),
                Box::new(ChunkedCompletion),
                Box::new(BlockingRelay),
            ]),
        }
    }

    /// Names of the strategies the client supports, in the order tried.
    pub fn supported_strategies(&self) -> Vec<&'static str> {
        let caps = self.client.capabilities();
        self.strategies
            .iter()
            .filter(|s| s.supported(caps))
            .map(|s| s.name())
            .collect()
    }

    /// Cache key: the query plus the identities of the top context items.
    pub fn cache_key(&self, request: &PipelineRequest, context: &AssembledContext) -> String {
        let ids = context
            .items
            .iter()
            .take(self.settings.key_items)
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        self.cache
            .key(&[&normalize_query(&request.query), &request.language, &ids])
    }

    /// Start generating. Must be called inside a Tokio runtime.
    pub fn generate(
        &self,
        request: &PipelineRequest,
        analysis: &Analysis,
        context: &AssembledContext,
    ) -> TokenStream {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let sink = TokenSink {
            tx,
            generated: GeneratedText::default(),
        };

        let key = self.cache_key(request, context);
        let llm_request = self.build_request(request, analysis, context);
        let job = Job {
            client: self.client.clone(),
            cache: self.cache.clone(),
            settings: self.settings.clone(),
            strategies: self.strategies.clone(),
            use_cache: request.options.use_cache,
            key,
        };

        let handle = tokio::spawn(job.produce(llm_request, sink));
        TokenStream {
            rx,
            handle: Some(handle),
        }
    }

    fn build_request(
        &self,
        request: &PipelineRequest,
        analysis: &Analysis,
        context: &AssembledContext,
    ) -> AppResult<LlmRequest> {
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), request.query.clone());
        vars.insert("language".to_string(), request.language.clone());
        vars.insert("intent".to_string(), analysis.intent.as_str().to_string());
        vars.insert("focus".to_string(), analysis.focus.clone());
        vars.insert("entities".to_string(), analysis.entities.join(", "));
        vars.insert("context".to_string(), render_context(&context.items));

        let built = build_prompt(&self.prompt, vars)?;
        let mut llm_request =
            LlmRequest::new(built.user, self.settings.model.clone()).with_streaming();
        if let Some(system) = built.system {
            llm_request = llm_request.with_system(system);
        }
        if let Some(max_tokens) = self.settings.max_tokens {
            llm_request = llm_request.with_max_tokens(max_tokens);
        }
        Ok(llm_request)
    }
}

/// Everything the producer task owns.
struct Job {
    client: Arc<dyn LlmClient>,
    cache: PhaseCache,
    settings: GeneratorSettings,
    strategies: Arc<Vec<Box<dyn GenerationStrategy>>>,
    use_cache: bool,
    key: String,
}

impl Job {
    async fn produce(self, request: AppResult<LlmRequest>, mut sink: TokenSink) -> GeneratedText {
        if self.use_cache {
            if let Some(text) = self.cache.get::<String>(&self.key).await {
                sink.generated.strategy = "cached_replay".to_string();
                sink.generated.from_cache = true;
                let replayed = sink
                    .push_chunked(&text, self.settings.chunk_chars, self.settings.replay_delay)
                    .await;
                let error = replayed.err().map(|e| e.to_string());
                return sink.close(error).await;
            }
        }

        let request = match request {
            Ok(request) => request,
            Err(e) => return sink.close(Some(format!("prompt unavailable: {}", e))).await,
        };

        let caps = self.client.capabilities();
        let mut last_error: Option<String> = None;
        let mut succeeded = false;

        for strategy in self.strategies.iter().filter(|s| s.supported(caps)) {
            sink.generated.strategy = strategy.name().to_string();
            tracing::debug!(strategy = strategy.name(), "generation strategy selected");

            match strategy
                .run(self.client.clone(), request.clone(), &self.settings, &mut sink)
                .await
            {
                Ok(()) => {
                    succeeded = true;
                    last_error = None;
                    break;
                }
                Err(AppError::Cancelled) => {
                    tracing::info!("consumer went away, stopping generation");
                    return sink.generated;
                }
                Err(e) if sink.generated.tokens.is_empty() => {
                    tracing::warn!(strategy = strategy.name(), "strategy failed before output: {}", e);
                    last_error = Some(format!("{} failed: {}", strategy.name(), e));
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), "generation interrupted: {}", e);
                    last_error = Some(format!("generation interrupted: {}", e));
                    break;
                }
            }
        }

        if !succeeded && last_error.is_none() {
            last_error = Some(format!(
                "{} supports no generation call",
                self.client.provider_name()
            ));
        }

        let text = sink.generated.text.clone();
        let generated = sink.close(last_error).await;

        if succeeded && self.use_cache && !text.is_empty() {
            self.cache.put(self.key.clone(), &text).await;
        }
        generated
    }
}
