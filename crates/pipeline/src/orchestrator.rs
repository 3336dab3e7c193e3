//! The pipeline: phases 1-5 driven in order for one request.
//!
//! Faults in phases 1-3 end the stream with an `error` event. Phase 4 and 5
//! faults degrade the answer instead, and surface as quality warnings.

use crate::adapters::{SemanticSearch, StructuredQuery};
use crate::analyzer::{AnalysisStrategy, LlmExtractor, PatternMatcher, QueryAnalyzer};
use crate::assembler::{estimator_for, ContextAssembler, TokenEstimator};
use crate::cache::{CacheStore, PhaseCache, TtlCache};
use crate::emitter::EventEmitter;
use crate::generator::{GenerationToken, GeneratorSettings, StreamingGenerator};
use crate::postprocess::{MarkdownPostProcessor, PostProcessor};
use crate::protocol::PipelineEvent;
use crate::retriever::ParallelRetriever;
use crate::state::{PipelineState, PipelineStatus};
use crate::types::{PipelineRequest, ResponsePackage};
use futures::FutureExt;
use serde_json::json;
use sift_core::{AppError, AppResult, PipelineConfig};
use sift_llm::LlmClient;
use sift_prompt::{builtin_prompt, load_prompt, PromptDefinition, ANALYSIS_PROMPT_ID, GENERATION_PROMPT_ID};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// `complete` was emitted
    Completed(ResponsePackage),
    /// `error` was emitted
    Failed { phase: Option<u8>, message: String },
    /// The consumer went away; nothing more was emitted
    Cancelled,
}

/// Builder for [`Pipeline`]. Everything is wired once, up front.
pub struct PipelineBuilder {
    semantic: Option<Arc<dyn SemanticSearch>>,
    structured: Option<Arc<dyn StructuredQuery>>,
    client: Option<Arc<dyn LlmClient>>,
    model: String,
    cache: Option<Arc<dyn CacheStore>>,
    config: PipelineConfig,
    workspace: Option<PathBuf>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    postprocessor: Option<Arc<dyn PostProcessor>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            semantic: None,
            structured: None,
            client: None,
            model: "llama3.2".to_string(),
            cache: None,
            config: PipelineConfig::default(),
            workspace: None,
            estimator: None,
            postprocessor: None,
        }
    }
}

impl PipelineBuilder {
    pub fn semantic(mut self, source: Arc<dyn SemanticSearch>) -> Self {
        self.semantic = Some(source);
        self
    }

    pub fn structured(mut self, source: Arc<dyn StructuredQuery>) -> Self {
        self.structured = Some(source);
        self
    }

    pub fn client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Share a cache between pipelines. Defaults to a private [`TtlCache`].
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Look for prompt overrides under `<workspace>/.sift/prompts`.
    pub fn workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn postprocessor(mut self, postprocessor: Arc<dyn PostProcessor>) -> Self {
        self.postprocessor = Some(postprocessor);
        self
    }

    pub fn build(self) -> AppResult<Pipeline> {
        self.config.validate()?;
        let config = self.config;

        let semantic = self
            .semantic
            .ok_or_else(|| AppError::Config("pipeline needs a semantic source".to_string()))?;
        let structured = self
            .structured
            .ok_or_else(|| AppError::Config("pipeline needs a structured source".to_string()))?;
        let client = self
            .client
            .ok_or_else(|| AppError::Config("pipeline needs a model client".to_string()))?;
        if !client.capabilities().any() {
            return Err(AppError::Config(format!(
                "{} supports none of stream, complete or complete_blocking",
                client.provider_name()
            )));
        }

        let analysis_prompt = resolve_prompt(self.workspace.as_deref(), ANALYSIS_PROMPT_ID)?;
        let generation_prompt = resolve_prompt(self.workspace.as_deref(), GENERATION_PROMPT_ID)?;

        let store: Arc<dyn CacheStore> = self.cache.unwrap_or_else(|| Arc::new(TtlCache::new()));
        let estimator = self
            .estimator
            .unwrap_or_else(|| estimator_for(&config.tokenizer));

        let strategies: Vec<Box<dyn AnalysisStrategy>> = vec![
            Box::new(PatternMatcher),
            Box::new(LlmExtractor::new(
                client.clone(),
                self.model.clone(),
                analysis_prompt,
                config.model_timeout(),
            )),
        ];
        let analyzer = QueryAnalyzer::new(
            strategies,
            PhaseCache::new(store.clone(), "analysis", config.analysis_ttl()),
        );

        let retriever = ParallelRetriever::new(
            semantic,
            structured.clone(),
            PhaseCache::new(store.clone(), "retrieval", config.retrieval_ttl()),
            config.adapter_timeout(),
        );

        let assembler =
            ContextAssembler::new(estimator, config.max_context_items, config.snippet_chars);

        let generator = StreamingGenerator::new(
            client,
            generation_prompt,
            PhaseCache::new(store, "generation", config.generation_ttl()),
            GeneratorSettings {
                model: self.model,
                chunk_chars: config.chunk_chars,
                replay_delay: config.replay_delay(),
                model_timeout: config.model_timeout(),
                channel_capacity: config.channel_capacity,
                key_items: config.generation_key_items,
                max_tokens: config.max_answer_tokens,
            },
        );

        tracing::debug!(
            analysis = ?analyzer.strategy_names(),
            generation = ?generator.supported_strategies(),
            tokenizer = assembler.estimator_name(),
            "pipeline built"
        );

        Ok(Pipeline {
            analyzer,
            retriever,
            assembler,
            generator,
            postprocessor: self
                .postprocessor
                .unwrap_or_else(|| Arc::new(MarkdownPostProcessor)),
            structured,
            config,
        })
    }
}

fn resolve_prompt(workspace: Option<&Path>, id: &str) -> AppResult<PromptDefinition> {
    match workspace {
        Some(workspace) => {
            let (definition, source) = load_prompt(workspace, id)?;
            tracing::debug!(prompt = id, ?source, "prompt resolved");
            Ok(definition)
        }
        None => builtin_prompt(id)
            .ok_or_else(|| AppError::Prompt(format!("No built-in prompt named {}", id))),
    }
}

/// The five-phase pipeline. Cheap to share behind an `Arc`; per-request
/// state lives in [`PipelineState`].
pub struct Pipeline {
    analyzer: QueryAnalyzer,
    retriever: ParallelRetriever,
    assembler: ContextAssembler,
    generator: StreamingGenerator,
    postprocessor: Arc<dyn PostProcessor>,
    structured: Arc<dyn StructuredQuery>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `request` on its own task and return the event stream.
    pub fn spawn(
        self: Arc<Self>,
        request: PipelineRequest,
    ) -> (mpsc::Receiver<PipelineEvent>, JoinHandle<PipelineOutcome>) {
        let (emitter, rx) = EventEmitter::channel(self.config.channel_capacity);
        let handle = tokio::spawn(async move { self.run(request, &emitter).await });
        (rx, handle)
    }

    /// Run `request`, emitting events through `emitter`.
    ///
    /// Ends with exactly one `complete` or `error` event unless the consumer
    /// disconnects first.
    pub async fn run(&self, request: PipelineRequest, emitter: &EventEmitter) -> PipelineOutcome {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "pipeline",
            request_id = %request_id,
            session_id = %request.session_id
        );

        async move {
            let mut state = PipelineState::new(request_id);
            match self.drive(&request, &mut state, emitter).await {
                Ok(package) => {
                    tracing::info!(score = package.quality.score, "pipeline complete");
                    PipelineOutcome::Completed(package)
                }
                Err(AppError::Cancelled) => {
                    state.fail();
                    tracing::info!("consumer disconnected, request abandoned");
                    PipelineOutcome::Cancelled
                }
                Err(e) => {
                    let phase = state.current_phase();
                    let timings = state.fail();
                    let message = failure_message(phase, &e);
                    tracing::warn!(?phase, "pipeline failed: {}", message);
                    match emitter.error(message.clone(), phase, timings).await {
                        Ok(()) => PipelineOutcome::Failed { phase, message },
                        Err(_) => PipelineOutcome::Cancelled,
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &PipelineRequest,
        state: &mut PipelineState,
        emitter: &EventEmitter,
    ) -> AppResult<ResponsePackage> {
        if request.query.trim().is_empty() {
            return Err(AppError::Other("query must not be empty".to_string()));
        }
        let use_cache = request.options.use_cache;

        // Phase 1
        state.enter(PipelineStatus::Analyzing)?;
        emitter.progress(1, "Analyzing query", 5).await?;
        let vocabulary = self.vocabulary(&request.document_ids).await;
        let analysis = AssertUnwindSafe(self.analyzer.analyze(
            &request.query,
            &request.document_ids,
            &vocabulary,
            use_cache,
        ))
        .catch_unwind()
        .await
        .map_err(|_| AppError::Analysis("analyzer panicked".to_string()))?;
        tracing::info!(
            intent = analysis.intent.as_str(),
            entities = analysis.entities.len(),
            strategy = %analysis.strategy,
            "phase 1 done"
        );
        emitter.phase_result(1, &analysis, 20).await?;

        // Phase 2
        state.enter(PipelineStatus::Retrieving)?;
        emitter.progress(2, "Retrieving evidence", 25).await?;
        let bundle = AssertUnwindSafe(self.retriever.retrieve(
            &request.query,
            &analysis.entities,
            request.top_k,
            &request.document_ids,
            use_cache,
        ))
        .catch_unwind()
        .await
        .map_err(|_| AppError::Retrieval("retriever panicked".to_string()))??;

        if !bundle.source_counts.any() {
            return Err(AppError::Retrieval("no data".to_string()));
        }
        if bundle.merged.is_empty() {
            tracing::warn!("sources returned data but nothing survived the merge");
        }
        state.warnings.extend(bundle.warnings.iter().cloned());
        emitter
            .phase_result(
                2,
                &json!({
                    "source_counts": bundle.source_counts,
                    "merged": bundle.merged.len(),
                    "warnings": bundle.warnings,
                    "from_cache": bundle.from_cache,
                }),
                40,
            )
            .await?;

        // Phase 3
        state.enter(PipelineStatus::Assembling)?;
        emitter.progress(3, "Assembling context", 45).await?;
        let budget = request
            .options
            .token_budget
            .unwrap_or(self.config.token_budget);
        let context = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.assembler.assemble(&bundle, &analysis, budget)
        }))
        .map_err(|_| AppError::Assembly("assembler panicked".to_string()))?;
        if context.estimated_tokens > context.token_budget {
            return Err(AppError::Assembly(format!(
                "context of {} tokens exceeds budget {}",
                context.estimated_tokens, context.token_budget
            )));
        }
        tracing::info!(
            items = context.kept_count(),
            tokens = context.estimated_tokens,
            truncated = context.truncated,
            "phase 3 done"
        );
        emitter
            .phase_result(
                3,
                &json!({
                    "items": context.kept_count(),
                    "original_count": context.original_count,
                    "estimated_tokens": context.estimated_tokens,
                    "token_budget": context.token_budget,
                    "truncated": context.truncated,
                }),
                55,
            )
            .await?;

        // Phase 4
        state.enter(PipelineStatus::Generating)?;
        emitter.progress(4, "Generating answer", 60).await?;
        let mut stream = self.generator.generate(request, &analysis, &context);
        while let Some(token) = stream.recv().await {
            match token {
                GenerationToken::Text(text) => emitter.token(text).await?,
                GenerationToken::Error(message) => {
                    tracing::warn!("generation degraded: {}", message);
                }
                GenerationToken::End => break,
            }
        }
        let generated = stream.finish().await;
        emitter
            .phase_result(
                4,
                &json!({
                    "strategy": generated.strategy,
                    "tokens": generated.tokens.len(),
                    "from_cache": generated.from_cache,
                    "degraded": generated.degraded,
                }),
                90,
            )
            .await?;

        // Phase 5
        state.enter(PipelineStatus::Postprocessing)?;
        emitter.progress(5, "Finalizing response", 95).await?;
        let mut package = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.postprocessor.process(
                &generated,
                &context,
                &analysis,
                &request.query,
                &state.warnings,
            )
        }))
        .unwrap_or_else(|_| {
            tracing::warn!("post-processing panicked, returning raw text");
            ResponsePackage::degraded(
                generated.text.clone(),
                "post-processing failed; response returned unprocessed",
            )
        });

        state.finish()?;
        package
            .metadata
            .insert("phase_timings".to_string(), json!(state.timings()));
        package
            .metadata
            .insert("request_id".to_string(), json!(state.request_id));
        package
            .metadata
            .insert("session_id".to_string(), json!(request.session_id));
        package
            .metadata
            .insert("source_counts".to_string(), json!(bundle.source_counts));

        emitter.complete(package.clone()).await?;
        Ok(package)
    }

    /// Entity names known to the structured source. Failure only costs
    /// phase 1 its vocabulary.
    async fn vocabulary(&self, document_ids: &BTreeSet<String>) -> Vec<String> {
        let call = self.structured.vocabulary(document_ids);
        match tokio::time::timeout(self.config.adapter_timeout(), call).await {
            Ok(Ok(vocabulary)) => vocabulary,
            Ok(Err(e)) => {
                tracing::warn!("vocabulary lookup failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("vocabulary lookup timed out");
                Vec::new()
            }
        }
    }
}

fn failure_message(phase: Option<u8>, error: &AppError) -> String {
    let detail = match error {
        AppError::Analysis(m) | AppError::Retrieval(m) | AppError::Assembly(m) => m.clone(),
        AppError::Other(m) => m.clone(),
        other => other.to_string(),
    };
    match phase {
        Some(phase) => format!("phase{} failed: {}", phase, detail),
        None => detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_message() {
        assert_eq!(
            failure_message(Some(2), &AppError::Retrieval("no data".to_string())),
            "phase2 failed: no data"
        );
        assert_eq!(
            failure_message(None, &AppError::Other("query must not be empty".to_string())),
            "query must not be empty"
        );
        assert_eq!(
            failure_message(Some(1), &AppError::Timeout("x".to_string())),
            "phase1 failed: Timed out: x"
        );
    }

    #[test]
    fn test_builder_requires_sources() {
        let result = Pipeline::builder().build();
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
