//! Pipeline-level tests and their fixtures.

mod scenarios;

use crate::adapters::{RowFilter, SemanticSearch, StructuredQuery};
use crate::cache::{CacheStore, TtlCache};
use crate::orchestrator::{Pipeline, PipelineOutcome};
use crate::protocol::PipelineEvent;
use crate::types::{Candidate, Match, Origin, PipelineRequest, Row};
use sift_core::{AppError, AppResult, PipelineConfig};
use sift_llm::LlmClient;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn product_row(id: &str, name: &str, price: &str) -> Row {
    Row {
        id: id.to_string(),
        document_id: Some("catalog".to_string()),
        fields: fields(&[("name", name), ("price", price), ("category", "laptop")]),
        updated_at: None,
    }
}

pub(crate) fn product_match(id: &str, name: &str, score: f32) -> Match {
    Match {
        id: id.to_string(),
        document_id: Some("catalog".to_string()),
        text: format!("{} is a laptop with a long and detailed description.", name),
        score,
        metadata: fields(&[("name", name)]),
        updated_at: None,
    }
}

pub(crate) fn candidate(id: &str, rank_score: f32, snippet: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        business_key: id.to_string(),
        rank_score,
        fields: fields(&[("name", id), ("price", "100")]),
        snippet: snippet.to_string(),
        origin: Origin::Semantic,
        semantic_score: rank_score,
        entity_match: false,
        document_id: None,
        updated_at: None,
    }
}

/// Semantic source returning a fixed list.
pub(crate) struct FakeSemantic {
    pub matches: Vec<Match>,
    pub fail: bool,
    pub panic: bool,
    pub calls: AtomicUsize,
}

impl FakeSemantic {
    pub fn new(matches: Vec<Match>) -> Self {
        Self {
            matches,
            fail: false,
            panic: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SemanticSearch for FakeSemantic {
    async fn search(&self, _query: &str, _top_k: usize) -> AppResult<Vec<Match>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("semantic adapter bug");
        }
        if self.fail {
            return Err(AppError::Storage("vector store unreachable".to_string()));
        }
        Ok(self.matches.clone())
    }
}

/// Structured source that matches rows by entity name.
pub(crate) struct FakeStructured {
    pub rows: Vec<Row>,
}

#[async_trait::async_trait]
impl StructuredQuery for FakeStructured {
    async fn query(&self, filter: &RowFilter) -> AppResult<Vec<Row>> {
        let entities: Vec<String> = filter.entities.iter().map(|e| e.to_lowercase()).collect();
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                let name = row.fields.get("name").map(|n| n.to_lowercase()).unwrap_or_default();
                entities.iter().any(|e| name.contains(e.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn vocabulary(&self, _document_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
        Ok(self
            .rows
            .iter()
            .filter_map(|row| row.fields.get("name").cloned())
            .collect())
    }
}

pub(crate) fn catalog() -> Vec<Row> {
    vec![
        product_row("r1", "Zephyr X1", "999"),
        product_row("r2", "Nimbus 7", "799"),
        product_row("r3", "Aurora Pro", "1499"),
    ]
}

pub(crate) fn test_config() -> PipelineConfig {
    PipelineConfig {
        tokenizer: "chars".to_string(),
        replay_delay_ms: 0,
        chunk_chars: 6,
        channel_capacity: 8,
        ..PipelineConfig::default()
    }
}

pub(crate) fn build_pipeline(
    semantic: Arc<FakeSemantic>,
    rows: Vec<Row>,
    client: Arc<dyn LlmClient>,
    cache: Arc<dyn CacheStore>,
) -> Arc<Pipeline> {
    Arc::new(
        Pipeline::builder()
            .semantic(semantic)
            .structured(Arc::new(FakeStructured { rows }))
            .client(client)
            .model("test-model")
            .cache(cache)
            .config(test_config())
            .build()
            .unwrap(),
    )
}

pub(crate) fn fresh_cache() -> Arc<dyn CacheStore> {
    Arc::new(TtlCache::new())
}

/// Run a request to the end and collect every event.
pub(crate) async fn run_collect(
    pipeline: Arc<Pipeline>,
    request: PipelineRequest,
) -> (Vec<PipelineEvent>, PipelineOutcome) {
    let (mut rx, handle) = pipeline.spawn(request);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (events, handle.await.unwrap())
}

pub(crate) fn token_text(events: &[PipelineEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Token { token, .. } => Some(token.as_str()),
            _ => None,
        })
        .collect()
}

/// Events are in phase order and exactly the last one is terminal.
pub(crate) fn assert_well_formed(events: &[PipelineEvent]) {
    assert!(!events.is_empty());
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "exactly one terminal event");
    assert!(events.last().unwrap().is_terminal());

    let mut last_phase = 0u8;
    for event in events {
        let phase = match event {
            PipelineEvent::Progress { phase, .. }
            | PipelineEvent::PhaseResult { phase, .. }
            | PipelineEvent::Token { phase, .. }
            | PipelineEvent::Complete { phase, .. } => Some(*phase),
            PipelineEvent::Error { phase, .. } => *phase,
        };
        if let Some(phase) = phase {
            assert!(phase >= last_phase, "phase went backwards: {:?}", event);
            last_phase = phase;
        }
    }
}
