//! Records passed between pipeline phases.
//!
//! Every phase boundary takes and returns one of these typed records; the
//! orchestrator serializes them into `phase_result` events unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Field names that identify the same logical item across sources, in
/// priority order.
pub const BUSINESS_KEY_FIELDS: &[&str] = &["business_key", "sku", "model", "name", "title"];

/// A question accepted by the pipeline. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub query: String,
    pub session_id: String,
    /// Restricts evidence to these documents; empty means no restriction
    #[serde(default)]
    pub document_ids: BTreeSet<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub options: RequestOptions,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_top_k() -> usize {
    10
}

impl PipelineRequest {
    /// Create a request with a fresh session id and default options.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            document_ids: BTreeSet::new(),
            language: default_language(),
            top_k: default_top_k(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_ids.insert(document_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.options.token_budget = Some(token_budget);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.options.use_cache = false;
        self
    }
}

/// Per-request overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Overrides `PipelineConfig::token_budget`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<usize>,

    /// Read and write the phase caches
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            token_budget: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Compare,
    Recommend,
    SpecQuery,
    General,
}

impl Intent {
    /// Lenient parse used on model output; unknown values become `General`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "compare" | "comparison" => Self::Compare,
            "recommend" | "recommendation" => Self::Recommend,
            "spec_query" | "spec" | "specs" | "specification" => Self::SpecQuery,
            _ => Self::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compare => "compare",
            Self::Recommend => "recommend",
            Self::SpecQuery => "spec_query",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" | "low" => Some(Self::Simple),
            "medium" | "moderate" => Some(Self::Medium),
            "complex" | "high" => Some(Self::Complex),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Phase 1 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Intent,
    /// Ordered by first mention, no duplicates
    pub entities: Vec<String>,
    pub key_features: BTreeSet<String>,
    pub focus: String,
    pub complexity: Complexity,
    pub confidence: Confidence,
    #[serde(default)]
    pub from_cache: bool,
    /// Name of the strategy that produced this analysis
    #[serde(default)]
    pub strategy: String,
}

impl Analysis {
    /// Conservative analysis used when no strategy produced a result.
    pub fn fallback(query: &str) -> Self {
        Self {
            intent: Intent::General,
            entities: Vec::new(),
            key_features: BTreeSet::new(),
            focus: query.trim().to_string(),
            complexity: Complexity::Simple,
            confidence: Confidence::Low,
            from_cache: false,
            strategy: "fallback".to_string(),
        }
    }
}

/// A hit from the semantic source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A record from the structured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Semantic,
    Structured,
    Both,
}

/// Evidence record after cross-source fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub business_key: String,
    pub rank_score: f32,
    pub fields: BTreeMap<String, String>,
    pub snippet: String,
    pub origin: Origin,
    #[serde(default)]
    pub semantic_score: f32,
    #[serde(default)]
    pub entity_match: bool,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Human-readable label: the first business-key field present, else the id.
    pub fn title(&self) -> String {
        BUSINESS_KEY_FIELDS
            .iter()
            .rev()
            .filter_map(|f| self.fields.get(*f))
            .find(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub semantic: usize,
    pub structured: usize,
}

impl SourceCounts {
    pub fn any(&self) -> bool {
        self.semantic > 0 || self.structured > 0
    }
}

/// Phase 2 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalBundle {
    pub semantic_matches: Vec<Match>,
    pub structured_rows: Vec<Row>,
    pub merged: Vec<Candidate>,
    pub source_counts: SourceCounts,
    /// Recoverable problems (one source failed, scope filtered everything)
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub from_cache: bool,
}

/// Phase 3 output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub items: Vec<Candidate>,
    pub estimated_tokens: usize,
    pub token_budget: usize,
    pub truncated: bool,
    pub original_count: usize,
}

impl AssembledContext {
    pub fn empty(token_budget: usize) -> Self {
        Self {
            items: Vec::new(),
            estimated_tokens: 0,
            token_budget,
            truncated: false,
            original_count: 0,
        }
    }

    pub fn kept_count(&self) -> usize {
        self.items.len()
    }
}

/// Phase 4 output. Append-only while the generator owns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub text: String,
    pub tokens: Vec<String>,
    pub strategy: String,
    pub from_cache: bool,
    /// Set when generation ended early or produced nothing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl GeneratedText {
    pub fn push(&mut self, token: &str) {
        self.text.push_str(token);
        self.tokens.push(token.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based position in the context
    pub index: usize,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub relevance: f32,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub score: f32,
    pub warnings: Vec<String>,
}

/// Phase 5 output, carried by the `complete` event. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePackage {
    #[serde(rename = "response")]
    pub text: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub citations: Vec<Citation>,
    pub quality: Quality,
}

/// Score given to a package whose post-processing failed.
pub const DEGRADED_QUALITY_SCORE: f32 = 0.1;

impl ResponsePackage {
    /// Raw generated text with a low score, used when post-processing fails.
    pub fn degraded(raw: impl Into<String>, warning: impl Into<String>) -> Self {
        Self {
            text: raw.into(),
            metadata: BTreeMap::new(),
            citations: Vec::new(),
            quality: Quality {
                score: DEGRADED_QUALITY_SCORE,
                warnings: vec![warning.into()],
            },
        }
    }
}
