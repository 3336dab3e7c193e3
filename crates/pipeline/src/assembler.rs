//! Phase 3: context ranking, projection and token budgeting.

use crate::types::{Analysis, AssembledContext, Candidate, RetrievalBundle};
use sift_core::{AppError, AppResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use unicode_segmentation::UnicodeSegmentation;

/// Composite score weights: entity > semantic > completeness > freshness.
pub const ENTITY_WEIGHT: f32 = 0.4;
pub const SEMANTIC_WEIGHT: f32 = 0.3;
pub const COMPLETENESS_WEIGHT: f32 = 0.2;
pub const FRESHNESS_WEIGHT: f32 = 0.1;

/// Fields always kept when projecting a candidate.
pub const REQUIRED_FIELDS: &[&str] = &["name", "title", "model", "brand", "category", "price"];

/// Counts tokens in prompt text.
pub trait TokenEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, text: &str) -> usize;
}

/// Exact count with the cl100k BPE.
pub struct TiktokenEstimator {
    bpe: CoreBPE,
}

impl TiktokenEstimator {
    pub fn new() -> AppResult<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| AppError::Config(format!("cl100k tokenizer unavailable: {}", e)))?;
        Ok(Self { bpe })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn name(&self) -> &'static str {
        "cl100k"
    }

    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Approximation: one token per three characters, rounded up.
#[derive(Debug, Default)]
pub struct CharRatioEstimator;

impl TokenEstimator for CharRatioEstimator {
    fn name(&self) -> &'static str {
        "chars"
    }

    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(3)
    }
}

/// Pick the configured estimator, falling back to the character ratio.
pub fn estimator_for(name: &str) -> Arc<dyn TokenEstimator> {
    if name == "cl100k" {
        match TiktokenEstimator::new() {
            Ok(estimator) => return Arc::new(estimator),
            Err(e) => tracing::warn!("{}; estimating tokens from characters", e),
        }
    }
    Arc::new(CharRatioEstimator)
}

/// Render one context item as it appears in the generation prompt.
///
/// A candidate with no fields and no snippet renders as the empty string.
pub fn render_item(position: usize, candidate: &Candidate) -> String {
    if candidate.fields.is_empty() && candidate.snippet.is_empty() {
        return String::new();
    }
    let fields = candidate
        .fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("; ");

    let mut out = format!("[{}] {}", position, fields);
    if !candidate.snippet.is_empty() {
        out.push('\n');
        out.push_str(&candidate.snippet);
    }
    out.push('\n');
    out
}

/// Render all items, numbered from 1.
pub fn render_context(items: &[Candidate]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, c)| render_item(i + 1, c))
        .collect()
}

/// Phase 3 entry point.
pub struct ContextAssembler {
    estimator: Arc<dyn TokenEstimator>,
    max_items: usize,
    snippet_chars: usize,
}

impl ContextAssembler {
    pub fn new(estimator: Arc<dyn TokenEstimator>, max_items: usize, snippet_chars: usize) -> Self {
        Self {
            estimator,
            max_items: max_items.max(1),
            snippet_chars,
        }
    }

    pub fn estimator_name(&self) -> &'static str {
        self.estimator.name()
    }

    pub fn assemble(
        &self,
        bundle: &RetrievalBundle,
        analysis: &Analysis,
        token_budget: usize,
    ) -> AssembledContext {
        if bundle.merged.is_empty() {
            return AssembledContext::empty(token_budget);
        }

        let original_count = bundle.merged.len();
        let mut truncated = false;

        let mut items = rank(&bundle.merged);
        if items.len() > self.max_items {
            items.truncate(self.max_items);
            truncated = true;
        }

        // Cutting a snippet to `snippet_chars` counts as a trim like any other.
        for item in &mut items {
            project(item, analysis);
            let cut = truncate_graphemes(&item.snippet, self.snippet_chars);
            if cut.len() < item.snippet.len() {
                item.snippet = cut;
                truncated = true;
            }
        }

        let mut costs: Vec<usize> = items
            .iter()
            .enumerate()
            .map(|(i, c)| self.estimator.estimate(&render_item(i + 1, c)))
            .collect();
        let mut total: usize = costs.iter().sum();

        // Drop from the bottom, never below one survivor.
        while total > token_budget && items.len() > 1 {
            items.pop();
            total -= costs.pop().unwrap_or(0);
            truncated = true;
        }

        // Shrink the last survivor: snippet first, then trailing fields.
        if total > token_budget {
            if let Some(last) = items.last_mut() {
                truncated = true;
                while total > token_budget && !last.snippet.is_empty() {
                    let half = last.snippet.graphemes(true).count() / 2;
                    last.snippet = truncate_graphemes(&last.snippet, half);
                    total = self.estimator.estimate(&render_item(1, last));
                }
                while total > token_budget && last.fields.pop_last().is_some() {
                    total = self.estimator.estimate(&render_item(1, last));
                }
            }
        }

        tracing::debug!(
            kept = items.len(),
            original = original_count,
            tokens = total,
            budget = token_budget,
            estimator = self.estimator.name(),
            "context assembled"
        );

        AssembledContext {
            items,
            estimated_tokens: total,
            token_budget,
            truncated,
            original_count,
        }
    }
}

/// Sort by composite relevance (stable) and store it as `rank_score`.
fn rank(candidates: &[Candidate]) -> Vec<Candidate> {
    let max_filled = candidates
        .iter()
        .map(filled_fields)
        .max()
        .unwrap_or(0);
    let timestamps: Vec<i64> = candidates
        .iter()
        .filter_map(|c| c.updated_at.map(|t| t.timestamp()))
        .collect();
    let oldest = timestamps.iter().min().copied();
    let newest = timestamps.iter().max().copied();

    let mut ranked: Vec<Candidate> = candidates
        .iter()
        .map(|c| {
            let entity = if c.entity_match { 1.0 } else { 0.0 };
            let completeness = if max_filled == 0 {
                0.0
            } else {
                filled_fields(c) as f32 / max_filled as f32
            };
            let freshness = match (c.updated_at, oldest, newest) {
                (Some(t), Some(lo), Some(hi)) if hi > lo => {
                    (t.timestamp() - lo) as f32 / (hi - lo) as f32
                }
                (Some(_), _, _) => 1.0,
                _ => 0.0,
            };
            let mut ranked = c.clone();
            ranked.rank_score = ENTITY_WEIGHT * entity
                + SEMANTIC_WEIGHT * c.semantic_score.clamp(0.0, 1.0)
                + COMPLETENESS_WEIGHT * completeness
                + FRESHNESS_WEIGHT * freshness;
            ranked
        })
        .collect();

    ranked.sort_by(|a, b| b.rank_score.total_cmp(&a.rank_score));
    ranked
}

fn filled_fields(c: &Candidate) -> usize {
    c.fields.values().filter(|v| !v.trim().is_empty()).count()
}

/// Keep required fields plus fields named by the analysis' key features.
fn project(candidate: &mut Candidate, analysis: &Analysis) {
    let features: Vec<String> = analysis
        .key_features
        .iter()
        .map(|f| f.to_lowercase())
        .collect();
    let fields = std::mem::take(&mut candidate.fields);
    candidate.fields = fields
        .into_iter()
        .filter(|(k, v)| {
            let key = k.to_lowercase();
            !v.trim().is_empty()
                && (REQUIRED_FIELDS.contains(&key.as_str())
                    || features.iter().any(|f| key.contains(f.as_str())))
        })
        .collect::<BTreeMap<_, _>>();
}

/// First `max` grapheme clusters of `text`.
pub fn truncate_graphemes(text: &str, max: usize) -> String {
    text.graphemes(true).take(max).collect()
}
