//! Phase 2: parallel retrieval and cross-source merge.

use crate::adapters::{RowFilter, SemanticSearch, StructuredQuery};
use crate::cache::{normalize_query, normalize_terms, PhaseCache};
use crate::types::{Candidate, Match, Origin, RetrievalBundle, Row, SourceCounts, BUSINESS_KEY_FIELDS};
use futures::FutureExt;
use sift_core::{AppError, AppResult};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Weight of the semantic similarity in `rank_score`.
pub const SEMANTIC_WEIGHT: f32 = 0.7;

/// Weight of an exact entity match in `rank_score`.
pub const ENTITY_WEIGHT: f32 = 0.3;

/// Phase 2 entry point.
pub struct ParallelRetriever {
    semantic: Arc<dyn SemanticSearch>,
    structured: Arc<dyn StructuredQuery>,
    cache: PhaseCache,
    timeout: Duration,
}

impl ParallelRetriever {
    pub fn new(
        semantic: Arc<dyn SemanticSearch>,
        structured: Arc<dyn StructuredQuery>,
        cache: PhaseCache,
        timeout: Duration,
    ) -> Self {
        Self {
            semantic,
            structured,
            cache,
            timeout,
        }
    }

    /// Query both sources concurrently and merge their results.
    ///
    /// Fails only when both sources fail. Sources that succeed with no data
    /// produce an empty bundle; deciding whether that is fatal is left to the
    /// caller.
    pub async fn retrieve(
        &self,
        query: &str,
        entities: &[String],
        top_k: usize,
        document_ids: &BTreeSet<String>,
        use_cache: bool,
    ) -> AppResult<RetrievalBundle> {
        let top_k_str = top_k.to_string();
        let key = self.cache.key(&[
            &normalize_query(query),
            &normalize_terms(entities),
            &top_k_str,
            &normalize_terms(document_ids),
        ]);

        if use_cache {
            if let Some(mut cached) = self.cache.get::<RetrievalBundle>(&key).await {
                cached.from_cache = true;
                return Ok(cached);
            }
        }

        let filter = RowFilter {
            entities: entities.to_vec(),
            document_ids: document_ids.clone(),
            limit: top_k,
        };

        // Fixed fan-out: both calls settle before merging.
        let (semantic, structured) = tokio::join!(
            bounded(self.timeout, self.semantic.search(query, top_k)),
            bounded(self.timeout, self.structured.query(&filter)),
        );

        let mut warnings = Vec::new();
        let (semantic_matches, structured_rows) = match (semantic, structured) {
            (Err(s), Err(r)) => {
                return Err(AppError::Retrieval(format!(
                    "all sources failed (semantic: {}; structured: {})",
                    s, r
                )));
            }
            (Ok(matches), Err(e)) => {
                tracing::warn!(source = self.structured.name(), "structured source failed: {}", e);
                warnings.push(format!("structured source unavailable: {}", e));
                (matches, Vec::new())
            }
            (Err(e), Ok(rows)) => {
                tracing::warn!(source = self.semantic.name(), "semantic source failed: {}", e);
                warnings.push(format!("semantic source unavailable: {}", e));
                (Vec::new(), rows)
            }
            (Ok(matches), Ok(rows)) => (matches, rows),
        };

        let source_counts = SourceCounts {
            semantic: semantic_matches.len(),
            structured: structured_rows.len(),
        };
        let merged = merge_sources(&semantic_matches, &structured_rows, entities, document_ids);

        if merged.is_empty() && source_counts.any() {
            warnings.push(format!(
                "{} retrieved records fell outside the requested documents",
                source_counts.semantic + source_counts.structured
            ));
        }

        tracing::info!(
            semantic = source_counts.semantic,
            structured = source_counts.structured,
            merged = merged.len(),
            "retrieval finished"
        );

        let bundle = RetrievalBundle {
            semantic_matches,
            structured_rows,
            merged,
            source_counts,
            warnings,
            from_cache: false,
        };

        // Partial or empty results are not worth pinning for a whole TTL.
        if use_cache && bundle.warnings.is_empty() && !bundle.merged.is_empty() {
            self.cache.put(key, &bundle).await;
        }

        Ok(bundle)
    }
}

/// One source call. A timeout or a panic counts as that source failing.
async fn bounded<T>(limit: Duration, call: impl Future<Output = AppResult<T>>) -> AppResult<T> {
    let guarded = AssertUnwindSafe(call).catch_unwind();
    match tokio::time::timeout(limit, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(AppError::Other("adapter panicked".to_string())),
        Err(_) => Err(AppError::Timeout(format!("adapter call exceeded {:?}", limit))),
    }
}

/// Lowercase alphanumerics only, so "Zephyr-X1" and "zephyr x1" agree.
pub fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Business identity of a record: the first non-empty key field, else its id.
pub fn business_key(fields: &std::collections::BTreeMap<String, String>, id: &str) -> String {
    BUSINESS_KEY_FIELDS
        .iter()
        .filter_map(|f| fields.get(*f))
        .map(|v| normalize_key(v))
        .find(|k| !k.is_empty())
        .unwrap_or_else(|| format!("id:{}", id))
}

fn in_scope(document_id: &Option<String>, document_ids: &BTreeSet<String>) -> bool {
    document_ids.is_empty()
        || document_id
            .as_ref()
            .is_some_and(|d| document_ids.contains(d))
}

fn matches_entity(candidate: &Candidate, entity_keys: &[String]) -> bool {
    let names: Vec<String> = BUSINESS_KEY_FIELDS
        .iter()
        .filter_map(|f| candidate.fields.get(*f))
        .map(|v| normalize_key(v))
        .chain(std::iter::once(candidate.business_key.clone()))
        .collect();
    entity_keys
        .iter()
        .any(|e| names.iter().any(|n| n == e))
}

/// Merge both result sets into ranked candidates.
///
/// Records are grouped by business key, so one logical item retrieved from
/// both sources becomes a single `Both` candidate. Groups are created in
/// input order (semantic first) and the final sort is stable, which makes
/// the output a pure function of the inputs.
pub fn merge_sources(
    matches: &[Match],
    rows: &[Row],
    entities: &[String],
    document_ids: &BTreeSet<String>,
) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for m in matches.iter().filter(|m| in_scope(&m.document_id, document_ids)) {
        let key = business_key(&m.metadata, &m.id);
        match index.get(&key) {
            Some(&i) => {
                let c = &mut merged[i];
                if m.score > c.semantic_score {
                    c.semantic_score = m.score;
                    c.snippet = m.text.clone();
                }
                for (k, v) in &m.metadata {
                    c.fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
                c.updated_at = c.updated_at.max(m.updated_at);
            }
            None => {
                index.insert(key.clone(), merged.len());
                merged.push(Candidate {
                    id: m.id.clone(),
                    business_key: key,
                    rank_score: 0.0,
                    fields: m.metadata.clone(),
                    snippet: m.text.clone(),
                    origin: Origin::Semantic,
                    semantic_score: m.score,
                    entity_match: false,
                    document_id: m.document_id.clone(),
                    updated_at: m.updated_at,
                });
            }
        }
    }

    for r in rows.iter().filter(|r| in_scope(&r.document_id, document_ids)) {
        let key = business_key(&r.fields, &r.id);
        match index.get(&key) {
            Some(&i) => {
                let c = &mut merged[i];
                if c.origin == Origin::Semantic {
                    c.origin = Origin::Both;
                }
                // Structured values are authoritative over semantic metadata.
                for (k, v) in &r.fields {
                    c.fields.insert(k.clone(), v.clone());
                }
                if c.document_id.is_none() {
                    c.document_id = r.document_id.clone();
                }
                c.updated_at = c.updated_at.max(r.updated_at);
            }
            None => {
                index.insert(key.clone(), merged.len());
                merged.push(Candidate {
                    id: r.id.clone(),
                    business_key: key,
                    rank_score: 0.0,
                    fields: r.fields.clone(),
                    snippet: r.fields.get("description").cloned().unwrap_or_default(),
                    origin: Origin::Structured,
                    semantic_score: 0.0,
                    entity_match: false,
                    document_id: r.document_id.clone(),
                    updated_at: r.updated_at,
                });
            }
        }
    }

    let entity_keys: Vec<String> = entities
        .iter()
        .map(|e| normalize_key(e))
        .filter(|e| !e.is_empty())
        .collect();

    for c in &mut merged {
        c.entity_match = matches_entity(c, &entity_keys);
        let bonus = if c.entity_match { 1.0 } else { 0.0 };
        c.rank_score = SEMANTIC_WEIGHT * c.semantic_score + ENTITY_WEIGHT * bonus;
    }

    merged.sort_by(|a, b| b.rank_score.total_cmp(&a.rank_score));
    merged
}
