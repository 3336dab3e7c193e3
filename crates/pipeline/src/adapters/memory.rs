//! In-memory semantic index over trigram embeddings.
//!
//! Embeddings are deterministic and content-dependent: each word contributes
//! to the dimensions its character trigrams hash to. Not as accurate as a
//! neural model, but stable enough for local corpora and tests.

use crate::adapters::SemanticSearch;
use crate::types::Match;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sift_core::{AppError, AppResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Embedding width used by the index.
pub const DEFAULT_DIMENSIONS: usize = 384;

/// Minimum cosine similarity for a record to be returned.
const MIN_SCORE: f32 = 0.05;

const STOP_WORDS: &[&str] = &[
    "the", "is", "at", "which", "on", "a", "an", "as", "are", "was", "were", "for", "to", "of",
    "in", "and", "or", "but", "with", "by", "from", "this", "that", "be", "have", "has", "had",
    "it", "its", "their", "they", "them", "what", "how",
];

/// One line of a corpus JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct IndexedRecord {
    record: CorpusRecord,
    embedding: Vec<f32>,
}

/// Brute-force cosine search over embedded records.
#[derive(Debug)]
pub struct MemorySemanticIndex {
    records: Vec<IndexedRecord>,
    dimensions: usize,
}

impl MemorySemanticIndex {
    pub fn new(records: Vec<CorpusRecord>) -> Self {
        Self::with_dimensions(records, DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(records: Vec<CorpusRecord>, dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        let records = records
            .into_iter()
            .map(|record| IndexedRecord {
                embedding: trigram_embedding(&record.text, dimensions),
                record,
            })
            .collect();
        Self {
            records,
            dimensions,
        }
    }

    /// Load records from a JSONL file, one `CorpusRecord` per line.
    ///
    /// Blank lines are skipped; a malformed line is an error naming its
    /// line number.
    pub fn load_jsonl(path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Storage(format!("Failed to read corpus {:?}: {}", path, e))
        })?;

        let mut records = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: CorpusRecord = serde_json::from_str(line).map_err(|e| {
                AppError::Storage(format!("{:?} line {}: {}", path, i + 1, e))
            })?;
            records.push(record);
        }

        tracing::info!("Loaded {} corpus records from {:?}", records.len(), path);
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn search_sync(&self, query: &str, top_k: usize) -> Vec<Match> {
        let query_embedding = trigram_embedding(query, self.dimensions);

        let mut scored: Vec<(&IndexedRecord, f32)> = self
            .records
            .iter()
            .map(|r| (r, cosine_similarity(&query_embedding, &r.embedding)))
            .filter(|(_, score)| *score >= MIN_SCORE)
            .collect();

        // Stable: equal scores keep corpus order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(r, score)| Match {
                id: r.record.id.clone(),
                document_id: r.record.document_id.clone(),
                text: r.record.text.clone(),
                score,
                metadata: r.record.metadata.clone(),
                updated_at: r.record.updated_at,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SemanticSearch for MemorySemanticIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(&self, query: &str, top_k: usize) -> AppResult<Vec<Match>> {
        let matches = self.search_sync(query, top_k);
        tracing::debug!("memory index returned {} matches", matches.len());
        Ok(matches)
    }
}

/// Unit-length trigram embedding of `text`.
pub fn trigram_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dimensions];
    let lower = text.to_lowercase();
    let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();

    let mut word_freq: HashMap<&str, u32> = HashMap::new();
    for word in lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !stop_words.contains(w))
    {
        *word_freq.entry(word).or_insert(0) += 1;
    }

    for (word, freq) in &word_freq {
        let chars: Vec<char> = word.chars().collect();
        // Short tokens such as model numbers ("x1") still get a trigram.
        let padded: Vec<char> = if chars.len() < 3 {
            let mut p = chars.clone();
            p.resize(3, '_');
            p
        } else {
            chars
        };

        for window in padded.windows(3) {
            let hash = window
                .iter()
                .collect::<String>()
                .bytes()
                .fold(0u64, |acc, b| acc.wrapping_mul(37).wrapping_add(b as u64));
            embedding[(hash as usize) % dimensions] += (*freq as f32).sqrt();
        }

        let word_hash = word
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        embedding[(word_hash as usize) % dimensions] += *freq as f32;
    }

    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut embedding {
            *v /= norm;
        }
    }
    embedding
}

/// Cosine similarity; zero when either vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(id: &str, text: &str) -> CorpusRecord {
        CorpusRecord {
            id: id.to_string(),
            document_id: Some("doc-1".to_string()),
            text: text.to_string(),
            metadata: BTreeMap::new(),
            updated_at: None,
        }
    }

    #[test]
    fn test_embedding_is_normalized_and_deterministic() {
        let a = trigram_embedding("Battery life of the Zephyr X1", 128);
        let b = trigram_embedding("Battery life of the Zephyr X1", 128);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = trigram_embedding("", 64);
        assert!(e.iter().all(|&x| x == 0.0));
        assert_eq!(cosine_similarity(&e, &e), 0.0);
    }

    #[tokio::test]
    async fn test_search_ranks_relevant_record_first() {
        let index = MemorySemanticIndex::new(vec![
            record("r1", "Cooking recipes for fresh pasta"),
            record("r2", "The Zephyr laptop battery lasts fourteen hours"),
            record("r3", "Gardening tips for spring"),
        ]);

        let matches = index.search("zephyr battery hours", 2).await.unwrap();
        assert!(!matches.is_empty());
        assert!(matches.len() <= 2);
        assert_eq!(matches[0].id, "r2");
        assert_eq!(matches[0].document_id.as_deref(), Some("doc-1"));
    }

    #[tokio::test]
    async fn test_unrelated_query_returns_nothing() {
        let index = MemorySemanticIndex::new(vec![record("r1", "alpha beta gamma")]);
        let matches = index.search("", 5).await.unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_load_jsonl_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id":"a","text":"first record"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"id":"b","document_id":"d","text":"second","metadata":{{"name":"B"}}}}"#
        )
        .unwrap();

        let index = MemorySemanticIndex::load_jsonl(file.path()).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_load_jsonl_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id":"a","text":"ok"}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = MemorySemanticIndex::load_jsonl(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
