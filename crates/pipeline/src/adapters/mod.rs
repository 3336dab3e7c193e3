//! Retrieval source contracts and the bundled implementations.
//!
//! The pipeline only depends on the two traits below; the in-memory index
//! and the SQLite store are local stand-ins for external vector and
//! relational stores.

pub mod memory;
pub mod sqlite;

pub use memory::{CorpusRecord, MemorySemanticIndex};
pub use sqlite::SqliteStructuredStore;

use crate::types::{Match, Row};
use sift_core::AppResult;
use std::collections::BTreeSet;

/// Similarity search over unstructured evidence.
#[async_trait::async_trait]
pub trait SemanticSearch: Send + Sync {
    fn name(&self) -> &str {
        "semantic"
    }

    async fn search(&self, query: &str, top_k: usize) -> AppResult<Vec<Match>>;
}

/// Filter for structured lookups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    /// Entity names to look up; rows match if their name contains any of them
    pub entities: Vec<String>,

    /// Restrict to these documents; empty means all
    pub document_ids: BTreeSet<String>,

    pub limit: usize,
}

/// Lookup over structured records.
#[async_trait::async_trait]
pub trait StructuredQuery: Send + Sync {
    fn name(&self) -> &str {
        "structured"
    }

    async fn query(&self, filter: &RowFilter) -> AppResult<Vec<Row>>;

    /// Entity names known to this source, used by the query analyzer.
    async fn vocabulary(&self, _document_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
        Ok(Vec::new())
    }
}
