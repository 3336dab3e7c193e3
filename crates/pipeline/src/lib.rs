//! Streaming five-phase RAG pipeline.
//!
//! A request runs through analysis, parallel retrieval, context assembly,
//! streaming generation and post-processing, emitting NDJSON-ready
//! [`PipelineEvent`]s as it goes:
//!
//! ```no_run
//! use sift_pipeline::{MemorySemanticIndex, Pipeline, PipelineRequest, SqliteStructuredStore};
//! use sift_llm::ScriptedClient;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::builder()
//!     .semantic(Arc::new(MemorySemanticIndex::new(Vec::new())))
//!     .structured(Arc::new(SqliteStructuredStore::open_in_memory()?))
//!     .client(Arc::new(ScriptedClient::new("## Answer")))
//!     .build()?;
//!
//! let (mut events, _handle) = Arc::new(pipeline).spawn(PipelineRequest::new("compare A and B"));
//! while let Some(event) = events.recv().await {
//!     print!("{}", event.to_ndjson_line()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod analyzer;
pub mod assembler;
pub mod cache;
pub mod emitter;
pub mod generator;
pub mod orchestrator;
pub mod postprocess;
pub mod protocol;
pub mod retriever;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use adapters::{
    CorpusRecord, MemorySemanticIndex, RowFilter, SemanticSearch, SqliteStructuredStore,
    StructuredQuery,
};
pub use cache::{CacheStore, TtlCache};
pub use emitter::EventEmitter;
pub use orchestrator::{Pipeline, PipelineBuilder, PipelineOutcome};
pub use protocol::PipelineEvent;
pub use state::{PipelineState, PipelineStatus};
pub use types::{
    Analysis, AssembledContext, Candidate, Citation, GeneratedText, Match, PipelineRequest,
    Quality, ResponsePackage, RetrievalBundle, Row,
};
