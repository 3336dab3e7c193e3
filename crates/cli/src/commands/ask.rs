//! Ask command handler.
//!
//! Runs the pipeline over the workspace corpus and record store and writes
//! its event stream to stdout.

use crate::output::{sink_for, OutputFormat};
use anyhow::bail;
use clap::Args;
use sift_core::{config::AppConfig, AppError, AppResult};
use sift_llm::create_client;
use sift_pipeline::{
    MemorySemanticIndex, Pipeline, PipelineOutcome, PipelineRequest, SqliteStructuredStore,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Answer a question from the workspace corpus and records
#[derive(Args, Debug)]
pub struct AskCommand {
    /// The question to ask
    pub query: Option<String>,

    /// Read the question from file
    #[arg(short, long, conflicts_with = "query")]
    pub file: Option<PathBuf>,

    /// Restrict evidence to a document (repeatable)
    #[arg(short, long = "document")]
    pub documents: Vec<String>,

    /// Number of matches to request from each source
    #[arg(long)]
    pub top_k: Option<usize>,

    /// Token budget for the assembled context
    #[arg(long)]
    pub token_budget: Option<usize>,

    /// Answer language
    #[arg(long, default_value = "en")]
    pub language: String,

    /// Session identifier (default: a fresh one)
    #[arg(long)]
    pub session: Option<String>,

    /// Skip the phase caches
    #[arg(long)]
    pub no_cache: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "ndjson")]
    pub format: OutputFormat,
}

impl AskCommand {
    pub async fn execute(&self, config: &AppConfig) -> anyhow::Result<()> {
        tracing::info!("Executing ask command");
        tracing::debug!("Ask command options: {:?}", self);

        config.validate()?;
        let query = self
            .get_query()?
            .ok_or_else(|| AppError::Config("No question provided".to_string()))?;

        let pipeline = Arc::new(self.build_pipeline(config)?);
        let request = self.build_request(query, config);

        let (mut events, handle) = pipeline.spawn(request);
        let mut sink = sink_for(self.format, std::io::stdout());
        while let Some(event) = events.recv().await {
            sink.handle(&event)?;
        }
        sink.finish()?;

        match handle.await? {
            PipelineOutcome::Completed(_) => Ok(()),
            PipelineOutcome::Failed { message, .. } => bail!("pipeline failed: {}", message),
            PipelineOutcome::Cancelled => bail!("pipeline cancelled"),
        }
    }

    /// Wire sources and the model client once, before the request runs.
    fn build_pipeline(&self, config: &AppConfig) -> AppResult<Pipeline> {
        let corpus_path = config.corpus_path();
        let semantic = if corpus_path.exists() {
            MemorySemanticIndex::load_jsonl(&corpus_path)?
        } else {
            tracing::warn!("No corpus at {:?}; semantic search is empty", corpus_path);
            MemorySemanticIndex::new(Vec::new())
        };
        tracing::debug!("Loaded {} corpus records", semantic.len());

        let structured = SqliteStructuredStore::open(&config.records_path())?;
        let client = create_client(&config.provider, config.endpoint.as_deref())?;

        let mut pipeline_config = config.pipeline.clone();
        if let Some(token_budget) = self.token_budget {
            pipeline_config.token_budget = token_budget;
        }

        Pipeline::builder()
            .semantic(Arc::new(semantic))
            .structured(Arc::new(structured))
            .client(client)
            .model(config.model.clone())
            .config(pipeline_config)
            .workspace(config.workspace.clone())
            .build()
    }

    fn build_request(&self, query: String, config: &AppConfig) -> PipelineRequest {
        let mut request = PipelineRequest::new(query)
            .with_language(self.language.clone())
            .with_top_k(self.top_k.unwrap_or(config.pipeline.top_k));

        if let Some(ref session) = self.session {
            request = request.with_session(session.clone());
        }
        for document in &self.documents {
            request = request.with_document(document.clone());
        }
        if let Some(token_budget) = self.token_budget {
            request = request.with_token_budget(token_budget);
        }
        if self.no_cache {
            request = request.without_cache();
        }
        request
    }

    fn get_query(&self) -> AppResult<Option<String>> {
        if let Some(ref query) = self.query {
            return Ok(Some(query.clone()));
        }
        match self.file {
            Some(ref path) => Ok(Some(std::fs::read_to_string(path)?.trim().to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(args: &[&str]) -> AskCommand {
        use clap::Parser;

        #[derive(Parser)]
        struct Harness {
            #[command(flatten)]
            ask: AskCommand,
        }

        let mut argv = vec!["ask"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).ask
    }

    #[test]
    fn test_request_carries_flags() {
        let cmd = command(&[
            "compare A and B",
            "--document",
            "doc-1",
            "-d",
            "doc-2",
            "--top-k",
            "3",
            "--token-budget",
            "500",
            "--no-cache",
        ]);
        let request = cmd.build_request("compare A and B".to_string(), &AppConfig::default());

        assert_eq!(request.query, "compare A and B");
        assert_eq!(request.top_k, 3);
        assert_eq!(request.document_ids.len(), 2);
        assert_eq!(request.options.token_budget, Some(500));
        assert!(!request.options.use_cache);
        assert_eq!(cmd.format, OutputFormat::Ndjson);
    }

    #[test]
    fn test_top_k_defaults_to_config() {
        let mut config = AppConfig::default();
        config.pipeline.top_k = 7;
        let request = command(&["q"]).build_request("q".to_string(), &config);
        assert_eq!(request.top_k, 7);
    }

    #[test]
    fn test_query_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.txt");
        std::fs::write(&path, "what is new?\n").unwrap();

        let cmd = command(&["--file", path.to_str().unwrap()]);
        assert_eq!(cmd.get_query().unwrap(), Some("what is new?".to_string()));
    }

    #[test]
    fn test_build_pipeline_on_empty_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default().with_overrides(
            Some(dir.path().to_path_buf()),
            None,
            Some("scripted".to_string()),
            None,
            None,
            false,
            false,
            false,
        );

        let pipeline = command(&["q", "--token-budget", "900"])
            .build_pipeline(&config)
            .unwrap();
        assert_eq!(pipeline.config().token_budget, 900);
        assert!(config.records_path().exists());
    }
}
