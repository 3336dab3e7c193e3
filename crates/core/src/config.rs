//! Configuration management for sift.
//!
//! This module handles loading and merging configuration from multiple sources:
//! - Environment variables
//! - Command-line flags
//! - Config files (.sift/config.yaml)
//!
//! The configuration is workspace-centric, with prompts, corpora and the
//! structured record store living under `.sift/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the workspace root (contains .sift/)
    pub workspace: PathBuf,

    /// Optional config file path
    pub config_file: Option<PathBuf>,

    /// LLM provider ("ollama" or "scripted")
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Custom provider endpoint
    pub endpoint: Option<String>,

    /// Log level override
    pub log_level: Option<String>,

    /// Verbose mode (enables debug logging)
    pub verbose: bool,

    /// Disable colored output
    pub no_color: bool,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Pipeline tuning
    pub pipeline: PipelineConfig,
}

/// Tuning knobs for the five-phase pipeline.
///
/// Every field has a default, so a partial `pipeline:` section in
/// `config.yaml` only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Token budget for the assembled context
    pub token_budget: usize,

    /// Maximum number of candidates kept by the assembler
    pub max_context_items: usize,

    /// Character budget for each candidate snippet
    pub snippet_chars: usize,

    /// Default number of results requested from each source
    pub top_k: usize,

    /// Deadline for each retrieval adapter call
    pub adapter_timeout_ms: u64,

    /// Deadline for model calls (per chunk when streaming)
    pub model_timeout_ms: u64,

    /// Capacity of the generation token channel
    pub channel_capacity: usize,

    /// Pseudo-token size when re-chunking a blocking completion
    pub chunk_chars: usize,

    /// Cap on answer length passed to the model (unset: provider default)
    pub max_answer_tokens: Option<u32>,

    /// Delay between replayed tokens on a generation cache hit
    pub replay_delay_ms: u64,

    /// Number of top candidates that identify a generation cache entry
    pub generation_key_items: usize,

    /// Phase 1 cache TTL
    pub analysis_ttl_secs: u64,

    /// Phase 2 cache TTL
    pub retrieval_ttl_secs: u64,

    /// Phase 4 cache TTL (longest: generation is the expensive phase)
    pub generation_ttl_secs: u64,

    /// Token estimator: "cl100k" or "chars"
    pub tokenizer: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            token_budget: 3000,
            max_context_items: 10,
            snippet_chars: 400,
            top_k: 10,
            adapter_timeout_ms: 5_000,
            model_timeout_ms: 60_000,
            channel_capacity: 64,
            chunk_chars: 24,
            max_answer_tokens: None,
            replay_delay_ms: 5,
            generation_key_items: 5,
            analysis_ttl_secs: 300,
            retrieval_ttl_secs: 300,
            generation_ttl_secs: 3_600,
            tokenizer: "cl100k".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn replay_delay(&self) -> Duration {
        Duration::from_millis(self.replay_delay_ms)
    }

    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_secs(self.analysis_ttl_secs)
    }

    pub fn retrieval_ttl(&self) -> Duration {
        Duration::from_secs(self.retrieval_ttl_secs)
    }

    pub fn generation_ttl(&self) -> Duration {
        Duration::from_secs(self.generation_ttl_secs)
    }

    /// Reject values that would make the pipeline misbehave.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_context_items == 0 {
            return Err(AppError::Config(
                "pipeline.maxContextItems must be at least 1".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(AppError::Config(
                "pipeline.channelCapacity must be at least 1".to_string(),
            ));
        }
        if self.chunk_chars == 0 {
            return Err(AppError::Config(
                "pipeline.chunkChars must be at least 1".to_string(),
            ));
        }
        if self.max_answer_tokens == Some(0) {
            return Err(AppError::Config(
                "pipeline.maxAnswerTokens must be at least 1".to_string(),
            ));
        }
        if !["cl100k", "chars"].contains(&self.tokenizer.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown tokenizer: {}. Supported: cl100k, chars",
                self.tokenizer
            )));
        }
        if self.generation_ttl_secs < self.retrieval_ttl_secs
            || self.generation_ttl_secs < self.analysis_ttl_secs
        {
            tracing::warn!("generation cache TTL is shorter than an earlier phase's TTL");
        }
        Ok(())
    }
}

/// Full configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigFile {
    llm: Option<LlmSection>,
    workspace: Option<WorkspaceSection>,
    logging: Option<LoggingSection>,
    pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmSection {
    provider: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkspaceSection {
    path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggingSection {
    level: Option<String>,
    color: Option<bool>,
    json: Option<bool>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_file: None,
            provider: "ollama".to_string(), // Local-first default
            model: "llama3.2".to_string(),
            endpoint: None,
            log_level: None,
            verbose: false,
            no_color: false,
            log_json: false,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and defaults.
    ///
    /// Environment variables:
    /// - `SIFT_WORKSPACE`: Override workspace path
    /// - `SIFT_CONFIG`: Path to config file
    /// - `SIFT_PROVIDER`: LLM provider
    /// - `SIFT_MODEL`: Model identifier
    /// - `SIFT_ENDPOINT`: Provider endpoint
    /// - `RUST_LOG`: Log level
    /// - `NO_COLOR`: Disable colored output
    ///
    /// # Example
    /// ```no_run
    /// use sift_core::config::AppConfig;
    ///
    /// let config = AppConfig::load().expect("Failed to load config");
    /// println!("Workspace: {:?}", config.workspace);
    /// ```
    pub fn load() -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(workspace) = std::env::var("SIFT_WORKSPACE") {
            config.workspace = PathBuf::from(workspace);
        }

        if let Ok(config_file) = std::env::var("SIFT_CONFIG") {
            config.config_file = Some(PathBuf::from(config_file));
        }

        if !config.workspace.exists() {
            return Err(AppError::Config(format!(
                "Workspace directory does not exist: {:?}",
                config.workspace
            )));
        }

        let config_path = match config.config_file {
            Some(ref cf) => cf.clone(),
            None => config.sift_dir().join("config.yaml"),
        };

        if config_path.exists() {
            config = config.merge_yaml(&config_path)?;
        }

        // Environment variables override YAML config
        if let Ok(provider) = std::env::var("SIFT_PROVIDER") {
            config.provider = provider;
        }

        if let Ok(model) = std::env::var("SIFT_MODEL") {
            config.model = model;
        }

        if let Ok(endpoint) = std::env::var("SIFT_ENDPOINT") {
            config.endpoint = Some(endpoint);
        }

        if config.log_level.is_none() {
            config.log_level = std::env::var("RUST_LOG").ok();
        }

        if std::env::var("NO_COLOR").is_ok() {
            config.no_color = true;
        }

        Ok(config)
    }

    /// Merge YAML configuration file into this config.
    fn merge_yaml(&self, path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config_file: ConfigFile = serde_yaml::from_str(&contents).map_err(|e| {
            AppError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        Ok(self.merge_file(config_file))
    }

    fn merge_file(&self, config_file: ConfigFile) -> Self {
        let mut result = self.clone();

        if let Some(path) = config_file.workspace.and_then(|ws| ws.path) {
            result.workspace = PathBuf::from(path);
        }

        if let Some(logging) = config_file.logging {
            if let Some(level) = logging.level {
                result.log_level = Some(level);
            }
            if let Some(color) = logging.color {
                result.no_color = !color;
            }
            if let Some(json) = logging.json {
                result.log_json = json;
            }
        }

        if let Some(llm) = config_file.llm {
            if let Some(provider) = llm.provider {
                result.provider = provider;
            }
            if let Some(model) = llm.model {
                result.model = model;
            }
            if llm.endpoint.is_some() {
                result.endpoint = llm.endpoint;
            }
        }

        if let Some(pipeline) = config_file.pipeline {
            result.pipeline = pipeline;
        }

        result
    }

    /// Apply CLI overrides to the configuration.
    ///
    /// Command-line flags take precedence over environment variables and
    /// the config file.
    #[allow(clippy::too_many_arguments)]
    pub fn with_overrides(
        mut self,
        workspace: Option<PathBuf>,
        config_file: Option<PathBuf>,
        provider: Option<String>,
        model: Option<String>,
        log_level: Option<String>,
        verbose: bool,
        no_color: bool,
        log_json: bool,
    ) -> Self {
        if let Some(workspace) = workspace {
            self.workspace = workspace;
        }

        if let Some(config_file) = config_file {
            self.config_file = Some(config_file);
        }

        if let Some(provider) = provider {
            self.provider = provider;
        }

        if let Some(model) = model {
            self.model = model;
        }

        if let Some(log_level) = log_level {
            self.log_level = Some(log_level);
        }

        if verbose {
            self.verbose = true;
            // Verbose mode implies debug logging
            if self.log_level.is_none() {
                self.log_level = Some("debug".to_string());
            }
        }

        if no_color {
            self.no_color = true;
        }

        if log_json {
            self.log_json = true;
        }

        self
    }

    /// Get the path to the .sift directory.
    pub fn sift_dir(&self) -> PathBuf {
        self.workspace.join(".sift")
    }

    /// Default location of the semantic corpus (JSON lines).
    pub fn corpus_path(&self) -> PathBuf {
        self.sift_dir().join("corpus.jsonl")
    }

    /// Default location of the structured record store.
    pub fn records_path(&self) -> PathBuf {
        self.sift_dir().join("records.db")
    }

    /// Ensure the .sift directory exists.
    pub fn ensure_sift_dir(&self) -> AppResult<()> {
        let sift_dir = self.sift_dir();
        if !sift_dir.exists() {
            std::fs::create_dir_all(&sift_dir).map_err(|e| {
                AppError::Config(format!("Failed to create .sift directory: {}", e))
            })?;
        }
        Ok(())
    }

    /// Validate configuration for the active provider.
    pub fn validate(&self) -> AppResult<()> {
        let known_providers = ["ollama", "scripted"];

        if !known_providers.contains(&self.provider.as_str()) {
            return Err(AppError::Config(format!(
                "Unknown provider: {}. Supported: {}",
                self.provider,
                known_providers.join(", ")
            )));
        }

        self.pipeline.validate()
    }
}
