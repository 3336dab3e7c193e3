//! Error types for sift.
//!
//! This module defines a unified error enum covering configuration, I/O,
//! model, prompt and storage errors, plus the fatal pipeline failures
//! (analysis, retrieval, assembly). Degradations in generation and
//! post-processing are not errors; they surface as quality warnings.

use thiserror::Error;

/// Unified error type for sift.
///
/// All fallible functions return `Result<T, AppError>`.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LLM provider errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// Prompt system errors
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Retrieval store errors (SQLite, vector index, corpus files)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Phase 1 could not produce an analysis
    #[error("Analysis failure: {0}")]
    Analysis(String),

    /// Phase 2 had no usable source
    #[error("Retrieval failure: {0}")]
    Retrieval(String),

    /// Phase 3 hit an internal defect
    #[error("Assembly failure: {0}")]
    Assembly(String),

    /// An external call exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The collaborator does not support the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The consumer went away before the request finished
    #[error("Request cancelled")]
    Cancelled,

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Whether this error means "the operation is not available" rather than
    /// "the operation failed".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, AppError::Unsupported(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
