//! NDJSON wire events.
//!
//! One JSON object per line. A stream carries events in phase order, tokens
//! in generation order, and ends with exactly one `complete` or `error`.

use crate::types::ResponsePackage;
use serde::{Deserialize, Serialize};
use sift_core::AppResult;
use std::collections::BTreeMap;

/// Phase number of token events.
pub const GENERATION_PHASE: u8 = 4;

/// Phase number of the completion event.
pub const FINAL_PHASE: u8 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress {
        phase: u8,
        message: String,
        progress: u8,
    },
    PhaseResult {
        phase: u8,
        data: serde_json::Value,
        progress: u8,
    },
    Token {
        token: String,
        phase: u8,
    },
    Complete {
        phase: u8,
        data: ResponsePackage,
        progress: u8,
    },
    Error {
        message: String,
        phase: Option<u8>,
        partial: bool,
        phase_timings: BTreeMap<u8, f64>,
    },
}

impl PipelineEvent {
    /// `complete` and `error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::PhaseResult { .. } => "phase_result",
            Self::Token { .. } => "token",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize as one NDJSON line, newline included.
    pub fn to_ndjson_line(&self) -> AppResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one NDJSON line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> AppResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line)?))
    }
}
