//! Phase 5: metadata, citations, Markdown repair and quality scoring.
//!
//! Every step is best-effort and the phase never returns an error.

use crate::types::{
    Analysis, AssembledContext, Citation, GeneratedText, Quality, ResponsePackage,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Maximum quality score.
pub const MAX_QUALITY_SCORE: f32 = 1.0;

/// Deducted for every failed quality check.
pub const QUALITY_PENALTY: f32 = 0.2;

/// Accepted response length, in characters.
pub const MIN_RESPONSE_CHARS: usize = 20;
pub const MAX_RESPONSE_CHARS: usize = 20_000;

/// Metadata keys every package must carry.
pub const REQUIRED_METADATA: &[&str] = &[
    "candidate_count",
    "estimated_tokens",
    "truncated",
    "intent",
    "complexity",
    "focus",
    "timestamp",
];

/// Phase 5 as seen by the orchestrator.
pub trait PostProcessor: Send + Sync {
    fn process(
        &self,
        generated: &GeneratedText,
        context: &AssembledContext,
        analysis: &Analysis,
        query: &str,
        upstream_warnings: &[String],
    ) -> ResponsePackage;
}

/// The stock post-processor: [`postprocess`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownPostProcessor;

impl PostProcessor for MarkdownPostProcessor {
    fn process(
        &self,
        generated: &GeneratedText,
        context: &AssembledContext,
        analysis: &Analysis,
        query: &str,
        upstream_warnings: &[String],
    ) -> ResponsePackage {
        postprocess(generated, context, analysis, query, upstream_warnings)
    }
}

/// Build the final package from the generated text.
pub fn postprocess(
    generated: &GeneratedText,
    context: &AssembledContext,
    analysis: &Analysis,
    query: &str,
    upstream_warnings: &[String],
) -> ResponsePackage {
    let metadata = build_metadata(generated, context, analysis, query);
    let citations = build_citations(context);
    let text = repair_markdown(&generated.text);
    let mut quality = score_quality(&text, &citations, &metadata);

    quality.warnings.extend(upstream_warnings.iter().cloned());
    if let Some(reason) = &generated.degraded {
        quality.warnings.push(format!("generation degraded: {}", reason));
    }

    ResponsePackage {
        text,
        metadata,
        citations,
        quality,
    }
}

pub fn build_metadata(
    generated: &GeneratedText,
    context: &AssembledContext,
    analysis: &Analysis,
    query: &str,
) -> BTreeMap<String, serde_json::Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("query".to_string(), json!(query));
    metadata.insert("candidate_count".to_string(), json!(context.items.len()));
    metadata.insert("original_count".to_string(), json!(context.original_count));
    metadata.insert("estimated_tokens".to_string(), json!(context.estimated_tokens));
    metadata.insert("token_budget".to_string(), json!(context.token_budget));
    metadata.insert("truncated".to_string(), json!(context.truncated));
    metadata.insert("intent".to_string(), json!(analysis.intent.as_str()));
    metadata.insert("complexity".to_string(), json!(analysis.complexity.as_str()));
    metadata.insert("focus".to_string(), json!(analysis.focus));
    metadata.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    metadata.insert("generation_strategy".to_string(), json!(generated.strategy));
    metadata.insert("from_cache".to_string(), json!(generated.from_cache));
    metadata
}

/// One citation per retained candidate, numbered as in the prompt context.
pub fn build_citations(context: &AssembledContext) -> Vec<Citation> {
    context
        .items
        .iter()
        .enumerate()
        .map(|(i, candidate)| Citation {
            index: i + 1,
            id: candidate.id.clone(),
            title: candidate.title(),
            document_id: candidate.document_id.clone(),
            relevance: candidate.rank_score,
            origin: candidate.origin,
        })
        .collect()
}

pub fn score_quality(
    text: &str,
    citations: &[Citation],
    metadata: &BTreeMap<String, serde_json::Value>,
) -> Quality {
    let mut warnings = Vec::new();

    let length = text.chars().count();
    if length < MIN_RESPONSE_CHARS {
        warnings.push(format!("response too short ({} chars)", length));
    } else if length > MAX_RESPONSE_CHARS {
        warnings.push(format!("response too long ({} chars)", length));
    }

    if !has_structure(text) {
        warnings.push("response has no header, bold text or table".to_string());
    }

    if citations.is_empty() {
        warnings.push("response has no citations".to_string());
    }

    let missing: Vec<&str> = REQUIRED_METADATA
        .iter()
        .copied()
        .filter(|key| metadata.get(*key).map_or(true, |v| v.is_null()))
        .collect();
    if !missing.is_empty() {
        warnings.push(format!("metadata incomplete: missing {}", missing.join(", ")));
    }

    let score = (MAX_QUALITY_SCORE - QUALITY_PENALTY * warnings.len() as f32).max(0.0);
    Quality { score, warnings }
}

fn has_structure(text: &str) -> bool {
    text.contains("**")
        || text.lines().any(|line| {
            let line = line.trim_start();
            is_header(line) || line.starts_with('|')
        })
}

fn is_header(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn fence_marker(line: &str) -> Option<&'static str> {
    if line.starts_with("```") {
        Some("```")
    } else if line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn is_separator_row(row: &str) -> bool {
    let inner = row.trim().trim_matches('|');
    !inner.is_empty()
        && inner.contains('-')
        && inner
            .chars()
            .all(|c| matches!(c, '-' | ':' | '|' | ' '))
}

fn count_cells(row: &str) -> usize {
    let inner = row.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').count().max(1)
}

/// Line buffer that collapses blank runs outside code fences.
struct RepairBuffer {
    lines: Vec<String>,
    table_columns: Option<usize>,
}

impl RepairBuffer {
    fn last_is_blank(&self) -> bool {
        self.lines.last().map_or(true, |l| l.trim().is_empty())
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn push_blank(&mut self) {
        if !self.last_is_blank() {
            self.lines.push(String::new());
        }
    }

    fn ensure_blank_before(&mut self) {
        if !self.lines.is_empty() {
            self.push_blank();
        }
    }

    /// A table that ended after its header row gets a separator.
    fn close_table(&mut self, rows: usize) {
        if let Some(columns) = self.table_columns.take() {
            if rows == 1 {
                self.push(separator_row(columns));
            }
        }
    }
}

fn separator_row(columns: usize) -> String {
    format!("|{}", " --- |".repeat(columns))
}

fn close_bold(line: &str) -> String {
    if line.matches("**").count() % 2 == 1 {
        format!("{}**", line.trim_end())
    } else {
        line.to_string()
    }
}

/// Fix the Markdown defects a streamed answer typically ends with.
///
/// Header spacing, unterminated bold, unterminated tables and open code
/// fences are closed; runs of blank lines collapse to one; the result is
/// trimmed. Lines inside code fences are left alone.
pub fn repair_markdown(text: &str) -> String {
    let mut buf = RepairBuffer {
        lines: Vec::new(),
        table_columns: None,
    };
    let mut fence: Option<&'static str> = None;
    let mut table_rows = 0usize;

    for line in text.lines() {
        let trimmed = line.trim_start();

        if let Some(marker) = fence {
            buf.push(line.to_string());
            if trimmed.starts_with(marker) {
                fence = None;
            }
            continue;
        }

        if let Some(marker) = fence_marker(trimmed) {
            if table_rows > 0 {
                buf.close_table(table_rows);
                table_rows = 0;
                buf.push_blank();
            }
            fence = Some(marker);
            buf.push(line.to_string());
            continue;
        }

        if trimmed.starts_with('|') {
            let mut row = trimmed.trim_end().to_string();
            if !row.ends_with('|') || row.len() == 1 {
                row.push_str(" |");
            }
            if table_rows == 0 {
                buf.ensure_blank_before();
                buf.table_columns = Some(count_cells(&row));
            } else if table_rows == 1 && !is_separator_row(&row) {
                let columns = buf.table_columns.unwrap_or_else(|| count_cells(&row));
                buf.push(separator_row(columns));
            }
            buf.push(row);
            table_rows += 1;
            continue;
        }

        if table_rows > 0 {
            buf.close_table(table_rows);
            table_rows = 0;
            buf.push_blank();
        }

        if line.trim().is_empty() {
            buf.push_blank();
            continue;
        }

        if is_header(trimmed) {
            buf.ensure_blank_before();
        }
        buf.push(close_bold(line));
    }

    if table_rows > 0 {
        buf.close_table(table_rows);
    }
    if let Some(marker) = fence {
        buf.push(marker.to_string());
    }

    buf.lines.join("\n").trim().to_string()
}
