//! Rendered blocks.

use crate::inline::{escape_html, render_inline};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Heading { level: u8 },
    Paragraph,
    /// `closed` is false when the fence was never closed
    Code { info: String, closed: bool },
    Table,
    List { ordered: bool },
    ThematicBreak,
}

/// One top-level Markdown block and its HTML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    #[serde(flatten)]
    pub kind: BlockKind,
    pub html: String,
    /// Rendered with a synthetic close; may still change
    pub tentative: bool,
}

impl Block {
    pub(crate) fn heading(level: u8, text: &str) -> Self {
        Self::new(
            BlockKind::Heading { level },
            format!("<h{0}>{1}</h{0}>", level, render_inline(text.trim())),
        )
    }

    pub(crate) fn paragraph(lines: &[&str]) -> Self {
        let text = lines
            .iter()
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(BlockKind::Paragraph, format!("<p>{}</p>", render_inline(&text)))
    }

    pub(crate) fn code(info: &str, lines: &[&str], closed: bool) -> Self {
        let class = info
            .split_whitespace()
            .next()
            .map(|lang| format!(" class=\"language-{}\"", escape_html(lang)))
            .unwrap_or_default();
        let mut body = String::new();
        for line in lines {
            body.push_str(&escape_html(line));
            body.push('\n');
        }
        Self::new(
            BlockKind::Code {
                info: info.to_string(),
                closed,
            },
            format!("<pre><code{}>{}</code></pre>", class, body),
        )
    }

    pub(crate) fn table(lines: &[&str]) -> Self {
        let rows: Vec<Vec<String>> = lines.iter().map(|l| split_cells(l)).collect();
        let mut html = String::from("<table>");

        if let Some(header) = rows.first() {
            html.push_str("<thead><tr>");
            for cell in header {
                html.push_str(&format!("<th>{}</th>", render_inline(cell)));
            }
            html.push_str("</tr></thead>");
        }

        let body_start = if lines.len() > 1 && is_separator_row(lines[1]) {
            2
        } else {
            1
        };
        if rows.len() > body_start {
            html.push_str("<tbody>");
            for row in &rows[body_start..] {
                html.push_str("<tr>");
                for cell in row {
                    html.push_str(&format!("<td>{}</td>", render_inline(cell)));
                }
                html.push_str("</tr>");
            }
            html.push_str("</tbody>");
        }

        html.push_str("</table>");
        Self::new(BlockKind::Table, html)
    }

    pub(crate) fn list(ordered: bool, items: &[String]) -> Self {
        let tag = if ordered { "ol" } else { "ul" };
        let mut html = format!("<{}>", tag);
        for item in items {
            html.push_str(&format!("<li>{}</li>", render_inline(item)));
        }
        html.push_str(&format!("</{}>", tag));
        Self::new(BlockKind::List { ordered }, html)
    }

    pub(crate) fn thematic_break() -> Self {
        Self::new(BlockKind::ThematicBreak, "<hr />".to_string())
    }

    fn new(kind: BlockKind, html: String) -> Self {
        Self {
            kind,
            html,
            tentative: false,
        }
    }

    pub(crate) fn into_tentative(mut self) -> Self {
        self.tentative = true;
        self
    }
}

fn split_cells(row: &str) -> Vec<String> {
    let row = row.trim();
    let row = row.strip_prefix('|').unwrap_or(row);
    let row = row.strip_suffix('|').unwrap_or(row);
    row.split('|').map(|c| c.trim().to_string()).collect()
}

pub(crate) fn is_separator_row(row: &str) -> bool {
    let cells = split_cells(row);
    !cells.is_empty()
        && cells.iter().all(|c| {
            !c.is_empty() && c.contains('-') && c.chars().all(|ch| matches!(ch, '-' | ':'))
        })
}

/// Concatenate block HTML, one block per line.
pub fn to_html(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|b| b.html.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
