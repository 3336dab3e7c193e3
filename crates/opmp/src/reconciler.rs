//! Progressive rendering of a streamed Markdown answer.
//!
//! Tokens are appended to a buffer. Everything before the cursor is
//! finalized and never rendered again; only the suffix after it is parsed on
//! each push. Whatever the suffix cannot finalize yet is rendered as the
//! tentative tail, with open constructs closed synthetically.

use crate::block::{to_html, Block};
use crate::parser::parse_blocks;
use serde::Serialize;

/// What changed after a push or flush.
///
/// A UI appends `finalized` and replaces its previous tentative tail with
/// `tentative`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderUpdate {
    pub finalized: Vec<Block>,
    pub tentative: Vec<Block>,
}

impl RenderUpdate {
    pub fn is_empty(&self) -> bool {
        self.finalized.is_empty() && self.tentative.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    buffer: String,
    cursor: usize,
    finalized: Vec<Block>,
    tentative: Vec<Block>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token and re-render the unparsed suffix.
    pub fn push(&mut self, token: &str) -> RenderUpdate {
        self.buffer.push_str(token);

        let (blocks, consumed) = parse_blocks(&self.buffer[self.cursor..], false);
        self.cursor += consumed;
        self.finalized.extend(blocks.iter().cloned());

        let (tail, _) = parse_blocks(&self.buffer[self.cursor..], true);
        self.tentative = tail.into_iter().map(Block::into_tentative).collect();

        if !blocks.is_empty() {
            tracing::trace!(finalized = blocks.len(), cursor = self.cursor, "blocks finalized");
        }

        RenderUpdate {
            finalized: blocks,
            tentative: self.tentative.clone(),
        }
    }

    /// The stream is over: finalize the tentative tail as it stands.
    pub fn flush(&mut self) -> RenderUpdate {
        let (blocks, consumed) = parse_blocks(&self.buffer[self.cursor..], true);
        self.cursor += consumed;
        self.finalized.extend(blocks.iter().cloned());
        self.tentative.clear();

        RenderUpdate {
            finalized: blocks,
            tentative: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Byte offset up to which the buffer is finalized.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn finalized(&self) -> &[Block] {
        &self.finalized
    }

    pub fn tentative(&self) -> &[Block] {
        &self.tentative
    }

    /// Finalized blocks followed by the tentative tail.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.finalized.iter().chain(self.tentative.iter())
    }

    /// Current render as HTML.
    pub fn to_html(&self) -> String {
        let blocks: Vec<Block> = self.blocks().cloned().collect();
        to_html(&blocks)
    }
}
