//! Client-side progressive Markdown rendering for sift's token stream.
//!
//! [`Reconciler`] turns `token` events into HTML blocks while the answer is
//! still being generated. Finalized blocks never change; the tentative tail
//! is re-rendered on every push and finalized by [`Reconciler::flush`] when
//! the `complete` event arrives.

pub mod block;
pub mod inline;
pub mod parser;
pub mod reconciler;

pub use block::{to_html, Block, BlockKind};
pub use parser::parse_document;
pub use reconciler::{Reconciler, RenderUpdate};
