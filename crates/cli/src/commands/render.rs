//! Render command handler.
//!
//! Replays an NDJSON event log through the progressive Markdown reconciler.

use crate::output::{EventSink, MarkdownSink};
use anyhow::Context;
use clap::Args;
use sift_pipeline::PipelineEvent;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

/// Render a saved NDJSON event log
#[derive(Args, Debug)]
pub struct RenderCommand {
    /// Event log to read (default: stdin)
    pub file: Option<PathBuf>,

    /// Write each render update as JSON, tentative blocks included
    #[arg(long)]
    pub updates: bool,
}

impl RenderCommand {
    pub fn execute(&self) -> anyhow::Result<()> {
        tracing::info!("Executing render command");

        let input: Box<dyn Read> = match self.file {
            Some(ref path) => Box::new(
                std::fs::File::open(path)
                    .with_context(|| format!("Failed to open event log {:?}", path))?,
            ),
            None => Box::new(std::io::stdin()),
        };

        let mut sink = MarkdownSink::new(std::io::stdout(), self.updates);
        replay(BufReader::new(input), &mut sink)
    }
}

/// Feed every event in `input` to `sink`, stopping after the terminal one.
pub fn replay(input: impl BufRead, sink: &mut dyn EventSink) -> anyhow::Result<()> {
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        let event = PipelineEvent::parse_line(&line)
            .with_context(|| format!("Malformed event on line {}", number + 1))?;
        if let Some(event) = event {
            sink.handle(&event)?;
            if event.is_terminal() {
                break;
            }
        }
    }
    sink.finish()
}
