//! Writers for the pipeline event stream.

use anyhow::bail;
use clap::ValueEnum;
use sift_opmp::{Reconciler, RenderUpdate};
use sift_pipeline::PipelineEvent;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON event per line
    Ndjson,
    /// Rendered blocks as they are finalized
    Markdown,
}

/// Consumes events in stream order.
pub trait EventSink {
    fn handle(&mut self, event: &PipelineEvent) -> anyhow::Result<()>;

    /// Called once the stream has ended.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn sink_for<W: Write + 'static>(format: OutputFormat, out: W) -> Box<dyn EventSink> {
    match format {
        OutputFormat::Ndjson => Box::new(NdjsonSink::new(out)),
        OutputFormat::Markdown => Box::new(MarkdownSink::new(out, false)),
    }
}

/// Passes events through as NDJSON.
pub struct NdjsonSink<W: Write> {
    out: W,
}

impl<W: Write> NdjsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for NdjsonSink<W> {
    fn handle(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        self.out.write_all(event.to_ndjson_line()?.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}

/// Feeds token events through a [`Reconciler`] and writes each block's HTML
/// once it is final. With `updates` set, every non-empty [`RenderUpdate`]
/// is written as a JSON line instead, tentative tail included.
pub struct MarkdownSink<W: Write> {
    out: W,
    reconciler: Reconciler,
    updates: bool,
    terminal: Option<Result<(), String>>,
}

impl<W: Write> MarkdownSink<W> {
    pub fn new(out: W, updates: bool) -> Self {
        Self {
            out,
            reconciler: Reconciler::new(),
            updates,
            terminal: None,
        }
    }

    fn write_update(&mut self, update: &RenderUpdate) -> anyhow::Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        if self.updates {
            writeln!(self.out, "{}", serde_json::to_string(update)?)?;
        } else {
            for block in &update.finalized {
                writeln!(self.out, "{}", block.html)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> EventSink for MarkdownSink<W> {
    fn handle(&mut self, event: &PipelineEvent) -> anyhow::Result<()> {
        match event {
            PipelineEvent::Progress {
                phase,
                message,
                progress,
            } => {
                tracing::info!(phase, progress, "{}", message);
            }
            PipelineEvent::PhaseResult { phase, data, .. } => {
                tracing::debug!(phase, "phase result: {}", data);
            }
            PipelineEvent::Token { token, .. } => {
                let update = self.reconciler.push(token);
                self.write_update(&update)?;
            }
            PipelineEvent::Complete { data, .. } => {
                // A stream without tokens still shows the final answer
                if self.reconciler.buffer().is_empty() {
                    self.reconciler.push(&data.text);
                }
                let update = self.reconciler.flush();
                self.write_update(&update)?;
                for warning in &data.quality.warnings {
                    tracing::warn!("quality: {}", warning);
                }
                tracing::info!(score = data.quality.score, "answer complete");
                self.terminal = Some(Ok(()));
            }
            PipelineEvent::Error { message, phase, .. } => {
                let update = self.reconciler.flush();
                self.write_update(&update)?;
                tracing::error!(phase = ?phase, "{}", message);
                self.terminal = Some(Err(message.clone()));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        match self.terminal.take() {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => bail!("pipeline failed: {}", message),
            None => {
                let update = self.reconciler.flush();
                self.write_update(&update)?;
                bail!("event stream ended without complete or error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_pipeline::{Quality, ResponsePackage};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn token(text: &str) -> PipelineEvent {
        PipelineEvent::Token {
            token: text.to_string(),
            phase: 4,
        }
    }

    fn complete(text: &str) -> PipelineEvent {
        PipelineEvent::Complete {
            phase: 5,
            data: ResponsePackage {
                text: text.to_string(),
                metadata: BTreeMap::new(),
                citations: Vec::new(),
                quality: Quality {
                    score: 1.0,
                    warnings: Vec::new(),
                },
            },
            progress: 100,
        }
    }

    #[test]
    fn test_markdown_sink_writes_blocks_as_they_finalize() {
        let buf = SharedBuf::default();
        let mut sink = MarkdownSink::new(buf.clone(), false);

        sink.handle(&token("## Hea")).unwrap();
        sink.handle(&token("der\n\nBody **bo")).unwrap();
        assert_eq!(buf.text(), "<h2>Header</h2>\n");

        sink.handle(&token("ld**")).unwrap();
        sink.handle(&complete("## Header\n\nBody **bold**")).unwrap();
        sink.finish().unwrap();
        assert_eq!(
            buf.text(),
            "<h2>Header</h2>\n<p>Body <strong>bold</strong></p>\n"
        );
    }

    #[test]
    fn test_markdown_sink_renders_response_without_tokens() {
        let buf = SharedBuf::default();
        let mut sink = MarkdownSink::new(buf.clone(), false);
        sink.handle(&complete("Cached answer")).unwrap();
        sink.finish().unwrap();
        assert_eq!(buf.text(), "<p>Cached answer</p>\n");
    }

    #[test]
    fn test_markdown_sink_update_lines_include_tentative_tail() {
        let buf = SharedBuf::default();
        let mut sink = MarkdownSink::new(buf.clone(), true);
        sink.handle(&token("| A |")).unwrap();

        let line: serde_json::Value = serde_json::from_str(buf.text().trim()).unwrap();
        assert_eq!(line["finalized"], serde_json::json!([]));
        assert_eq!(line["tentative"][0]["kind"], "table");
        assert_eq!(line["tentative"][0]["tentative"], true);
    }

    #[test]
    fn test_markdown_sink_error_fails_finish() {
        let buf = SharedBuf::default();
        let mut sink = MarkdownSink::new(buf.clone(), false);
        sink.handle(&token("Partial")).unwrap();
        sink.handle(&PipelineEvent::Error {
            message: "phase2 failed: no data".to_string(),
            phase: Some(2),
            partial: true,
            phase_timings: BTreeMap::new(),
        })
        .unwrap();

        assert_eq!(buf.text(), "<p>Partial</p>\n");
        let err = sink.finish().unwrap_err();
        assert!(err.to_string().contains("no data"));
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut sink = MarkdownSink::new(SharedBuf::default(), false);
        sink.handle(&token("text")).unwrap();
        assert!(sink.finish().is_err());
    }

    #[test]
    fn test_ndjson_sink_writes_one_line_per_event() {
        let buf = SharedBuf::default();
        let mut sink = NdjsonSink::new(buf.clone());
        sink.handle(&token("a")).unwrap();
        sink.handle(&token("b")).unwrap();

        let lines: Vec<String> = buf.text().lines().map(String::from).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            PipelineEvent::parse_line(&lines[1]).unwrap(),
            Some(token("b"))
        );
    }
}
