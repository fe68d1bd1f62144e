//! Console output for package processes.
//!
//! Holds the per-package ring buffer the TUI renders (`LogBuffer`), the
//! channel-backed sink the process manager writes into (`ChannelSink`) and
//! small helpers for cleaning up dev-server output.

use std::collections::VecDeque;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use strip_ansi_escapes::strip;
use tokio::sync::mpsc;

use crate::events::Event;
use crate::runner::OutputSink;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of log output from a process.
#[derive(Debug, Clone)]
pub struct LogLine {
    /// The content of the log line.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

/// Output sink that forwards a package's lines to the event loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<Event>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn clear(&self) {
        let _ = self
            .tx
            .send(Event::ConsoleCleared {
                name: self.name.clone(),
            })
            .await;
    }

    async fn line(&self, stream: StreamKind, text: String) {
        let _ = self
            .tx
            .send(Event::PackageOutput {
                name: self.name.clone(),
                line: text,
                stream,
            })
            .await;
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Finds the local address a dev server announces, e.g. `Local: http://localhost:3000/`.
pub fn detect_local_url(line: &str) -> Option<String> {
    static LOCAL_URL: OnceLock<Option<Regex>> = OnceLock::new();
    let regex = LOCAL_URL
        .get_or_init(|| {
            Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\])(?::\d+)?[^\s'\x22]*").ok()
        })
        .as_ref()?;
    let text = sanitize_text(line, true);
    regex
        .find(&text)
        .map(|found| found.as_str().trim_end_matches(['.', ',', ')']).to_string())
}
