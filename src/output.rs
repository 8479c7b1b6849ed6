//! Log line types and terminal formatting.
//!
//! This module defines the `LogLine` forwarded for every line a service prints,
//! and the `LinePrinter` used by the command-line runner to render those lines
//! with `[id]` prefixes.

use std::time::{Instant, SystemTime};

use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of output from a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// When the line was received.
    pub timestamp: SystemTime,
    /// The content of the line, without its line ending.
    pub text: String,
    /// The stream it originated from.
    pub stream: StreamKind,
}

impl LogLine {
    pub fn new(text: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            timestamp: SystemTime::now(),
            text: text.into(),
            stream,
        }
    }
}

/// Decodes one raw line read from a pipe, dropping the `\n` / `\r\n` ending.
///
/// Invalid UTF-8 sequences are replaced.
pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

const PREFIX_COLORS: [&str; 6] = ["36", "32", "33", "35", "34", "31"];

/// Formats service output and runner notices for a plain terminal.
#[derive(Debug, Clone)]
pub struct LinePrinter {
    strip_ansi: bool,
    timestamp: bool,
    colors: bool,
    width: usize,
    start: Instant,
}

impl LinePrinter {
    /// Creates a printer whose prefixes are padded to fit the longest id.
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let width = ids
            .into_iter()
            .map(|id| id.len() + 2)
            .max()
            .unwrap_or(0)
            .max(TOOL_PREFIX.len());
        Self {
            strip_ansi: false,
            timestamp: false,
            colors: true,
            width,
            start: Instant::now(),
        }
    }

    pub fn strip_ansi(mut self, strip_ansi: bool) -> Self {
        self.strip_ansi = strip_ansi;
        self
    }

    pub fn timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn colors(mut self, colors: bool) -> Self {
        self.colors = colors;
        self
    }

    /// Renders a line of service output. `index` selects the prefix colour.
    pub fn format_line(&self, id: &str, index: usize, line: &LogLine) -> String {
        let text = sanitize_text(&line.text, self.strip_ansi);
        let mut prefix = self.pad(format!("[{}]", id));
        if self.colors {
            prefix = apply_color(&prefix, PREFIX_COLORS[index % PREFIX_COLORS.len()]);
        }
        format!("{}{} {}", self.elapsed_prefix(), prefix, text)
    }

    /// Renders a runner notice about a service.
    pub fn format_notice(&self, id: &str, text: &str) -> String {
        self.format_message(&format!("{}: {}", id, text))
    }

    /// Renders a runner notice that is not about one service.
    pub fn format_message(&self, text: &str) -> String {
        let prefix = self.pad(TOOL_PREFIX.to_string());
        format!("{}{} {}", self.elapsed_prefix(), prefix, text)
    }

    fn pad(&self, mut prefix: String) -> String {
        if prefix.len() < self.width {
            prefix.push_str(&" ".repeat(self.width - prefix.len()));
        }
        prefix
    }

    fn elapsed_prefix(&self) -> String {
        if !self.timestamp {
            return String::new();
        }
        let secs = self.start.elapsed().as_secs();
        format!("{:02}:{:02} ", secs / 60, secs % 60)
    }
}

const TOOL_PREFIX: &str = "[stagehand]";

fn apply_color(prefix: &str, code: &str) -> String {
    format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
}
