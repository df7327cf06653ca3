//! Bundled item sinks and factories
//!
//! The engine never knows what happens to the bytes; these are the stock
//! destinations: raw pass-through to a writer (the `curl`-style fetch),
//! a control-line scanner for the maintenance report protocol, and an
//! in-memory capture used by tests.

use crate::http::ResponseHead;
use crate::item::{DownloadItem, ItemFactory, ItemSink, SinkVerdict};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

/// Pass every body byte straight to a writer
pub struct WriteSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> WriteSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> ItemSink for WriteSink<W> {
    fn on_header(
        &mut self,
        _head: &ResponseHead,
        _size_hint: Option<u64>,
        _content_range: Option<&str>,
        _fresh: bool,
    ) -> SinkVerdict {
        SinkVerdict::Continue
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return self.out.flush().is_ok();
        }
        self.out.write_all(data).is_ok()
    }
}

/// Factory for print-to-stdout items
pub struct PrintItemFactory;

impl ItemFactory for PrintItemFactory {
    fn create(&self) -> Arc<DownloadItem> {
        DownloadItem::new(Box::new(WriteSink::new(std::io::stdout())))
    }
}

/// Classes of control lines the maintenance endpoint emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlLineKind {
    /// Context collected ahead of a potential error
    BeforeError = 1,
    /// Error: flush collected context and the message itself
    Error = 2,
}

impl ControlLineKind {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::BeforeError),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Scans a line-oriented control protocol out of the body stream.
///
/// Lines tagged `<marker><code> message` are interpreted; everything else
/// passes by. `BeforeError` lines are buffered and only surface when an
/// `Error` line follows. Partial lines are kept across calls, since body
/// chunks split at arbitrary byte boundaries.
pub struct ControlLineSink {
    marker: String,
    line_buf: Vec<u8>,
    pending: Vec<String>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl ControlLineSink {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            line_buf: Vec::new(),
            pending: Vec::new(),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the collected error messages, shared with the caller
    pub fn errors(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.errors)
    }

    fn scan_line(&mut self, line: &str) {
        let Some(rest) = line.strip_prefix(self.marker.as_str()) else {
            return;
        };
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let Ok(code) = digits.parse::<u32>() else {
            return;
        };
        let message = rest[digits.len()..].trim().to_string();
        match ControlLineKind::from_code(code) {
            Some(ControlLineKind::BeforeError) => self.pending.push(message),
            Some(ControlLineKind::Error) => {
                let mut errors = self.errors.lock();
                errors.append(&mut self.pending);
                errors.push(message);
            }
            None => {}
        }
    }
}

impl ItemSink for ControlLineSink {
    fn on_header(
        &mut self,
        _head: &ResponseHead,
        _size_hint: Option<u64>,
        _content_range: Option<&str>,
        _fresh: bool,
    ) -> SinkVerdict {
        SinkVerdict::Continue
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            // Flush a trailing unterminated line
            if !self.line_buf.is_empty() {
                let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                self.scan_line(&line);
                self.line_buf.clear();
            }
            return true;
        }
        for &byte in data {
            if byte == b'\n' || byte == b'\r' {
                if !self.line_buf.is_empty() {
                    let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                    self.scan_line(&line);
                    self.line_buf.clear();
                }
            } else {
                self.line_buf.push(byte);
            }
        }
        true
    }
}

/// Factory for maintenance-report scanner items
pub struct ReportItemFactory {
    marker: String,
}

impl ReportItemFactory {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl ItemFactory for ReportItemFactory {
    fn create(&self) -> Arc<DownloadItem> {
        DownloadItem::new(Box::new(ControlLineSink::new(self.marker.clone())))
    }
}

/// Collects the body into a shared buffer; test tooling
#[derive(Default)]
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
    /// Number of `on_data` calls seen, including the final empty one
    calls: Arc<Mutex<Vec<usize>>>,
    /// When set, `on_data` reports failure (sink-error injection)
    pub fail_writes: bool,
    /// Verdict returned from the header hook
    pub header_verdict: SinkVerdict,
}

impl MemorySink {
    pub fn shared(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buf)
    }

    pub fn call_sizes(&self) -> Arc<Mutex<Vec<usize>>> {
        Arc::clone(&self.calls)
    }
}

impl ItemSink for MemorySink {
    fn on_header(
        &mut self,
        _head: &ResponseHead,
        _size_hint: Option<u64>,
        _content_range: Option<&str>,
        _fresh: bool,
    ) -> SinkVerdict {
        self.header_verdict
    }

    fn on_data(&mut self, data: &[u8]) -> bool {
        if self.fail_writes {
            return false;
        }
        self.calls.lock().push(data.len());
        self.buf.lock().extend_from_slice(data);
        true
    }
}
