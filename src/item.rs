//! Per-resource download item
//!
//! A [`DownloadItem`] is the shared state object for one logical fetched
//! resource: its lifecycle status, byte counters and received header live
//! behind a lock so a monitoring thread can read progress while the engine
//! writes. The engine is the only writer; everything it learns from the
//! wire flows in through `store_header` / `store_data` / `fail`, and the
//! attached [`ItemSink`] decides what actually happens to the bytes.

use crate::error::FailureReason;
use crate::http::ResponseHead;
use parking_lot::Mutex;
use std::sync::Arc;

/// Lifecycle states of an item.
///
/// Transitions only move forward; the single exception is [`DownloadItem::setup`],
/// which re-enters `Inited` from a terminal state for object reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Created, not yet initialized
    Fresh,
    /// Counters reset, ready for a job
    Inited,
    /// Response header accepted
    HeaderReceived,
    /// Body bytes flowing
    Streaming,
    /// End-of-body seen, all data delivered
    Complete,
    /// Terminal failure; see [`DownloadItem::failure_reason`]
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Decision returned by the header hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkVerdict {
    /// Proceed with the body
    #[default]
    Continue,
    /// Unacceptable response (content type, policy); stop before the body
    Abort,
    /// Local failure while handling the header
    Error,
}

/// The polymorphic part of an item: what happens to header and bytes.
///
/// All hooks report trouble by return value; nothing here may panic across
/// the engine boundary.
pub trait ItemSink: Send {
    /// Called once per job when a terminal 2xx header arrives. Redirect
    /// hops do not reach this hook.
    fn on_header(
        &mut self,
        head: &ResponseHead,
        size_hint: Option<u64>,
        content_range: Option<&str>,
        fresh: bool,
    ) -> SinkVerdict;

    /// Body bytes in stream order, no gaps, no overlaps. An empty slice is
    /// the end-of-body signal. Returning `false` signals a sink-side write
    /// failure and fails the job without retry.
    fn on_data(&mut self, data: &[u8]) -> bool;

    /// Item-as-source hook for upload-style jobs. Not exercised by the
    /// download path; kept so sinks stay drop-in replacements for the full
    /// contract.
    fn send_data(&mut self, _buf: &mut dyn std::io::Write, _limit: usize) -> std::io::Result<usize> {
        Ok(0)
    }
}

struct ItemInner {
    status: ItemStatus,
    /// Bytes delivered to the sink
    size_checked: u64,
    /// Bytes known to exist upstream (size hint, content range)
    size_seen: u64,
    head: Option<ResponseHead>,
    reason: Option<FailureReason>,
    store_allowed: bool,
}

/// Shared per-resource state object driven by the engine
pub struct DownloadItem {
    inner: Mutex<ItemInner>,
    sink: Mutex<Box<dyn ItemSink>>,
}

impl DownloadItem {
    pub fn new(sink: Box<dyn ItemSink>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ItemInner {
                status: ItemStatus::Fresh,
                size_checked: 0,
                size_seen: 0,
                head: None,
                reason: None,
                store_allowed: true,
            }),
            sink: Mutex::new(sink),
        })
    }

    /// Reset counters and (re-)enter `Inited`. The only transition allowed
    /// out of a terminal state; used when an item object is reused for a
    /// fresh job.
    pub fn setup(&self) -> ItemStatus {
        let mut inner = self.inner.lock();
        inner.size_checked = 0;
        inner.size_seen = 0;
        inner.head = None;
        inner.reason = None;
        inner.status = ItemStatus::Inited;
        inner.status
    }

    pub fn status(&self) -> ItemStatus {
        self.inner.lock().status
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.inner.lock().reason
    }

    /// Bytes delivered to the sink so far (includes a resume offset once
    /// a ranged response was accepted)
    pub fn bytes_checked(&self) -> u64 {
        self.inner.lock().size_checked
    }

    /// Total size the upstream reported, when known
    pub fn bytes_seen(&self) -> u64 {
        self.inner.lock().size_seen
    }

    /// The response header of the last terminal response, for callers that
    /// map the HTTP status themselves after the run
    pub fn head(&self) -> Option<ResponseHead> {
        self.inner.lock().head.clone()
    }

    /// Forbid/permit handing body bytes to the sink. Items that only care
    /// about headers (probe jobs) clear this.
    pub fn set_store_allowed(&self, allowed: bool) {
        self.inner.lock().store_allowed = allowed;
    }

    /// Engine hook: a terminal response header arrived.
    ///
    /// `resume_from` seeds the delivered-byte counter when the upstream
    /// honored a range request. Returns the sink's verdict; on anything
    /// but `Continue` the engine terminates the job.
    pub(crate) fn store_header(
        &self,
        head: ResponseHead,
        size_hint: Option<u64>,
        content_range: Option<&str>,
        fresh: bool,
        resume_from: u64,
    ) -> SinkVerdict {
        {
            let mut inner = self.inner.lock();
            if inner.status.is_terminal() {
                return SinkVerdict::Error;
            }
            inner.head = Some(head.clone());
            inner.size_checked = resume_from;
            if let Some(total) = size_hint {
                inner.size_seen = total;
            }
            inner.status = ItemStatus::HeaderReceived;
        }
        // Sink runs outside the state lock so progress readers never wait
        // on user code.
        self.sink
            .lock()
            .on_header(&head, size_hint, content_range, fresh)
    }

    /// Record the header of a terminal non-2xx response without opening
    /// the body path, so callers can inspect the status afterwards.
    pub(crate) fn note_header(&self, head: ResponseHead) {
        let mut inner = self.inner.lock();
        if !inner.status.is_terminal() {
            inner.head = Some(head);
        }
    }

    /// Engine hook: body bytes in stream order. An empty slice completes
    /// the item. Returns `false` on sink failure.
    pub(crate) fn store_data(&self, data: &[u8]) -> bool {
        {
            let mut inner = self.inner.lock();
            match inner.status {
                ItemStatus::HeaderReceived | ItemStatus::Streaming => {}
                // No body bytes are accepted once terminal
                _ => return false,
            }
            if data.is_empty() {
                inner.status = ItemStatus::Complete;
            } else {
                inner.status = ItemStatus::Streaming;
                inner.size_checked += data.len() as u64;
            }
            if !inner.store_allowed && !data.is_empty() {
                return true;
            }
        }
        self.sink.lock().on_data(data)
    }

    /// Engine hook: terminal failure with a reason code. Keeps the first
    /// terminal state if one was already reached.
    pub(crate) fn fail(&self, reason: FailureReason) {
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return;
        }
        inner.status = ItemStatus::Failed;
        inner.reason = Some(reason);
    }
}

impl std::fmt::Debug for DownloadItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DownloadItem")
            .field("status", &inner.status)
            .field("size_checked", &inner.size_checked)
            .field("size_seen", &inner.size_seen)
            .field("reason", &inner.reason)
            .finish()
    }
}

/// Supplies concrete items; decouples the engine from what happens to the
/// bytes.
pub trait ItemFactory: Send + Sync {
    fn create(&self) -> Arc<DownloadItem>;
}
