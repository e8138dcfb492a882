//! Request handles.
//!
//! A [`RequestHandle`] is the pool-side state of one HTTP request: the
//! response buffers filled by the transport engine, the completion metadata
//! and the caller's data and callback.

use crate::error::TransferError;
use crate::transport::TransferReport;

use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, Instant};

/// Status of a handle whose completion has not been observed yet.
pub const STATUS_PENDING: i64 = 0;

/// Status of a handle whose transfer never completed.
///
/// Set when the engine reports a transport failure without an HTTP status,
/// when a drive error breaks the transfer, or when the request is cancelled.
pub const STATUS_ABORTED: i64 = -1;

/// Pool-unique identifier of a submitted request.
///
/// Identifiers are assigned in submission order and never reused by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the dispatcher does with a handle once its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Drop the handle and its buffers.
    Free,

    /// Move the handle to the pool's retained table; the caller reclaims it
    /// with [`Pool::reclaim`](crate::Pool::reclaim).
    Keep,
}

/// Per-request completion callback.
///
/// Invoked exactly once, either inline from `submit` (blocking mode) or from
/// `run_once` (asynchronous mode).
pub type Callback<U> = Box<dyn FnOnce(&mut RequestHandle<U>) -> Disposal>;

/// One submitted HTTP request.
pub struct RequestHandle<U> {
    id: HandleId,
    url: String,
    body: Vec<u8>,
    headers: Vec<u8>,
    status: i64,
    length: u64,
    content_type: Option<String>,
    error: Option<String>,
    started: Instant,
    stopped: Option<Instant>,
    elapsed_ms: u64,
    user_data: U,
    callback: Option<Callback<U>>,
}

impl<U> RequestHandle<U> {
    pub(crate) fn new(id: HandleId, url: String, user_data: U, callback: Callback<U>) -> Self {
        Self {
            id,
            url,
            body: Vec::new(),
            headers: Vec::new(),
            status: STATUS_PENDING,
            length: 0,
            content_type: None,
            error: None,
            started: Instant::now(),
            stopped: None,
            elapsed_ms: 0,
            user_data,
            callback: Some(callback),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Response body received so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Response body decoded as UTF-8, replacing invalid sequences.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Raw response header lines, as received.
    pub fn headers(&self) -> &[u8] {
        &self.headers
    }

    /// HTTP status code.
    ///
    /// [`STATUS_PENDING`] until completion, [`STATUS_ABORTED`] when the
    /// transfer never completed.
    pub fn status(&self) -> i64 {
        self.status
    }

    /// Downloaded byte count as reported by the engine.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Engine error text for failed transfers.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn stopped(&self) -> Option<Instant> {
        self.stopped
    }

    /// Milliseconds between submission and completion.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn user_data(&self) -> &U {
        &self.user_data
    }

    pub fn user_data_mut(&mut self) -> &mut U {
        &mut self.user_data
    }

    /// Returns `true` once the completion has been observed.
    pub fn is_complete(&self) -> bool {
        self.stopped.is_some()
    }

    /// Returns `true` for a completed request with a 2xx status.
    pub fn is_success(&self) -> bool {
        self.is_complete() && (200..300).contains(&self.status)
    }

    /// Describes why the request failed, if it did.
    ///
    /// Returns `None` while the request is pending or when it succeeded.
    pub fn transfer_error(&self) -> Option<TransferError> {
        if !self.is_complete() || self.is_success() {
            return None;
        }

        if self.status < 0 {
            let reason = self.error.clone().unwrap_or_else(|| "unknown".to_owned());
            Some(TransferError::Aborted(reason))
        } else {
            Some(TransferError::Status(self.status))
        }
    }

    /// Releases the handle, dropping its buffers, and returns the caller data.
    pub fn release(self) -> U {
        self.user_data
    }

    pub(crate) fn append_body(&mut self, data: &[u8]) {
        debug_assert!(!self.is_complete(), "body is frozen after completion");
        self.body.extend_from_slice(data);
    }

    pub(crate) fn append_headers(&mut self, data: &[u8]) {
        debug_assert!(!self.is_complete(), "headers are frozen after completion");
        self.headers.extend_from_slice(data);
    }

    /// Fills the completion fields from the engine's transfer report.
    pub(crate) fn complete(&mut self, report: TransferReport) {
        self.append_body(&report.body);
        self.append_headers(&report.headers);

        self.status = match (&report.error, report.status) {
            (Some(_), status) if status <= 0 => STATUS_ABORTED,
            (_, status) => status,
        };
        self.length = report.length;
        self.content_type = report.content_type;
        self.error = report.error;
        self.stamp_stop();
    }

    /// Marks the handle as never completed.
    pub(crate) fn abort(&mut self, reason: impl Into<String>) {
        self.status = STATUS_ABORTED;
        self.error = Some(reason.into());
        self.stamp_stop();
    }

    pub(crate) fn take_callback(&mut self) -> Option<Callback<U>> {
        self.callback.take()
    }

    fn stamp_stop(&mut self) {
        let stopped = Instant::now();
        self.elapsed_ms = stopped.saturating_duration_since(self.started).as_millis() as u64;
        self.stopped = Some(stopped);
    }
}

impl<U: fmt::Debug> fmt::Debug for RequestHandle<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("status", &self.status)
            .field("length", &self.length)
            .field("body_len", &self.body.len())
            .field("elapsed_ms", &self.elapsed_ms)
            .field("user_data", &self.user_data)
            .finish()
    }
}
