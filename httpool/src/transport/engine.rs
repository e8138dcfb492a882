use super::Request;
use crate::error::{DriveError, SubmitError};
use crate::handle::HandleId;
use crate::reactor::{Readiness, SocketAction, SourceToken, TimerRequest};

use std::os::fd::RawFd;

/// What the engine reports about a finished transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// HTTP status, `0` when none was received.
    pub status: i64,

    /// Downloaded byte count.
    pub length: u64,

    pub content_type: Option<String>,

    /// Response body bytes not yet handed to the handle.
    pub body: Vec<u8>,

    /// Response header bytes not yet handed to the handle.
    pub headers: Vec<u8>,

    /// Engine error text, set when the transfer failed.
    pub error: Option<String>,
}

/// A completion message: the transfer of `id` is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: HandleId,
    pub report: TransferReport,
}

/// A readiness-interest change the engine wants applied to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineRequest {
    Socket {
        fd: RawFd,
        action: SocketAction,

        /// Token previously assigned to this socket, if any.
        token: Option<SourceToken>,
    },
    Timer(TimerRequest),
}

/// A non-blocking, multi-request HTTP engine driven by socket readiness and
/// a timer.
///
/// The engine never talks to the event loop itself. It queues the interest
/// changes it wants as [`EngineRequest`]s, which the pool collects with
/// [`take_requests`](TransportEngine::take_requests) after every call and
/// applies to the reactor. Finished transfers are reported as
/// [`Completion`]s, one per request.
pub trait TransportEngine {
    /// Starts an asynchronous transfer for `request`.
    fn add(&mut self, id: HandleId, request: &Request) -> Result<(), SubmitError>;

    /// Runs `request` to completion, blocking the caller.
    ///
    /// Failures are reported in the returned [`TransferReport`].
    fn perform(&mut self, id: HandleId, request: &Request) -> TransferReport;

    /// Advances the transfers using `fd` after `readiness` was observed.
    fn drive_socket(&mut self, fd: RawFd, readiness: Readiness) -> Result<(), DriveError>;

    /// Advances the transfers after the engine timer expired.
    fn drive_timeout(&mut self) -> Result<(), DriveError>;

    /// Pops the next completion message, if any.
    fn next_completion(&mut self) -> Option<Completion>;

    /// Withdraws an in-flight transfer. Its completion is never reported.
    fn remove(&mut self, id: HandleId) -> Result<(), DriveError>;

    /// Stores the reactor token for `fd`, handed back with the socket's
    /// next [`EngineRequest::Socket`].
    fn assign(&mut self, fd: RawFd, token: SourceToken) -> Result<(), DriveError>;

    /// Moves the queued interest changes into `requests`, oldest first.
    fn take_requests(&mut self, requests: &mut Vec<EngineRequest>);
}
