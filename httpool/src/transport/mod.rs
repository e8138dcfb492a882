//! Transport engine adapter.
//!
//! [`Transport`] owns the [`TransportEngine`] and every in-flight
//! [`RequestHandle`]. It hands requests to the engine, forwards readiness
//! and timer ticks to it, and pairs the engine's completion messages with
//! their handles.
//!
//! Completion is message based: readiness on a socket never implies that a
//! transfer finished. Completions are drained after every drive call because
//! one call can finish several transfers.

mod engine;
mod request;

#[cfg(feature = "curl")]
pub mod curl;

pub use engine::{Completion, EngineRequest, TransferReport, TransportEngine};
pub use request::{LOW_SPEED_LIMIT, LOW_SPEED_TIME, MAX_REDIRECTS, Method, Request, RequestOptions};

use crate::error::{DriveError, SubmitError};
use crate::handle::{Callback, HandleId, RequestHandle};
use crate::reactor::{Readiness, SourceToken};

use std::collections::HashMap;
use std::os::fd::RawFd;
use tracing::{debug, warn};

/// The adapter between the pool and its transport engine.
pub struct Transport<E, U> {
    engine: E,
    in_flight: HashMap<HandleId, RequestHandle<U>>,
    next_id: u64,

    /// Forces verbose transfers on every request.
    verbose: bool,
}

impl<E: TransportEngine, U> Transport<E, U> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            in_flight: HashMap::new(),
            next_id: 1,
            verbose: false,
        }
    }

    pub(crate) fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Number of requests handed to the engine and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: HandleId) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Starts an asynchronous transfer.
    ///
    /// The request is validated before the engine sees it; on error nothing
    /// is left in flight.
    pub fn submit(
        &mut self,
        request: Request,
        user_data: U,
        callback: Callback<U>,
    ) -> Result<HandleId, SubmitError> {
        let (id, request) = self.prepare(request)?;

        self.engine.add(id, &request)?;
        debug!(%id, url = %request.url, method = ?request.method, "request submitted");

        self.in_flight
            .insert(id, RequestHandle::new(id, request.url, user_data, callback));
        Ok(id)
    }

    /// Runs a transfer to completion before returning.
    ///
    /// The handle is never in flight; the caller dispatches it with the
    /// returned report.
    pub fn perform(
        &mut self,
        request: Request,
        user_data: U,
        callback: Callback<U>,
    ) -> Result<(RequestHandle<U>, TransferReport), SubmitError> {
        let (id, request) = self.prepare(request)?;

        debug!(%id, url = %request.url, method = ?request.method, "blocking transfer");
        let report = self.engine.perform(id, &request);

        Ok((RequestHandle::new(id, request.url, user_data, callback), report))
    }

    /// Forwards readiness observed on `fd` to the engine.
    pub fn drive_socket(&mut self, fd: RawFd, readiness: Readiness) -> Result<(), DriveError> {
        self.engine.drive_socket(fd, readiness)
    }

    /// Forwards a timer expiry to the engine.
    pub fn drive_timer(&mut self) -> Result<(), DriveError> {
        self.engine.drive_timeout()
    }

    /// Drains the engine's completion messages.
    ///
    /// Each item is a handle taken out of the in-flight table together with
    /// the engine's report. Completions for unknown handles are logged and
    /// skipped, so a handle is yielded at most once.
    pub fn drain_completions(&mut self) -> Drain<'_, E, U> {
        Drain { transport: self }
    }

    /// Takes a handle out of flight and withdraws it from the engine.
    pub(crate) fn withdraw(&mut self, id: HandleId) -> Option<RequestHandle<U>> {
        let handle = self.in_flight.remove(&id)?;

        if let Err(e) = self.engine.remove(id) {
            warn!(%id, error = %e, "engine refused to withdraw request");
        }

        Some(handle)
    }

    /// Identifiers of every in-flight request, in submission order.
    pub(crate) fn in_flight_ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.in_flight.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn take_requests(&mut self, requests: &mut Vec<EngineRequest>) {
        self.engine.take_requests(requests);
    }

    pub(crate) fn assign(&mut self, fd: RawFd, token: SourceToken) -> Result<(), DriveError> {
        self.engine.assign(fd, token)
    }

    fn prepare(&mut self, mut request: Request) -> Result<(HandleId, Request), SubmitError> {
        request.validate()?;
        request.options.verbose |= self.verbose;

        let id = HandleId(self.next_id);
        self.next_id += 1;

        Ok((id, request))
    }
}

/// Iterator returned by [`Transport::drain_completions`].
pub struct Drain<'a, E, U> {
    transport: &'a mut Transport<E, U>,
}

impl<E: TransportEngine, U> Iterator for Drain<'_, E, U> {
    type Item = (RequestHandle<U>, TransferReport);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Completion { id, report } = self.transport.engine.next_completion()?;

            match self.transport.in_flight.remove(&id) {
                Some(handle) => return Some((handle, report)),
                None => warn!(%id, "completion for a request that is not in flight"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Disposal;

    use std::collections::VecDeque;

    #[derive(Default)]
    struct QueueEngine {
        added: Vec<HandleId>,
        removed: Vec<HandleId>,
        completions: VecDeque<Completion>,
    }

    impl TransportEngine for QueueEngine {
        fn add(&mut self, id: HandleId, _request: &Request) -> Result<(), SubmitError> {
            self.added.push(id);
            Ok(())
        }

        fn perform(&mut self, _id: HandleId, request: &Request) -> TransferReport {
            TransferReport {
                status: 200,
                body: request.url.clone().into_bytes(),
                ..TransferReport::default()
            }
        }

        fn drive_socket(&mut self, _fd: RawFd, _readiness: Readiness) -> Result<(), DriveError> {
            Ok(())
        }

        fn drive_timeout(&mut self) -> Result<(), DriveError> {
            Ok(())
        }

        fn next_completion(&mut self) -> Option<Completion> {
            self.completions.pop_front()
        }

        fn remove(&mut self, id: HandleId) -> Result<(), DriveError> {
            self.removed.push(id);
            Ok(())
        }

        fn assign(&mut self, _fd: RawFd, _token: SourceToken) -> Result<(), DriveError> {
            Ok(())
        }

        fn take_requests(&mut self, _requests: &mut Vec<EngineRequest>) {}
    }

    fn free() -> Callback<()> {
        Box::new(|_| Disposal::Free)
    }

    fn done(id: HandleId) -> Completion {
        Completion {
            id,
            report: TransferReport {
                status: 200,
                ..TransferReport::default()
            },
        }
    }

    #[test]
    fn ids_are_assigned_in_submission_order() {
        let mut transport = Transport::new(QueueEngine::default());

        let a = transport.submit(Request::get("http://a/"), (), free()).unwrap();
        let b = transport.submit(Request::get("http://b/"), (), free()).unwrap();

        assert!(a < b);
        assert_eq!(transport.engine().added, vec![a, b]);
        assert_eq!(transport.in_flight_ids(), vec![a, b]);
    }

    #[test]
    fn invalid_url_never_reaches_the_engine() {
        let mut transport = Transport::new(QueueEngine::default());

        assert!(transport.submit(Request::get("http://a b/"), (), free()).is_err());
        assert!(transport.engine().added.is_empty());
        assert_eq!(transport.in_flight(), 0);
    }

    #[test]
    fn drain_yields_each_handle_once() {
        let mut transport = Transport::new(QueueEngine::default());
        let id = transport.submit(Request::get("http://a/"), (), free()).unwrap();

        transport.engine_mut().completions.extend([done(id), done(id)]);

        let drained: Vec<_> = transport.drain_completions().map(|(h, _)| h.id()).collect();
        assert_eq!(drained, vec![id]);
        assert!(!transport.is_in_flight(id));
    }

    #[test]
    fn withdraw_removes_from_engine() {
        let mut transport = Transport::new(QueueEngine::default());
        let id = transport.submit(Request::get("http://a/"), (), free()).unwrap();

        assert!(transport.withdraw(id).is_some());
        assert!(transport.withdraw(id).is_none());
        assert_eq!(transport.engine().removed, vec![id]);
    }

    #[test]
    fn blocking_transfer_is_not_in_flight() {
        let mut transport = Transport::new(QueueEngine::default());

        let (handle, report) = transport
            .perform(Request::get("http://a/"), (), free())
            .unwrap();

        assert_eq!(report.body, b"http://a/");
        assert_eq!(handle.url(), "http://a/");
        assert_eq!(transport.in_flight(), 0);
    }
}
