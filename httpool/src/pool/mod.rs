//! Request pool.
//!
//! A [`Pool`] combines one transport engine with one event-loop backend and
//! counts the requests still waiting for their callback.
//!
//! A pool is driven by its caller:
//!
//! ```rust,ignore
//! let mut pool = Pool::new(engine, BackendKind::RawReactor, 0)?;
//!
//! pool.send_get("https://example.com/", (), |handle| {
//!     println!("{} -> {}", handle.url(), handle.status());
//!     Disposal::Free
//! })?;
//!
//! pool.run_until_idle(Duration::from_secs(1))?;
//! ```
//!
//! One `run_once` iteration waits for the backend, then for every wakeup
//! drives the engine, dispatches the completions it produced and applies
//! the interest changes it asked for. Callbacks receive the finished handle,
//! not the pool, so they never run while the pool is in an intermediate
//! state.

mod builder;

pub use builder::{ExecutionMode, PoolBuilder};

use crate::dispatch::{Dispatcher, Outcome};
use crate::error::{DriveError, Error, RegistrationError, RunError, SubmitError};
use crate::handle::{Disposal, HandleId, RequestHandle};
use crate::reactor::{BackendKind, Reactor, Wakeup};
use crate::transport::{EngineRequest, Request, Transport, TransportEngine};

use std::mem;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Reason recorded on handles cancelled by [`Pool::cancel_all`].
const CANCELLED: &str = "request cancelled";

/// An asynchronous HTTP request pool.
///
/// `U` is the caller data carried by every request.
pub struct Pool<E: TransportEngine, U = ()> {
    transport: Transport<E, U>,
    reactor: Box<dyn Reactor>,
    dispatcher: Dispatcher<U>,

    mode: ExecutionMode,
    verbosity: u8,
    poll_interval: Duration,

    /// Scratch buffers reused across iterations.
    requests: Vec<EngineRequest>,
    wakeups: Vec<Wakeup>,
}

impl<E: TransportEngine, U> Pool<E, U> {
    /// Returns a [`PoolBuilder`]. Name the engine type when calling it, as in
    /// `Pool::<CurlEngine, ()>::builder()`, or start from [`PoolBuilder::new`].
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Creates an asynchronous pool on `backend`.
    pub fn new(engine: E, backend: BackendKind, verbosity: u8) -> Result<Self, Error> {
        PoolBuilder::new()
            .backend(backend)
            .verbosity(verbosity)
            .build(engine)
    }

    pub(crate) fn from_parts(
        engine: E,
        reactor: Box<dyn Reactor>,
        mode: ExecutionMode,
        verbosity: u8,
        poll_interval: Duration,
    ) -> Self {
        let mut transport = Transport::new(engine);
        transport.set_verbose(verbosity > 2);

        debug!(backend = %reactor.kind(), ?mode, verbosity, "pool created");

        Self {
            transport,
            reactor,
            dispatcher: Dispatcher::new(),
            mode,
            verbosity,
            poll_interval,
            requests: Vec::new(),
            wakeups: Vec::new(),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.reactor.kind()
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The backend, for inspecting its registrations.
    pub fn reactor(&self) -> &dyn Reactor {
        self.reactor.as_ref()
    }

    pub fn engine(&self) -> &E {
        self.transport.engine()
    }

    pub fn engine_mut(&mut self) -> &mut E {
        self.transport.engine_mut()
    }

    /// Number of asynchronous requests whose callback has not run yet.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Submits a request.
    ///
    /// In [`ExecutionMode::Async`] the request is handed to the engine and
    /// `callback` runs later, from [`run_once`](Self::run_once). In
    /// [`ExecutionMode::Blocking`] the transfer completes and `callback`
    /// runs before this returns.
    ///
    /// On error the callback never runs. A refused interest change fails the
    /// submission; changes the engine queued behind it stay queued.
    pub fn submit<F>(&mut self, request: Request, user_data: U, callback: F) -> Result<HandleId, SubmitError>
    where
        F: FnOnce(&mut RequestHandle<U>) -> Disposal + 'static,
    {
        match self.mode {
            ExecutionMode::Blocking => {
                let (handle, report) = self.transport.perform(request, user_data, Box::new(callback))?;
                let id = handle.id();

                self.dispatcher.dispatch(handle, Outcome::Completed(report), false);
                Ok(id)
            }

            ExecutionMode::Async => {
                let id = self.transport.submit(request, user_data, Box::new(callback))?;
                self.dispatcher.submitted();

                if let Err(e) = self.flush() {
                    // Nothing will ever drive this request.
                    drop(self.transport.withdraw(id));
                    self.dispatcher.rolled_back();
                    return Err(e.into());
                }

                Ok(id)
            }
        }
    }

    /// Submits a GET request for `url`.
    pub fn send_get<F>(&mut self, url: impl Into<String>, user_data: U, callback: F) -> Result<HandleId, SubmitError>
    where
        F: FnOnce(&mut RequestHandle<U>) -> Disposal + 'static,
    {
        self.submit(Request::get(url), user_data, callback)
    }

    /// Submits a POST request sending `body` to `url`.
    pub fn send_post<F>(
        &mut self,
        url: impl Into<String>,
        body: impl Into<Vec<u8>>,
        user_data: U,
        callback: F,
    ) -> Result<HandleId, SubmitError>
    where
        F: FnOnce(&mut RequestHandle<U>) -> Disposal + 'static,
    {
        self.submit(Request::post(url, body), user_data, callback)
    }

    /// Runs one iteration of the event loop.
    ///
    /// Waits up to `max_wait` for readiness, then processes every wakeup
    /// before returning. A [`RunError`] leaves the reactor and the engine
    /// out of step; the pool should not be driven further.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<(), RunError> {
        self.flush()?;

        let mut wakeups = mem::take(&mut self.wakeups);
        wakeups.clear();

        let result = self
            .reactor
            .run_once(max_wait, &mut wakeups)
            .and_then(|()| self.process(&wakeups));

        self.wakeups = wakeups;
        result
    }

    /// Runs the event loop until every pending request was dispatched.
    pub fn run_until_idle(&mut self, poll_interval: Duration) -> Result<(), RunError> {
        while self.pending_count() > 0 {
            self.run_once(poll_interval)?;

            if self.verbosity > 1 {
                debug!(pending = self.pending_count(), "waiting for pending requests");
            }
        }

        Ok(())
    }

    /// [`run_until_idle`](Self::run_until_idle) with the configured poll
    /// interval.
    pub fn run(&mut self) -> Result<(), RunError> {
        self.run_until_idle(self.poll_interval)
    }

    /// A handle kept by its callback.
    pub fn retained(&self, id: HandleId) -> Option<&RequestHandle<U>> {
        self.dispatcher.retained(id)
    }

    /// Takes back a handle kept by its callback. Returns `None` once reclaimed.
    pub fn reclaim(&mut self, id: HandleId) -> Option<RequestHandle<U>> {
        self.dispatcher.reclaim(id)
    }

    /// Withdraws every in-flight request from the engine.
    ///
    /// Each callback still runs once, with
    /// [`STATUS_ABORTED`](crate::STATUS_ABORTED). Returns the number of
    /// cancelled requests.
    pub fn cancel_all(&mut self) -> usize {
        let ids = self.transport.in_flight_ids();

        for &id in &ids {
            if let Some(handle) = self.transport.withdraw(id) {
                self.dispatcher.dispatch(handle, Outcome::Aborted(CANCELLED.to_owned()), true);
            }
        }

        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to release registrations after cancellation");
        }

        debug!(cancelled = ids.len(), "requests cancelled");
        ids.len()
    }

    fn process(&mut self, wakeups: &[Wakeup]) -> Result<(), RunError> {
        for wakeup in wakeups {
            if self.verbosity > 0 {
                trace!(?wakeup, "wakeup");
            }

            let driven = match *wakeup {
                Wakeup::Socket { fd, readiness } => self.transport.drive_socket(fd, readiness),
                Wakeup::Timer => self.transport.drive_timer(),
            };

            if let Err(e) = driven {
                self.fail(e);
            }

            self.drain();
            self.flush()?;
        }

        Ok(())
    }

    /// Dispatches every completion the engine has produced so far.
    fn drain(&mut self) {
        for (handle, report) in self.transport.drain_completions() {
            self.dispatcher.dispatch(handle, Outcome::Completed(report), true);
        }
    }

    /// Fails the handles broken by a drive error.
    fn fail(&mut self, e: DriveError) {
        warn!(reason = %e.reason, affected = ?e.affected, "transport engine action failed");

        for &id in &e.affected {
            if let Some(handle) = self.transport.withdraw(id) {
                self.dispatcher.dispatch(handle, Outcome::Aborted(e.reason.clone()), true);
            }
        }
    }

    /// Applies the engine's queued interest changes to the reactor.
    ///
    /// Stops at the first change the reactor refuses. That change is dropped
    /// and the ones queued behind it stay queued for the next flush, ahead of
    /// anything the engine asks for later.
    fn flush(&mut self) -> Result<(), RegistrationError> {
        self.transport.take_requests(&mut self.requests);

        let mut applied = 0;
        let result = loop {
            let Some(&request) = self.requests.get(applied) else {
                break Ok(());
            };
            applied += 1;

            if let Err(e) = self.apply(request) {
                break Err(e);
            }
        };

        self.requests.drain(..applied);
        result
    }

    fn apply(&mut self, request: EngineRequest) -> Result<(), RegistrationError> {
        match request {
            EngineRequest::Socket { fd, action, token } => {
                let assigned = self
                    .reactor
                    .set_interest(fd, action, token)
                    .inspect_err(|e| error!(error = %e, "socket registration failed"))?;

                if let Some(new) = assigned.filter(|t| Some(*t) != token) {
                    if let Err(e) = self.transport.assign(fd, new) {
                        warn!(fd, error = %e, "engine refused socket token");
                    }
                }
            }

            EngineRequest::Timer(request) => {
                self.reactor
                    .set_timer(request)
                    .inspect_err(|e| error!(error = %e, "timer registration failed"))?;
            }
        }

        Ok(())
    }
}

impl<E: TransportEngine, U> Drop for Pool<E, U> {
    fn drop(&mut self) {
        if self.transport.in_flight() > 0 {
            self.cancel_all();
        }
    }
}
