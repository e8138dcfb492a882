use super::Pool;
use crate::error::Error;
use crate::reactor::{BackendKind, Reactor, ServiceReactor};
use crate::service::EventLoop;
use crate::transport::TransportEngine;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// How submitted requests are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Requests run on the event loop; callbacks run from
    /// [`Pool::run_once`] after `submit` returned.
    #[default]
    Async,

    /// Requests run to completion inside `submit`; the callback runs before
    /// `submit` returns and the pending count is never touched.
    Blocking,
}

/// Builder for configuring and creating a [`Pool`].
///
/// # Examples
///
/// ```rust,ignore
/// let pool = PoolBuilder::new()
///     .backend(BackendKind::LoopLibrary)
///     .verbosity(1)
///     .build::<_, ()>(engine)?;
/// ```
pub struct PoolBuilder {
    backend: BackendKind,
    verbosity: u8,
    mode: ExecutionMode,
    poll_interval: Duration,

    /// Service loop shared with the caller.
    service_loop: Option<Rc<RefCell<EventLoop>>>,
}

impl PoolBuilder {
    /// Creates a new `PoolBuilder` with default configuration.
    ///
    /// By default the pool runs asynchronously on the raw `epoll` backend,
    /// quietly, waiting at most one second per iteration of
    /// [`Pool::run`].
    pub fn new() -> Self {
        Self {
            backend: BackendKind::default(),
            verbosity: 0,
            mode: ExecutionMode::default(),
            poll_interval: Duration::from_secs(1),
            service_loop: None,
        }
    }

    /// Selects the event-loop backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the verbosity level.
    ///
    /// `1` traces every wakeup, `2` also reports pending requests while
    /// waiting, `3` also asks the engine for verbose transfers.
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shortcut for `mode(ExecutionMode::Blocking)`.
    pub fn blocking(self) -> Self {
        self.mode(ExecutionMode::Blocking)
    }

    /// Sets the longest wait of one [`Pool::run`] iteration.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "poll_interval must be > 0");

        self.poll_interval = interval;
        self
    }

    /// Attaches the pool to a service loop owned by the caller.
    ///
    /// Implies [`BackendKind::ServiceLoop`]. The caller may add its own
    /// sources to the loop; the pool only touches the ones it created.
    pub fn service_loop(mut self, event_loop: Rc<RefCell<EventLoop>>) -> Self {
        self.backend = BackendKind::ServiceLoop;
        self.service_loop = Some(event_loop);
        self
    }

    /// Builds the pool around `engine`.
    ///
    /// This creates the backend's event loop.
    pub fn build<E: TransportEngine, U>(self, engine: E) -> Result<Pool<E, U>, Error> {
        let reactor: Box<dyn Reactor> = match (self.backend, self.service_loop) {
            (BackendKind::ServiceLoop, Some(shared)) => Box::new(ServiceReactor::with_loop(shared)),
            (backend, _) => backend.create().map_err(Error::EventLoop)?,
        };

        Ok(Pool::from_parts(
            engine,
            reactor,
            self.mode,
            self.verbosity,
            self.poll_interval,
        ))
    }
}

impl Default for PoolBuilder {
    /// Creates a default `PoolBuilder`.
    fn default() -> Self {
        Self::new()
    }
}
