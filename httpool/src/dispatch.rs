//! Completion dispatcher.
//!
//! Finishes a handle, runs its callback exactly once and applies the
//! callback's [`Disposal`]. It also owns the pool's pending counter and
//! the table of handles callers asked to keep.

use crate::handle::{Disposal, HandleId, RequestHandle};
use crate::transport::TransferReport;

use std::collections::HashMap;
use tracing::{debug, warn};

/// How a handle ended.
pub(crate) enum Outcome {
    /// The engine reported the transfer as finished.
    Completed(TransferReport),

    /// The transfer never finished.
    Aborted(String),
}

pub(crate) struct Dispatcher<U> {
    /// Asynchronous requests submitted and not yet dispatched.
    pending: usize,
    retained: HashMap<HandleId, RequestHandle<U>>,
}

impl<U> Dispatcher<U> {
    pub(crate) fn new() -> Self {
        Self {
            pending: 0,
            retained: HashMap::new(),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Counts an asynchronous request handed to the engine.
    pub(crate) fn submitted(&mut self) {
        self.pending += 1;
    }

    /// Uncounts a request whose submission was rolled back.
    pub(crate) fn rolled_back(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Completes `handle` and runs its callback.
    ///
    /// `counted` tells whether the handle is part of the pending count, which
    /// is the case for every asynchronous request.
    pub(crate) fn dispatch(&mut self, mut handle: RequestHandle<U>, outcome: Outcome, counted: bool) {
        let id = handle.id();

        let Some(callback) = handle.take_callback() else {
            warn!(%id, "handle already dispatched");
            return;
        };

        match outcome {
            Outcome::Completed(report) => handle.complete(report),
            Outcome::Aborted(reason) => handle.abort(reason),
        }

        if counted {
            debug_assert!(self.pending > 0, "dispatching more handles than submitted");
            self.pending = self.pending.saturating_sub(1);
        }

        let disposal = callback(&mut handle);
        debug!(
            %id,
            status = handle.status(),
            elapsed_ms = handle.elapsed_ms(),
            ?disposal,
            pending = self.pending,
            "request dispatched"
        );

        if disposal == Disposal::Keep {
            self.retained.insert(id, handle);
        }
    }

    pub(crate) fn retained(&self, id: HandleId) -> Option<&RequestHandle<U>> {
        self.retained.get(&id)
    }

    pub(crate) fn reclaim(&mut self, id: HandleId) -> Option<RequestHandle<U>> {
        self.retained.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::STATUS_ABORTED;

    use std::cell::Cell;
    use std::rc::Rc;

    fn handle(id: u64, calls: &Rc<Cell<u32>>, disposal: Disposal) -> RequestHandle<()> {
        let calls = Rc::clone(calls);
        RequestHandle::new(
            HandleId(id),
            "http://localhost/".to_owned(),
            (),
            Box::new(move |_| {
                calls.set(calls.get() + 1);
                disposal
            }),
        )
    }

    fn ok() -> Outcome {
        Outcome::Completed(TransferReport {
            status: 200,
            ..TransferReport::default()
        })
    }

    #[test]
    fn dispatch_decrements_pending_once() {
        let calls = Rc::new(Cell::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.submitted();
        dispatcher.submitted();

        dispatcher.dispatch(handle(1, &calls, Disposal::Free), ok(), true);

        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(dispatcher.retained_count(), 0);
    }

    #[test]
    fn uncounted_dispatch_leaves_pending_alone() {
        let calls = Rc::new(Cell::new(0));
        let mut dispatcher = Dispatcher::new();

        dispatcher.dispatch(handle(1, &calls, Disposal::Free), ok(), false);

        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn kept_handle_is_reclaimed_once() {
        let calls = Rc::new(Cell::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.submitted();

        dispatcher.dispatch(handle(4, &calls, Disposal::Keep), ok(), true);

        assert_eq!(dispatcher.retained(HandleId(4)).map(|h| h.status()), Some(200));
        assert!(dispatcher.reclaim(HandleId(4)).is_some());
        assert!(dispatcher.reclaim(HandleId(4)).is_none());
    }

    #[test]
    fn aborted_outcome_still_runs_callback() {
        let calls = Rc::new(Cell::new(0));
        let status = Rc::new(Cell::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.submitted();

        let seen = Rc::clone(&status);
        let counter = Rc::clone(&calls);
        let handle = RequestHandle::new(
            HandleId(2),
            "http://localhost/".to_owned(),
            (),
            Box::new(move |h: &mut RequestHandle<()>| {
                counter.set(counter.get() + 1);
                seen.set(h.status());
                Disposal::Free
            }),
        );

        dispatcher.dispatch(handle, Outcome::Aborted("engine failure".to_owned()), true);

        assert_eq!(calls.get(), 1);
        assert_eq!(status.get(), STATUS_ABORTED);
        assert_eq!(dispatcher.pending(), 0);
    }
}
