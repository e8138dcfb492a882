//! Service loop backend.
//!
//! Every socket gets its own IO source on a [`service::EventLoop`], with a
//! callback recording the wakeup, so no multiplexing is needed. The engine
//! timer is one time source reused across arms.
//!
//! The loop can be shared with the caller through [`ServiceReactor::with_loop`];
//! the reactor only ever touches the sources it created.
//!
//! [`service::EventLoop`]: crate::service::EventLoop

use super::{
    BackendKind, Interest, Plan, Reactor, Registration, RegistrationTable, SocketAction,
    SourceToken, TimerRequest, Wakeup,
};
use crate::error::{RegistrationError, RegistrationOp, RunError};
use crate::service::{Enabled, EventLoop, SourceEvent, SourceId};

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const SOCKET_DESCRIPTION: &str = "httpool-socket";
const TIMER_DESCRIPTION: &str = "httpool-timer";

/// Longest delay the engine timer is armed for.
///
/// Longer delays are cut short; the engine re-arms the timer on its next
/// drive, so the loop keeps a one second heartbeat while requests wait.
const MAX_TIMER_DELAY: Duration = Duration::from_millis(1000);

/// Descriptor reported in errors about the timer source.
const NO_FD: RawFd = -1;

/// Event loop built on the service [`EventLoop`].
pub struct ServiceReactor {
    event_loop: Rc<RefCell<EventLoop>>,
    sockets: RegistrationTable,

    /// The engine timer source, created on the first arm.
    timer: Option<SourceId>,
    timer_armed: bool,

    /// Filled by source callbacks while the loop runs.
    fired: Rc<RefCell<Vec<Wakeup>>>,
}

impl ServiceReactor {
    /// Creates a reactor on a private event loop.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_loop(Rc::new(RefCell::new(EventLoop::new()))))
    }

    /// Creates a reactor adding its sources to a shared event loop.
    pub fn with_loop(event_loop: Rc<RefCell<EventLoop>>) -> Self {
        Self {
            event_loop,
            sockets: RegistrationTable::new(),
            timer: None,
            timer_armed: false,
            fired: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// The event loop the reactor's sources live on.
    pub fn event_loop(&self) -> Rc<RefCell<EventLoop>> {
        Rc::clone(&self.event_loop)
    }

    /// The engine timer source, once the timer has been armed.
    pub fn timer_source(&self) -> Option<SourceId> {
        self.timer
    }

    fn add_socket(&mut self, fd: RawFd, interest: Interest) -> io::Result<SourceId> {
        let fired = Rc::clone(&self.fired);
        let mut event_loop = self.event_loop.borrow_mut();

        let id = event_loop.add_io(fd, interest, move |event| {
            if let SourceEvent::Io { fd, readiness } = *event {
                Wakeup::push_socket(&mut fired.borrow_mut(), fd, readiness);
            }
        })?;

        if let Err(e) = event_loop.set_description(id, SOCKET_DESCRIPTION) {
            // Never leave a half-configured source behind.
            let _ = event_loop.remove(id);
            return Err(e);
        }

        Ok(id)
    }

    fn arm(&mut self, delay: Duration) -> io::Result<()> {
        let mut event_loop = self.event_loop.borrow_mut();
        let deadline = event_loop.now() + delay.min(MAX_TIMER_DELAY);

        match self.timer {
            Some(id) => {
                event_loop.set_time(id, deadline)?;
                event_loop.set_enabled(id, Enabled::OneShot)?;
            }
            None => {
                let fired = Rc::clone(&self.fired);
                let id = event_loop.add_time(deadline, move |_| {
                    fired.borrow_mut().push(Wakeup::Timer);
                });

                if let Err(e) = event_loop.set_description(id, TIMER_DESCRIPTION) {
                    let _ = event_loop.remove(id);
                    return Err(e);
                }

                self.timer = Some(id);
            }
        }

        Ok(())
    }
}

impl Reactor for ServiceReactor {
    fn kind(&self) -> BackendKind {
        BackendKind::ServiceLoop
    }

    fn set_interest(
        &mut self,
        fd: RawFd,
        action: SocketAction,
        token: Option<SourceToken>,
    ) -> Result<Option<SourceToken>, RegistrationError> {
        let plan = self.sockets.plan(fd, action);
        debug!(fd, ?action, ?token, ?plan, "service interest change");

        match plan {
            Plan::Unchanged(current) => Ok(Some(current.token)),

            Plan::Add(interest) => {
                let id = self
                    .add_socket(fd, interest)
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::Add, e))?;

                let token = SourceToken(id.to_bits());
                self.sockets.commit(Registration { fd, interest, token });
                Ok(Some(token))
            }

            Plan::Modify(current, interest) => {
                let id = SourceId::from_bits(current.token.0);

                self.event_loop
                    .borrow_mut()
                    .set_io_events(id, interest)
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::Modify, e))?;

                self.sockets.commit(Registration { interest, ..current });
                Ok(Some(current.token))
            }

            Plan::Remove(current) => {
                let id = SourceId::from_bits(current.token.0);

                self.event_loop
                    .borrow_mut()
                    .remove(id)
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::Remove, e))?;

                self.sockets.forget(current.fd);
                Ok(None)
            }

            Plan::Absent => Ok(None),
        }
    }

    fn set_timer(&mut self, request: TimerRequest) -> Result<(), RegistrationError> {
        trace!(?request, "service timer change");

        match request {
            TimerRequest::Arm(delay) => {
                self.arm(delay)
                    .map_err(|e| RegistrationError::new(NO_FD, RegistrationOp::ArmTimer, e))?;
                self.timer_armed = true;
            }
            TimerRequest::Disarm => {
                if let Some(id) = self.timer {
                    self.event_loop
                        .borrow_mut()
                        .set_enabled(id, Enabled::Off)
                        .map_err(|e| RegistrationError::new(NO_FD, RegistrationOp::DisarmTimer, e))?;
                }
                self.timer_armed = false;
            }
        }

        Ok(())
    }

    fn run_once(&mut self, max_wait: Duration, wakeups: &mut Vec<Wakeup>) -> Result<(), RunError> {
        self.event_loop
            .borrow_mut()
            .run(max_wait)
            .map_err(RunError::Wait)?;

        for wakeup in self.fired.borrow_mut().drain(..) {
            match wakeup {
                Wakeup::Socket { fd, readiness } => Wakeup::push_socket(wakeups, fd, readiness),
                Wakeup::Timer => {
                    self.timer_armed = false;
                    wakeups.push(Wakeup::Timer);
                }
            }
        }

        Ok(())
    }

    fn registration(&self, fd: RawFd) -> Option<Registration> {
        self.sockets.get(fd)
    }

    fn registrations(&self) -> usize {
        self.sockets.len()
    }

    fn timer_armed(&self) -> bool {
        self.timer_armed
    }
}

impl Drop for ServiceReactor {
    fn drop(&mut self) {
        let Ok(mut event_loop) = self.event_loop.try_borrow_mut() else {
            warn!("service loop busy, leaving reactor sources in place");
            return;
        };

        let sources = self
            .sockets
            .iter()
            .map(|reg| SourceId::from_bits(reg.token.0))
            .chain(self.timer);

        for id in sources {
            let _ = event_loop.remove(id);
        }
    }
}
