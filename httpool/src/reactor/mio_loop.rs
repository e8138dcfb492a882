//! `mio` backend.
//!
//! `mio` keys registrations by [`Token`], so every socket carries its own
//! identity and no nesting is needed. The engine timer is a deadline folded
//! into the poll timeout.
//!
//! `mio` registrations are edge-triggered while the transport engine expects
//! a socket to keep reporting readiness until it is drained. Every socket
//! that fired is re-registered after delivery, which re-evaluates its
//! readiness on the next poll.

use super::{
    BackendKind, Interest, Plan, Reactor, Readiness, Registration, RegistrationTable,
    SocketAction, SourceToken, TimerRequest, Wakeup,
};
use crate::error::{RegistrationError, RegistrationOp, RunError};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Number of events collected per poll.
const EVENTS_CAPACITY: usize = 64;

/// Event loop built on `mio::Poll`.
pub struct MioReactor {
    poll: Poll,
    events: Events,
    sockets: RegistrationTable,

    /// When the engine timer fires, if armed.
    deadline: Option<Instant>,

    /// Sockets delivered by the last poll, re-armed before the next one.
    rearm: Vec<RawFd>,
}

impl MioReactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            sockets: RegistrationTable::new(),
            deadline: None,
            rearm: Vec::new(),
        })
    }

    fn mio_interest(interest: Interest) -> mio::Interest {
        match (interest.read, interest.write) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }

    fn rearm_delivered(&mut self) -> Result<(), RegistrationError> {
        for fd in self.rearm.drain(..) {
            let Some(reg) = self.sockets.get(fd) else {
                continue;
            };

            self.poll
                .registry()
                .reregister(
                    &mut SourceFd(&fd),
                    Token(reg.token.0 as usize),
                    Self::mio_interest(reg.interest),
                )
                .map_err(|e| RegistrationError::new(fd, RegistrationOp::Modify, e))?;
        }

        Ok(())
    }
}

impl Reactor for MioReactor {
    fn kind(&self) -> BackendKind {
        BackendKind::LoopLibrary
    }

    fn set_interest(
        &mut self,
        fd: RawFd,
        action: SocketAction,
        token: Option<SourceToken>,
    ) -> Result<Option<SourceToken>, RegistrationError> {
        let plan = self.sockets.plan(fd, action);
        debug!(fd, ?action, ?token, ?plan, "mio interest change");

        match plan {
            Plan::Unchanged(current) => Ok(Some(current.token)),

            Plan::Add(interest) => {
                let token = SourceToken(fd as u64);

                self.poll
                    .registry()
                    .register(
                        &mut SourceFd(&fd),
                        Token(fd as usize),
                        Self::mio_interest(interest),
                    )
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::Add, e))?;

                self.sockets.commit(Registration { fd, interest, token });
                Ok(Some(token))
            }

            Plan::Modify(current, interest) => {
                self.poll
                    .registry()
                    .reregister(
                        &mut SourceFd(&fd),
                        Token(current.token.0 as usize),
                        Self::mio_interest(interest),
                    )
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::Modify, e))?;

                self.sockets.commit(Registration { interest, ..current });
                Ok(Some(current.token))
            }

            Plan::Remove(current) => {
                match self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    Ok(()) => {}
                    Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT)) => {
                        debug!(fd, "socket left the poll set before removal");
                    }
                    Err(e) => return Err(RegistrationError::new(fd, RegistrationOp::Remove, e)),
                }

                self.sockets.forget(current.fd);
                Ok(None)
            }

            Plan::Absent => Ok(None),
        }
    }

    fn set_timer(&mut self, request: TimerRequest) -> Result<(), RegistrationError> {
        self.deadline = match request {
            TimerRequest::Arm(delay) => Some(Instant::now() + delay),
            TimerRequest::Disarm => None,
        };

        trace!(?request, "mio timer change");
        Ok(())
    }

    fn run_once(&mut self, max_wait: Duration, wakeups: &mut Vec<Wakeup>) -> Result<(), RunError> {
        self.rearm_delivered()?;

        let timeout = match self.deadline {
            Some(deadline) => max_wait.min(deadline.saturating_duration_since(Instant::now())),
            None => max_wait,
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(RunError::Wait(e)),
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;

            if self.sockets.get(fd).is_none() {
                continue;
            }

            let error = event.is_error() || event.is_read_closed() || event.is_write_closed();
            let readiness = Readiness {
                readable: event.is_readable() || error,
                writable: event.is_writable(),
                error,
            };

            Wakeup::push_socket(wakeups, fd, readiness);
            self.rearm.push(fd);
        }

        if self.deadline.is_some_and(|d| d <= Instant::now()) {
            self.deadline = None;
            wakeups.push(Wakeup::Timer);
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
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn same_interest_registers_once() {
        let mut reactor = MioReactor::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let first = reactor.set_interest(fd, SocketAction::Out, None).unwrap();
        let second = reactor.set_interest(fd, SocketAction::Out, first).unwrap();

        assert_eq!(first, second);
        assert_eq!(reactor.registrations(), 1);
    }

    #[test]
    fn undrained_socket_keeps_reporting() {
        let mut reactor = MioReactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        reactor.set_interest(fd, SocketAction::In, None).unwrap();
        b.write_all(b"data").unwrap();

        for _ in 0..2 {
            let mut wakeups = Vec::new();
            reactor.run_once(Duration::from_secs(1), &mut wakeups).unwrap();

            assert!(matches!(
                wakeups.as_slice(),
                [Wakeup::Socket { fd: f, readiness }] if *f == fd && readiness.readable
            ));
        }
    }

    #[test]
    fn zero_delay_timer_fires_on_next_iteration() {
        let mut reactor = MioReactor::new().unwrap();
        reactor.set_timer(TimerRequest::Arm(Duration::ZERO)).unwrap();

        let mut wakeups = Vec::new();
        reactor.run_once(Duration::from_secs(1), &mut wakeups).unwrap();

        assert_eq!(wakeups, vec![Wakeup::Timer]);
        assert!(!reactor.timer_armed());
    }

    #[test]
    fn failed_modify_leaves_registration_untouched() {
        let mut reactor = MioReactor::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let token = reactor.set_interest(fd, SocketAction::In, None).unwrap();
        drop(a);
        drop(b);

        assert!(reactor.set_interest(fd, SocketAction::InOut, token).is_err());
        assert_eq!(reactor.registration(fd).map(|r| r.interest), Some(Interest::READ));
    }
}
