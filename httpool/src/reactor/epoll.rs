//! Raw `epoll` backend.
//!
//! `epoll` only reports "this descriptor is ready"; it cannot attach a
//! callback to a watched descriptor. To still know whether a wakeup belongs
//! to an engine socket or to the engine timer, interest is split into
//! groups, each an `epoll` instance of its own:
//!
//! ```text
//!                 top-level epoll
//!                /               \
//!      sockets group epoll     timer group epoll
//!      (engine sockets)        (one timerfd)
//! ```
//!
//! Each group is registered in the top-level instance with its
//! [`GroupKind`] as event data. When the top-level wait wakes up, the fired
//! group is waited again with a zero timeout to enumerate its members,
//! which are then translated into socket or timer wakeups.
//!
//! Groups are created with the reactor and live as long as it does, even
//! when they have no members.

use super::{
    BackendKind, Interest, Plan, Reactor, Readiness, Registration, RegistrationTable,
    SocketAction, SourceToken, TimerRequest, Wakeup,
};
use crate::error::{RegistrationError, RegistrationOp, RunError};
use crate::sys::{
    sys_epoll_create, sys_epoll_ctl, sys_epoll_wait, sys_timerfd_create, sys_timerfd_read,
    sys_timerfd_settime, timeout_ms,
};

use libc::{
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLRDHUP, epoll_event,
};
use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Number of events collected per wait.
const EVENTS_CAPACITY: usize = 64;

/// Shortest delay the timer is armed with.
///
/// A zero `it_value` disarms a timerfd instead of firing it, so "fire as
/// soon as possible" is mapped to this delay.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(1);

/// A wait group of the top-level `epoll` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// Engine sockets.
    Sockets,

    /// The engine timer.
    Timer,
}

impl GroupKind {
    /// Event data identifying the group in the top-level instance.
    ///
    /// Never a descriptor number, so routing survives descriptor reuse.
    fn tag(self) -> u64 {
        match self {
            GroupKind::Sockets => 1,
            GroupKind::Timer => 2,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(GroupKind::Sockets),
            2 => Some(GroupKind::Timer),
            _ => None,
        }
    }
}

/// One nested `epoll` instance and the descriptors it watches.
struct Group {
    kind: GroupKind,
    epoll: OwnedFd,
    members: HashSet<RawFd>,
}

/// Raw `epoll` reactor with nested wait groups.
pub struct EpollReactor {
    /// Top-level instance; its only members are the groups.
    main: OwnedFd,

    /// Groups in creation order.
    groups: Vec<Group>,

    /// Socket registrations, all members of the sockets group.
    sockets: RegistrationTable,

    /// Engine timer, created on first arm. Member of the timer group.
    timer: Option<OwnedFd>,

    /// Whether the timer is armed and has not fired yet.
    timer_armed: bool,

    /// Reusable buffer for the top-level wait.
    events: Vec<epoll_event>,

    /// Reusable buffer for group waits.
    group_events: Vec<epoll_event>,
}

impl EpollReactor {
    /// Creates the top-level instance and both groups.
    pub fn new() -> io::Result<Self> {
        Self::with_group_order([GroupKind::Sockets, GroupKind::Timer])
    }

    /// Creates the reactor, creating the groups in the given order.
    ///
    /// Routing never depends on the order; this only changes which
    /// descriptor numbers the groups end up with.
    pub fn with_group_order(order: [GroupKind; 2]) -> io::Result<Self> {
        let main = sys_epoll_create()?;
        let mut groups = Vec::with_capacity(order.len());

        for kind in order {
            let epoll = sys_epoll_create()?;
            sys_epoll_ctl(
                main.as_raw_fd(),
                EPOLL_CTL_ADD,
                epoll.as_raw_fd(),
                EPOLLIN as u32,
                kind.tag(),
            )?;

            debug!(group = ?kind, fd = epoll.as_raw_fd(), "created epoll wait group");

            groups.push(Group {
                kind,
                epoll,
                members: HashSet::new(),
            });
        }

        Ok(Self {
            main,
            groups,
            sockets: RegistrationTable::new(),
            timer: None,
            timer_armed: false,
            events: Vec::with_capacity(EVENTS_CAPACITY),
            group_events: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    /// Descriptor of a group's `epoll` instance.
    pub fn group_fd(&self, kind: GroupKind) -> RawFd {
        self.group(kind).epoll.as_raw_fd()
    }

    /// Descriptors currently watched by a group.
    pub fn group_members(&self, kind: GroupKind) -> usize {
        self.group(kind).members.len()
    }

    fn group(&self, kind: GroupKind) -> &Group {
        self.groups
            .iter()
            .find(|g| g.kind == kind)
            .unwrap_or_else(|| unreachable!("group {kind:?} is created with the reactor"))
    }

    fn group_mut(&mut self, kind: GroupKind) -> &mut Group {
        self.groups
            .iter_mut()
            .find(|g| g.kind == kind)
            .unwrap_or_else(|| unreachable!("group {kind:?} is created with the reactor"))
    }

    /// Enumerates the fired members of one group.
    ///
    /// Called for every top-level wakeup reporting the group. The wait on
    /// the group never blocks.
    pub(crate) fn dispatch_group(&mut self, kind: GroupKind, wakeups: &mut Vec<Wakeup>) -> Result<(), RunError> {
        let epoll = self.group(kind).epoll.as_raw_fd();
        let n = sys_epoll_wait(epoll, &mut self.group_events, 0).map_err(RunError::Wait)?;

        trace!(group = ?kind, fired = n, "group wakeup");

        match kind {
            GroupKind::Sockets => {
                for i in 0..n {
                    let event = self.group_events[i];
                    let fd = event.u64 as RawFd;
                    Wakeup::push_socket(wakeups, fd, readiness(event.events));
                }
            }

            GroupKind::Timer => {
                let Some(timer) = &self.timer else {
                    return Ok(());
                };

                for _ in 0..n {
                    let expirations = sys_timerfd_read(timer).map_err(RunError::Wait)?;

                    // One-shot: a single expiry is one engine tick, however short the delay was.
                    if expirations > 0 {
                        self.timer_armed = false;
                        wakeups.push(Wakeup::Timer);
                    }
                }
            }
        }

        Ok(())
    }

    fn epoll_flags(interest: Interest) -> u32 {
        let mut flags = 0;

        if interest.read {
            flags |= EPOLLIN;
        }
        if interest.write {
            flags |= EPOLLOUT;
        }

        flags as u32
    }

    fn add_socket(&mut self, fd: RawFd, interest: Interest) -> Result<SourceToken, RegistrationError> {
        let group = self.group_mut(GroupKind::Sockets);

        sys_epoll_ctl(
            group.epoll.as_raw_fd(),
            EPOLL_CTL_ADD,
            fd,
            Self::epoll_flags(interest),
            fd as u64,
        )
        .map_err(|e| RegistrationError::new(fd, RegistrationOp::Add, e))?;

        group.members.insert(fd);

        let token = SourceToken(fd as u64);
        self.sockets.commit(Registration { fd, interest, token });

        Ok(token)
    }

    fn modify_socket(&mut self, current: Registration, interest: Interest) -> Result<SourceToken, RegistrationError> {
        let fd = current.fd;

        sys_epoll_ctl(
            self.group_fd(GroupKind::Sockets),
            EPOLL_CTL_MOD,
            fd,
            Self::epoll_flags(interest),
            fd as u64,
        )
        .map_err(|e| RegistrationError::new(fd, RegistrationOp::Modify, e))?;

        self.sockets.commit(Registration { interest, ..current });

        Ok(current.token)
    }

    fn remove_socket(&mut self, current: Registration) -> Result<(), RegistrationError> {
        let fd = current.fd;
        let group = self.group_mut(GroupKind::Sockets);

        match sys_epoll_ctl(group.epoll.as_raw_fd(), EPOLL_CTL_DEL, fd, 0, 0) {
            Ok(()) => {}
            // Closing a descriptor already drops it from every epoll set.
            Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT)) => {
                debug!(fd, "socket left the epoll set before removal");
            }
            Err(e) => return Err(RegistrationError::new(fd, RegistrationOp::Remove, e)),
        }

        group.members.remove(&fd);
        self.sockets.forget(fd);

        Ok(())
    }

    /// Returns the timerfd, creating it and adding it to the timer group
    /// on first use.
    fn timer_fd(&mut self) -> Result<&OwnedFd, RegistrationError> {
        let timer = match self.timer.take() {
            Some(timer) => timer,
            None => {
                let timer = sys_timerfd_create()
                    .map_err(|e| RegistrationError::new(-1, RegistrationOp::ArmTimer, e))?;
                let fd = timer.as_raw_fd();

                let group = self.group_mut(GroupKind::Timer);
                // On failure `timer` is dropped here, closing the descriptor.
                sys_epoll_ctl(group.epoll.as_raw_fd(), EPOLL_CTL_ADD, fd, EPOLLIN as u32, fd as u64)
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::ArmTimer, e))?;
                group.members.insert(fd);

                debug!(fd, "created engine timer");
                timer
            }
        };

        Ok(&*self.timer.insert(timer))
    }
}

/// Translates `epoll` flags into readiness.
fn readiness(flags: u32) -> Readiness {
    let error = flags & ((EPOLLERR | EPOLLHUP) as u32) != 0;

    Readiness {
        readable: flags & ((EPOLLIN | EPOLLRDHUP) as u32) != 0 || error,
        writable: flags & (EPOLLOUT as u32) != 0,
        error,
    }
}

impl Reactor for EpollReactor {
    fn kind(&self) -> BackendKind {
        BackendKind::RawReactor
    }

    fn set_interest(
        &mut self,
        fd: RawFd,
        action: SocketAction,
        token: Option<SourceToken>,
    ) -> Result<Option<SourceToken>, RegistrationError> {
        let plan = self.sockets.plan(fd, action);
        debug!(fd, ?action, ?token, ?plan, "epoll interest change");

        match plan {
            Plan::Unchanged(current) => Ok(Some(current.token)),
            Plan::Add(interest) => self.add_socket(fd, interest).map(Some),
            Plan::Modify(current, interest) => self.modify_socket(current, interest).map(Some),
            Plan::Remove(current) => self.remove_socket(current).map(|()| None),
            Plan::Absent => Ok(None),
        }
    }

    fn set_timer(&mut self, request: TimerRequest) -> Result<(), RegistrationError> {
        match request {
            TimerRequest::Arm(delay) => {
                let delay = delay.max(MIN_TIMER_DELAY);
                let timer = self.timer_fd()?;
                let fd = timer.as_raw_fd();

                sys_timerfd_settime(timer, Some(delay))
                    .map_err(|e| RegistrationError::new(fd, RegistrationOp::ArmTimer, e))?;

                trace!(?delay, "armed engine timer");
                self.timer_armed = true;
            }

            TimerRequest::Disarm => {
                if let Some(timer) = &self.timer {
                    sys_timerfd_settime(timer, None).map_err(|e| {
                        RegistrationError::new(timer.as_raw_fd(), RegistrationOp::DisarmTimer, e)
                    })?;
                }

                trace!("disarmed engine timer");
                self.timer_armed = false;
            }
        }

        Ok(())
    }

    fn run_once(&mut self, max_wait: Duration, wakeups: &mut Vec<Wakeup>) -> Result<(), RunError> {
        let n = sys_epoll_wait(self.main.as_raw_fd(), &mut self.events, timeout_ms(max_wait))
            .map_err(RunError::Wait)?;

        for i in 0..n {
            let tag = self.events[i].u64;

            match GroupKind::from_tag(tag) {
                Some(kind) => self.dispatch_group(kind, wakeups)?,
                None => warn!(tag, "top-level epoll reported an unknown member"),
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
