//! Reactor bridge.
//!
//! This module adapts the transport engine's socket and timer interest
//! requests to an event-loop backend, and reports readiness back.
//!
//! Three backends implement the [`Reactor`] contract:
//! - [`EpollReactor`]: raw `epoll(7)`, which cannot attach a callback to a
//!   descriptor, so interest is split into nested wait groups,
//! - [`MioReactor`]: the `mio` event-loop library,
//! - [`ServiceReactor`]: a [`service::EventLoop`](crate::service::EventLoop)
//!   with one callback per event source.
//!
//! The backend is chosen once, when the pool is built.

mod event;
mod registry;

pub mod epoll;
pub mod mio_loop;
pub mod service;

pub use epoll::{EpollReactor, GroupKind};
pub use event::{Readiness, Wakeup};
pub use mio_loop::MioReactor;
pub use registry::Registration;
pub use service::ServiceReactor;

pub(crate) use registry::{Plan, RegistrationTable};

use crate::error::{RegistrationError, RunError};

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// Readiness a backend watches for on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Interest change requested by the transport engine for one socket.
///
/// This is the engine's vocabulary; every backend translates it into its
/// own readiness flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketAction {
    In,
    Out,
    InOut,
    Remove,
}

impl SocketAction {
    /// The interest to register, or `None` for [`SocketAction::Remove`].
    pub fn interest(self) -> Option<Interest> {
        match self {
            SocketAction::In => Some(Interest::READ),
            SocketAction::Out => Some(Interest::WRITE),
            SocketAction::InOut => Some(Interest::BOTH),
            SocketAction::Remove => None,
        }
    }
}

/// Opaque backend handle stored by the engine next to a socket.
///
/// The engine hands it back with every later interest change for the same
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceToken(pub u64);

/// Timer change requested by the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    /// Fire once after the delay. A zero delay means "as soon as possible".
    Arm(Duration),

    /// Cancel any armed timer.
    Disarm,
}

impl TimerRequest {
    /// Converts a millisecond delay where negative values mean "disarm".
    pub fn from_millis(delay_ms: i64) -> Self {
        if delay_ms < 0 {
            TimerRequest::Disarm
        } else {
            TimerRequest::Arm(Duration::from_millis(delay_ms as u64))
        }
    }
}

/// The capability contract every event-loop backend satisfies.
pub trait Reactor {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Applies an interest change for `fd`.
    ///
    /// `token` is the value returned by the previous call for the same
    /// descriptor, if any. Requesting the interest already registered is a
    /// no-op. Returns the token the engine should keep for this socket, or
    /// `None` once the registration is removed.
    ///
    /// On error the registration table is left exactly as it was and no
    /// backend resource created by the failed call survives.
    fn set_interest(
        &mut self,
        fd: RawFd,
        action: SocketAction,
        token: Option<SourceToken>,
    ) -> Result<Option<SourceToken>, RegistrationError>;

    /// Arms or disarms the single engine timer.
    fn set_timer(&mut self, request: TimerRequest) -> Result<(), RegistrationError>;

    /// Waits up to `max_wait` for readiness and collects every fired
    /// socket and timer into `wakeups`.
    ///
    /// Returns as soon as something fired; does not wait at all if an event
    /// is already pending.
    fn run_once(&mut self, max_wait: Duration, wakeups: &mut Vec<Wakeup>) -> Result<(), RunError>;

    /// Current registration for `fd`.
    fn registration(&self, fd: RawFd) -> Option<Registration>;

    /// Number of registered sockets.
    fn registrations(&self) -> usize;

    /// Returns `true` while the engine timer is armed.
    fn timer_armed(&self) -> bool;
}

/// Available event-loop backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Raw `epoll` with nested wait groups.
    #[default]
    RawReactor,

    /// The `mio` event-loop library.
    LoopLibrary,

    /// The sd-event style [`service::EventLoop`](crate::service::EventLoop).
    ServiceLoop,
}

impl BackendKind {
    /// Creates a fresh event loop of this kind.
    pub fn create(self) -> io::Result<Box<dyn Reactor>> {
        let reactor: Box<dyn Reactor> = match self {
            BackendKind::RawReactor => Box::new(EpollReactor::new()?),
            BackendKind::LoopLibrary => Box::new(MioReactor::new()?),
            BackendKind::ServiceLoop => Box::new(ServiceReactor::new()?),
        };

        Ok(reactor)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::RawReactor => "epoll",
            BackendKind::LoopLibrary => "mio",
            BackendKind::ServiceLoop => "service",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" | "raw" => Ok(BackendKind::RawReactor),
            "mio" | "loop" => Ok(BackendKind::LoopLibrary),
            "service" | "systemd" => Ok(BackendKind::ServiceLoop),
            other => Err(format!("unknown backend {other:?}")),
        }
    }
}
