use std::os::fd::RawFd;

/// Readiness observed on a descriptor.
///
/// Produced by a backend and forwarded to the transport engine, which
/// decides what to do with it. Error and hang-up conditions are folded
/// into `readable` by the backends so the engine gets a chance to read
/// the failure, and are also flagged in `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor is readable (or reached end of stream).
    pub readable: bool,

    /// The descriptor is writable.
    pub writable: bool,

    /// The descriptor reported an error or hang-up condition.
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
    };

    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
    };

    /// Merges readiness reported twice for the same descriptor.
    pub(crate) fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
    }
}

/// An event reported by a backend's `run_once`.
///
/// Every wakeup collected by a backend is processed by the pool before
/// `run_once` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A registered socket became ready.
    Socket { fd: RawFd, readiness: Readiness },

    /// The engine timer expired.
    Timer,
}

impl Wakeup {
    /// Pushes a socket wakeup, merging it with an earlier one for the same fd.
    pub(crate) fn push_socket(wakeups: &mut Vec<Wakeup>, fd: RawFd, readiness: Readiness) {
        let existing = wakeups.iter_mut().find_map(|w| match w {
            Wakeup::Socket { fd: f, readiness } if *f == fd => Some(readiness),
            _ => None,
        });

        match existing {
            Some(r) => r.merge(readiness),
            None => wakeups.push(Wakeup::Socket { fd, readiness }),
        }
    }
}
