use super::{Interest, SocketAction, SourceToken};

use std::collections::HashMap;
use std::os::fd::RawFd;

/// One watched socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub fd: RawFd,
    pub interest: Interest,
    pub token: SourceToken,
}

/// What a backend has to do to honour an interest change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The descriptor already has this interest.
    Unchanged(Registration),

    /// First registration for the descriptor.
    Add(Interest),

    /// The descriptor is registered with a different interest.
    Modify(Registration, Interest),

    /// The registration must go.
    Remove(Registration),

    /// Removal requested for a descriptor that is not registered.
    Absent,
}

/// Descriptor → registration table shared by every backend.
///
/// The table is keyed by descriptor, which guarantees at most one
/// registration per socket. Backends ask for a [`Plan`], perform the backend
/// call, and only then commit, so a failed call leaves the table untouched.
#[derive(Debug, Default)]
pub(crate) struct RegistrationTable {
    entries: HashMap<RawFd, Registration>,
}

impl RegistrationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn plan(&self, fd: RawFd, action: SocketAction) -> Plan {
        let current = self.entries.get(&fd).copied();

        match (action.interest(), current) {
            (None, Some(reg)) => Plan::Remove(reg),
            (None, None) => Plan::Absent,
            (Some(interest), None) => Plan::Add(interest),
            (Some(interest), Some(reg)) if reg.interest == interest => Plan::Unchanged(reg),
            (Some(interest), Some(reg)) => Plan::Modify(reg, interest),
        }
    }

    pub(crate) fn commit(&mut self, registration: Registration) {
        self.entries.insert(registration.fd, registration);
    }

    pub(crate) fn forget(&mut self, fd: RawFd) -> Option<Registration> {
        self.entries.remove(&fd)
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<Registration> {
        self.entries.get(&fd).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.values()
    }
}
