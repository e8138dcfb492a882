//! Service event loop.
//!
//! An event loop in the style of a service manager's event API: callers add
//! *event sources* (a descriptor to watch, or a deadline) together with a
//! callback, and the loop invokes the callback of each source that fires.
//!
//! Sources can be switched [`Off`](Enabled::Off), [`On`](Enabled::On) or
//! [`OneShot`](Enabled::OneShot) (fire once, then switch off), retargeted to
//! new events or deadlines, and carry a human-readable description.
//!
//! The loop is driven by `poll(2)` and is single-threaded. Callbacks run
//! while the loop is borrowed, so they must not call back into it; they
//! usually record what happened for the caller to act on afterwards.
//!
//! ```rust,ignore
//! let mut event_loop = EventLoop::new();
//! let fired = Rc::new(Cell::new(false));
//!
//! let flag = fired.clone();
//! let id = event_loop.add_time(event_loop.now(), move |_| flag.set(true));
//! event_loop.set_description(id, "example")?;
//!
//! event_loop.run(Duration::from_secs(1))?;
//! assert!(fired.get());
//! ```

mod timer;

use self::timer::TimerEntry;
use crate::reactor::{Interest, Readiness};
use crate::sys::{sys_poll, timeout_ms};
use crate::utils::Slab;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, pollfd};
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Identifier of an event source.
///
/// Identifiers of removed sources are never confused with later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId {
    index: u32,
    generation: u32,
}

impl SourceId {
    /// Packs the identifier into an integer.
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpacks an identifier produced by [`to_bits`](Self::to_bits).
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Dispatch state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
    /// Never dispatched.
    Off,

    /// Dispatched every time it fires.
    On,

    /// Dispatched once, then switched [`Off`](Enabled::Off).
    OneShot,
}

/// What a source callback is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    Io { fd: RawFd, readiness: Readiness },
    Time { deadline: Instant },
}

type SourceCallback = Box<dyn FnMut(&SourceEvent)>;

enum SourceKind {
    Io { fd: RawFd, interest: Interest },
    Time { deadline: Instant },
}

struct Source {
    generation: u32,
    kind: SourceKind,
    enabled: Enabled,
    description: Option<String>,
    callback: SourceCallback,
}

/// A `poll(2)` driven event loop with per-source callbacks.
pub struct EventLoop {
    sources: Slab<Source>,
    timers: BinaryHeap<TimerEntry>,
    next_generation: u32,

    /// Scratch buffers reused across iterations.
    pollfds: Vec<pollfd>,
    polled: Vec<SourceId>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            sources: Slab::new(16),
            timers: BinaryHeap::new(),
            next_generation: 0,
            pollfds: Vec::new(),
            polled: Vec::new(),
        }
    }

    /// The loop's notion of the current time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Number of sources, enabled or not.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.len() == 0
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.source(id).is_some()
    }

    /// Watches `fd` for `interest`. The source starts [`On`](Enabled::On).
    ///
    /// Fails with `AlreadyExists` if another source watches `fd`.
    pub fn add_io<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> io::Result<SourceId>
    where
        F: FnMut(&SourceEvent) + 'static,
    {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        let taken = self
            .sources
            .iter()
            .any(|(_, s)| matches!(s.kind, SourceKind::Io { fd: f, .. } if f == fd));
        if taken {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }

        Ok(self.insert(SourceKind::Io { fd, interest }, Enabled::On, Box::new(callback)))
    }

    /// Fires once at `deadline`. The source starts [`OneShot`](Enabled::OneShot).
    pub fn add_time<F>(&mut self, deadline: Instant, callback: F) -> SourceId
    where
        F: FnMut(&SourceEvent) + 'static,
    {
        let id = self.insert(SourceKind::Time { deadline }, Enabled::OneShot, Box::new(callback));
        self.timers.push(TimerEntry { deadline, source: id });
        id
    }

    /// Changes the events an IO source watches.
    pub fn set_io_events(&mut self, id: SourceId, interest: Interest) -> io::Result<()> {
        match &mut self.source_mut(id)?.kind {
            SourceKind::Io { interest: current, .. } => {
                *current = interest;
                Ok(())
            }
            SourceKind::Time { .. } => Err(not_io(id)),
        }
    }

    /// Moves the deadline of a time source.
    pub fn set_time(&mut self, id: SourceId, deadline: Instant) -> io::Result<()> {
        match &mut self.source_mut(id)?.kind {
            SourceKind::Time { deadline: current } => *current = deadline,
            SourceKind::Io { .. } => return Err(not_time(id)),
        }

        self.timers.push(TimerEntry { deadline, source: id });
        Ok(())
    }

    pub fn set_enabled(&mut self, id: SourceId, enabled: Enabled) -> io::Result<()> {
        let source = self.source_mut(id)?;
        source.enabled = enabled;

        if let (SourceKind::Time { deadline }, true) = (&source.kind, enabled != Enabled::Off) {
            let deadline = *deadline;
            self.timers.push(TimerEntry { deadline, source: id });
        }

        Ok(())
    }

    pub fn enabled(&self, id: SourceId) -> Option<Enabled> {
        self.source(id).map(|s| s.enabled)
    }

    pub fn set_description(&mut self, id: SourceId, description: &str) -> io::Result<()> {
        self.source_mut(id)?.description = Some(description.to_owned());
        Ok(())
    }

    pub fn description(&self, id: SourceId) -> Option<&str> {
        self.source(id).and_then(|s| s.description.as_deref())
    }

    /// Removes a source and drops its callback.
    pub fn remove(&mut self, id: SourceId) -> io::Result<()> {
        self.source(id).ok_or_else(|| unknown(id))?;
        self.sources.remove(id.index as usize);
        Ok(())
    }

    /// Runs one iteration.
    ///
    /// Waits up to `timeout`, or until the earliest enabled deadline, for
    /// sources to fire, then invokes the callback of each fired source.
    /// Returns the number of callbacks invoked.
    pub fn run(&mut self, timeout: Duration) -> io::Result<usize> {
        self.pollfds.clear();
        self.polled.clear();

        for (index, source) in self.sources.iter() {
            let SourceKind::Io { fd, interest } = source.kind else {
                continue;
            };
            if source.enabled == Enabled::Off {
                continue;
            }

            let mut events = 0;
            if interest.read {
                events |= POLLIN;
            }
            if interest.write {
                events |= POLLOUT;
            }

            self.pollfds.push(pollfd {
                fd,
                events,
                revents: 0,
            });
            self.polled.push(SourceId {
                index: index as u32,
                generation: source.generation,
            });
        }

        let timeout = match self.next_deadline() {
            Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
            None => timeout,
        };

        sys_poll(&mut self.pollfds, timeout_ms(timeout))?;

        let mut fired = Vec::new();

        for (pfd, id) in self.pollfds.iter().zip(self.polled.iter()) {
            if pfd.revents == 0 {
                continue;
            }

            let error = pfd.revents & (POLLERR | POLLHUP | POLLNVAL) != 0;
            let readiness = Readiness {
                readable: pfd.revents & POLLIN != 0 || error,
                writable: pfd.revents & POLLOUT != 0,
                error,
            };

            fired.push((*id, SourceEvent::Io { fd: pfd.fd, readiness }));
        }

        let now = Instant::now();
        while let Some(entry) = self.timers.peek() {
            if !self.is_live(entry) {
                self.timers.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }

            let (id, deadline) = (entry.source, entry.deadline);
            self.timers.pop();

            if !fired.iter().any(|(f, _)| *f == id) {
                fired.push((id, SourceEvent::Time { deadline }));
            }
        }

        let mut dispatched = 0;
        for (id, event) in fired {
            let Ok(source) = self.source_mut(id) else {
                continue;
            };

            if source.enabled == Enabled::OneShot {
                source.enabled = Enabled::Off;
            }
            let repeat = matches!(event, SourceEvent::Time { .. }) && source.enabled == Enabled::On;

            (source.callback)(&event);
            dispatched += 1;

            if let (true, SourceEvent::Time { deadline }) = (repeat, event) {
                self.timers.push(TimerEntry { deadline, source: id });
            }
        }

        Ok(dispatched)
    }

    fn insert(&mut self, kind: SourceKind, enabled: Enabled, callback: SourceCallback) -> SourceId {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let index = self.sources.insert(Source {
            generation,
            kind,
            enabled,
            description: None,
            callback,
        });

        SourceId {
            index: index as u32,
            generation,
        }
    }

    fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
    }

    fn source_mut(&mut self, id: SourceId) -> io::Result<&mut Source> {
        self.sources
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or_else(|| unknown(id))
    }

    /// Whether a heap entry still describes its source's current deadline.
    fn is_live(&self, entry: &TimerEntry) -> bool {
        match self.source(entry.source) {
            Some(Source {
                kind: SourceKind::Time { deadline },
                enabled,
                ..
            }) => *deadline == entry.deadline && *enabled != Enabled::Off,
            _ => false,
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.timers.peek() {
            if self.is_live(entry) {
                return Some(entry.deadline);
            }
            self.timers.pop();
        }

        None
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(id: SourceId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no event source {id}"))
}

fn not_io(id: SourceId) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("event source {id} is not an io source"))
}

fn not_time(id: SourceId) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("event source {id} is not a time source"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn counter() -> (Rc<Cell<usize>>, impl FnMut(&SourceEvent) + 'static) {
        let count = Rc::new(Cell::new(0));
        let inner = count.clone();
        (count, move |_: &SourceEvent| inner.set(inner.get() + 1))
    }

    #[test]
    fn io_source_fires_with_readiness() {
        let mut event_loop = EventLoop::new();
        let (a, mut b) = UnixStream::pair().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let sink = seen.clone();
        event_loop
            .add_io(a.as_raw_fd(), Interest::READ, move |e| sink.borrow_mut().push(*e))
            .unwrap();

        b.write_all(b"x").unwrap();
        assert_eq!(event_loop.run(Duration::from_secs(1)).unwrap(), 1);

        assert_eq!(
            seen.borrow().as_slice(),
            &[SourceEvent::Io {
                fd: a.as_raw_fd(),
                readiness: Readiness::READABLE
            }]
        );
    }

    #[test]
    fn second_io_source_on_same_fd_is_rejected() {
        let mut event_loop = EventLoop::new();
        let (a, _b) = UnixStream::pair().unwrap();

        event_loop.add_io(a.as_raw_fd(), Interest::READ, |_| {}).unwrap();
        let err = event_loop
            .add_io(a.as_raw_fd(), Interest::WRITE, |_| {})
            .unwrap_err();

        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        assert_eq!(event_loop.len(), 1);
    }

    #[test]
    fn one_shot_time_source_fires_once() {
        let mut event_loop = EventLoop::new();
        let (count, callback) = counter();

        let id = event_loop.add_time(event_loop.now(), callback);

        event_loop.run(Duration::from_secs(1)).unwrap();
        event_loop.run(Duration::from_millis(10)).unwrap();

        assert_eq!(count.get(), 1);
        assert_eq!(event_loop.enabled(id), Some(Enabled::Off));
    }

    #[test]
    fn rescheduled_time_source_uses_new_deadline() {
        let mut event_loop = EventLoop::new();
        let (count, callback) = counter();

        let id = event_loop.add_time(event_loop.now() + Duration::from_secs(60), callback);
        event_loop.set_time(id, event_loop.now()).unwrap();

        event_loop.run(Duration::from_secs(1)).unwrap();
        assert_eq!(count.get(), 1);

        // Re-enabling re-arms the source at its current deadline.
        event_loop.set_enabled(id, Enabled::OneShot).unwrap();
        event_loop.run(Duration::from_secs(1)).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn disabled_sources_are_not_dispatched() {
        let mut event_loop = EventLoop::new();
        let (a, mut b) = UnixStream::pair().unwrap();
        let (count, callback) = counter();

        let id = event_loop.add_io(a.as_raw_fd(), Interest::READ, callback).unwrap();
        event_loop.set_enabled(id, Enabled::Off).unwrap();
        b.write_all(b"x").unwrap();

        assert_eq!(event_loop.run(Duration::from_millis(10)).unwrap(), 0);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn removed_source_ids_are_not_reused() {
        let mut event_loop = EventLoop::new();

        let first = event_loop.add_time(event_loop.now(), |_| {});
        event_loop.set_description(first, "first").unwrap();
        event_loop.remove(first).unwrap();

        let second = event_loop.add_time(event_loop.now(), |_| {});

        assert_ne!(first, second);
        assert!(!event_loop.contains(first));
        assert!(event_loop.remove(first).is_err());
        assert_eq!(event_loop.description(second), None);
        assert_eq!(SourceId::from_bits(second.to_bits()), second);
    }
}
