use super::SourceId;

use std::cmp::Ordering;
use std::time::Instant;

/// An entry in the event loop's timer queue.
///
/// `TimerEntry` represents a scheduled expiry of a time source. It is
/// stored inside a binary heap ordered by deadline.
///
/// Entries are never removed eagerly: rescheduling or disabling a source
/// leaves its old entry in the heap, and the loop discards entries whose
/// deadline no longer matches the source when they surface.
pub(crate) struct TimerEntry {
    /// The time at which the source should fire.
    pub(crate) deadline: Instant,

    /// The time source this entry belongs to.
    pub(crate) source: SourceId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    /// Two timer entries are equal if their deadlines are equal.
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Orders timer entries by deadline.
    ///
    /// Note that the comparison is **reversed** so that a
    /// `BinaryHeap<TimerEntry>` behaves as a min-heap,
    /// where the earliest deadline is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    /// Partial ordering consistent with [`Ord`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
