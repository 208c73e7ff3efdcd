//! Deadline-ordered collection of pending events.
//!
//! Entries are ordered by `(due, insertion sequence)`, so two events due at
//! the same instant fire in the order they were inserted. A side index from
//! [`EventId`] to key makes cancellation O(log n) without tombstones.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

/// Handle identifying a scheduled event, usable for cancellation.
///
/// A repeating event keeps its handle across re-insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Ordering key: due instant first, insertion sequence as tie-breaker.
type HeapKey = (Instant, u64);

/// A fired entry returned by [`TimerHeap::pop_due`].
#[derive(Debug)]
pub struct DueEvent<T> {
    /// Handle of the fired event.
    pub id: EventId,
    /// The instant the event was due.
    pub due: Instant,
    /// The stored payload.
    pub payload: T,
}

/// Time-ordered event storage.
#[derive(Debug)]
pub struct TimerHeap<T> {
    queue: BTreeMap<HeapKey, (EventId, T)>,
    index: HashMap<EventId, HeapKey>,
    next_seq: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerHeap<T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Insert an event due at `due`.
    ///
    /// Returns `false` and leaves the heap untouched if `id` is already
    /// live; the heap never holds two entries with the same handle.
    pub fn insert(&mut self, id: EventId, due: Instant, payload: T) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let key = (due, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.queue.insert(key, (id, payload));
        self.index.insert(id, key);
        true
    }

    /// Remove a pending event, returning its payload if it was live.
    pub fn remove(&mut self, id: EventId) -> Option<T> {
        let key = self.index.remove(&id)?;
        self.queue.remove(&key).map(|(_, payload)| payload)
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    /// Earliest due instant, if any event is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first_key_value().map(|((due, _), _)| *due)
    }

    /// Remove and return every event with `due <= now`, in firing order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<DueEvent<T>> {
        let mut fired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((due, _), (id, payload)) = entry.remove_entry();
            self.index.remove(&id);
            fired.push(DueEvent { id, due, payload });
        }
        fired
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no event is pending.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drop every pending event, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.index.len();
        self.queue.clear();
        self.index.clear();
        dropped
    }
}
