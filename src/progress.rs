//! Progress protocol between transfer workers and the orchestrator.
//!
//! Every in-flight transfer owns one [`Publisher`]. It tags its events with a
//! fresh [`PublisherId`] and pushes them into a shared `mpsc` channel that only
//! the orchestrator drains. Per publisher the order is always:
//!
//! - at most one `Initialize`
//! - zero or more `Progress` (each a delta, never a running total)
//! - exactly one terminal event: `Finish`, `Skip` or `Error`
//!
//! The terminal methods consume the publisher, so a second terminal event
//! cannot be written. A publisher dropped without one (early return, panic)
//! reports an `Error` on its way out.
//!
//! [`SlotTable`] maps active publishers onto a fixed number of display slots.

use crate::types::Metadata;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::mpsc::Sender;
use uuid::Uuid;

/// Opaque per-transfer token. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublisherId(Uuid);

impl PublisherId {
    pub fn new() -> Self {
        PublisherId(Uuid::new_v4())
    }
}

impl Default for PublisherId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Initialize {
        publisher: PublisherId,
        total: u64,
        name: String,
    },
    Progress {
        publisher: PublisherId,
        delta: u64,
    },
    Finish {
        publisher: PublisherId,
        source: String,
        destination: String,
        metadata: Metadata,
    },
    Skip {
        publisher: PublisherId,
        source: String,
        destination: String,
        reason: String,
    },
    Error {
        publisher: PublisherId,
        source: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn publisher(&self) -> PublisherId {
        match self {
            ProgressEvent::Initialize { publisher, .. }
            | ProgressEvent::Progress { publisher, .. }
            | ProgressEvent::Finish { publisher, .. }
            | ProgressEvent::Skip { publisher, .. }
            | ProgressEvent::Error { publisher, .. } => *publisher,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Finish { .. } | ProgressEvent::Skip { .. } | ProgressEvent::Error { .. }
        )
    }
}

/// Write side of the protocol for a single transfer.
pub struct Publisher {
    id: PublisherId,
    source: String,
    tx: Sender<ProgressEvent>,
    initialized: bool,
    terminated: bool,
}

impl Publisher {
    pub fn new(tx: Sender<ProgressEvent>, source: impl Into<String>) -> Self {
        Self {
            id: PublisherId::new(),
            source: source.into(),
            tx,
            initialized: false,
            terminated: false,
        }
    }

    pub fn id(&self) -> PublisherId {
        self.id
    }

    /// Source label carried by the terminal event.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Announce the transfer. Returns `false` (and sends nothing) if it was
    /// already announced.
    pub fn initialize(&mut self, total: u64, name: impl Into<String>) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        self.send(ProgressEvent::Initialize {
            publisher: self.id,
            total,
            name: name.into(),
        });
        true
    }

    pub fn progress(&self, delta: u64) {
        debug_assert!(self.initialized, "progress reported before initialize");
        if delta > 0 {
            self.send(ProgressEvent::Progress {
                publisher: self.id,
                delta,
            });
        }
    }

    /// Detached handle that can only report byte deltas. Used inside request
    /// bodies the transport consumes on its own.
    pub fn ticker(&self) -> Ticker {
        debug_assert!(self.initialized, "ticker taken before initialize");
        Ticker {
            id: self.id,
            tx: self.tx.clone(),
        }
    }

    pub fn finish(mut self, destination: impl Into<String>, metadata: Metadata) {
        let event = ProgressEvent::Finish {
            publisher: self.id,
            source: self.source.clone(),
            destination: destination.into(),
            metadata,
        };
        self.terminate(event);
    }

    pub fn skip(mut self, destination: impl Into<String>, reason: impl Into<String>) {
        let event = ProgressEvent::Skip {
            publisher: self.id,
            source: self.source.clone(),
            destination: destination.into(),
            reason: reason.into(),
        };
        self.terminate(event);
    }

    pub fn error(mut self, error: impl fmt::Display) {
        let event = ProgressEvent::Error {
            publisher: self.id,
            source: self.source.clone(),
            error: error.to_string(),
        };
        self.terminate(event);
    }

    fn terminate(&mut self, event: ProgressEvent) {
        self.terminated = true;
        self.send(event);
    }

    fn send(&self, event: ProgressEvent) {
        // Receiver gone means the job was torn down; nothing left to tell.
        let _ = self.tx.send(event);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        let error = if std::thread::panicking() {
            "worker panicked before reporting a result"
        } else {
            "worker returned without reporting a result"
        };
        let event = ProgressEvent::Error {
            publisher: self.id,
            source: self.source.clone(),
            error: error.to_string(),
        };
        self.terminate(event);
    }
}

/// Progress-only handle split off a [`Publisher`].
#[derive(Clone)]
pub struct Ticker {
    id: PublisherId,
    tx: Sender<ProgressEvent>,
}

impl Ticker {
    pub fn progress(&self, delta: u64) {
        if delta > 0 {
            let _ = self.tx.send(ProgressEvent::Progress {
                publisher: self.id,
                delta,
            });
        }
    }
}

/// Live counters for one occupied display slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub publisher: PublisherId,
    pub name: String,
    pub total: u64,
    pub done: u64,
}

/// Fixed-size table of display slots. Always hands out the lowest free index.
///
/// Single-threaded by construction: only the orchestrator loop owns it.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
    free: BinaryHeap<Reverse<usize>>,
    owners: HashMap<PublisherId, usize>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            free: (0..capacity).map(Reverse).collect(),
            owners: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.owners.len()
    }

    /// Claim a slot for `publisher`. `None` if the table is full or the
    /// publisher already holds one.
    pub fn open(&mut self, publisher: PublisherId, name: &str, total: u64) -> Option<usize> {
        if self.owners.contains_key(&publisher) {
            return None;
        }
        let Reverse(index) = self.free.pop()?;
        self.slots[index] = Some(Slot {
            publisher,
            name: name.to_string(),
            total,
            done: 0,
        });
        self.owners.insert(publisher, index);
        Some(index)
    }

    /// Add `delta` to the publisher's counter.
    pub fn advance(&mut self, publisher: PublisherId, delta: u64) -> Option<(usize, &Slot)> {
        let index = *self.owners.get(&publisher)?;
        let slot = self.slots[index].as_mut()?;
        slot.done = slot.done.saturating_add(delta);
        Some((index, &*slot))
    }

    /// Release the publisher's slot. A publisher that never opened one is
    /// not an error.
    pub fn close(&mut self, publisher: PublisherId) -> Option<(usize, Slot)> {
        let index = self.owners.remove(&publisher)?;
        let slot = self.slots[index].take()?;
        self.free.push(Reverse(index));
        Some((index, slot))
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn publisher_emits_protocol_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut p = Publisher::new(tx, "a.txt");
        let id = p.id();
        assert!(p.initialize(10, "a.txt"));
        assert!(!p.initialize(10, "a.txt"));
        p.progress(4);
        p.progress(0);
        p.ticker().progress(6);
        p.finish("remote/a.txt", Metadata::new());

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ProgressEvent::Initialize { total: 10, .. }));
        assert_eq!(events[1], ProgressEvent::Progress { publisher: id, delta: 4 });
        assert_eq!(events[2], ProgressEvent::Progress { publisher: id, delta: 6 });
        assert!(events[3].is_terminal());
        assert!(events.iter().all(|e| e.publisher() == id));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "before initialize")]
    fn progress_before_initialize_is_rejected() {
        let (tx, _rx) = mpsc::channel();
        let p = Publisher::new(tx, "early.bin");
        p.progress(1);
    }

    #[test]
    fn dropped_publisher_reports_error() {
        let (tx, rx) = mpsc::channel();
        {
            let _p = Publisher::new(tx, "lost.bin");
        }
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ProgressEvent::Error { source, error, .. } => {
                assert_eq!(source, "lost.bin");
                assert!(error.contains("without reporting"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn terminal_event_is_sent_once() {
        let (tx, rx) = mpsc::channel();
        let p = Publisher::new(tx, "x");
        p.skip("x", "exists");
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::Skip { .. }));
    }

    #[test]
    fn slots_allocate_lowest_free_index() {
        let mut table = SlotTable::new(3);
        let (a, b, c, d) = (
            PublisherId::new(),
            PublisherId::new(),
            PublisherId::new(),
            PublisherId::new(),
        );
        assert_eq!(table.open(a, "a", 1), Some(0));
        assert_eq!(table.open(b, "b", 1), Some(1));
        assert_eq!(table.open(c, "c", 1), Some(2));
        assert_eq!(table.open(d, "d", 1), None);
        assert_eq!(table.occupied(), 3);

        table.close(b);
        table.close(a);
        assert_eq!(table.occupied(), 1);
        assert_eq!(table.open(d, "d", 1), Some(0));
        assert_eq!(table.occupied(), 2);
        let e = PublisherId::new();
        assert_eq!(table.open(e, "e", 1), Some(1));
        assert_eq!(table.occupied(), 3);
    }

    #[test]
    fn advance_and_close_tolerate_unknown_publishers() {
        let mut table = SlotTable::new(1);
        let ghost = PublisherId::new();
        assert!(table.advance(ghost, 5).is_none());
        assert!(table.close(ghost).is_none());

        let p = PublisherId::new();
        table.open(p, "p", 10);
        table.advance(p, 3);
        let (_, slot) = table.advance(p, 4).unwrap();
        assert_eq!(slot.done, 7);
        let (index, slot) = table.close(p).unwrap();
        assert_eq!(index, 0);
        assert_eq!(slot.name, "p");
        assert!(table.get(0).is_none());
        assert!(table.close(p).is_none());
    }

    #[test]
    fn duplicate_open_is_rejected() {
        let mut table = SlotTable::new(2);
        let p = PublisherId::new();
        assert_eq!(table.open(p, "p", 0), Some(0));
        assert_eq!(table.open(p, "p", 0), None);
        assert_eq!(table.occupied(), 1);
    }
}
