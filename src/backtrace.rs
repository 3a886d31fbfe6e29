//! Deferred-event storage: per logger name, a bounded ring of captured
//! transit events that is drained to the sinks when a statement at or above
//! the logger's backtrace flush level goes through.

use std::collections::VecDeque;

use fxhash::FxHashMap;

use crate::transit::TransitEvent;

struct BacktraceRing {
    capacity: usize,
    events: VecDeque<TransitEvent>,
}

#[derive(Default)]
pub(crate) struct BacktraceStore {
    rings: FxHashMap<String, BacktraceRing>,
}

impl BacktraceStore {
    /// Creates or resizes the ring for a logger. Existing events beyond the
    /// new capacity are discarded oldest-first.
    pub(crate) fn set_capacity(&mut self, logger_name: &str, capacity: usize) {
        let capacity = capacity.max(1);
        let ring = self
            .rings
            .entry(logger_name.to_string())
            .or_insert_with(|| BacktraceRing {
                capacity,
                events: VecDeque::with_capacity(capacity),
            });
        ring.capacity = capacity;
        while ring.events.len() > ring.capacity {
            ring.events.pop_front();
        }
    }

    /// Moves an event into the logger's ring, evicting the oldest entry when
    /// full. Events for loggers without an initialised ring are discarded.
    pub(crate) fn store(&mut self, logger_name: &str, event: TransitEvent) {
        if let Some(ring) = self.rings.get_mut(logger_name) {
            if ring.events.len() == ring.capacity {
                ring.events.pop_front();
            }
            ring.events.push_back(event);
        }
    }

    /// Removes and returns all stored events in insertion order.
    pub(crate) fn drain(&mut self, logger_name: &str) -> Vec<TransitEvent> {
        match self.rings.get_mut(logger_name) {
            Some(ring) => ring.events.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn erase(&mut self, logger_name: &str) {
        self.rings.remove(logger_name);
    }

    #[cfg(test)]
    fn stored(&self, logger_name: &str) -> usize {
        self.rings.get(logger_name).map_or(0, |r| r.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: u64) -> TransitEvent {
        TransitEvent {
            timestamp: ts,
            ..TransitEvent::default()
        }
    }

    #[test]
    fn capacity_bounds_the_ring() {
        let mut store = BacktraceStore::default();
        store.set_capacity("root", 2);
        for ts in 1..=5 {
            store.store("root", event(ts));
        }
        assert_eq!(store.stored("root"), 2);

        // The two newest survive, in insertion order.
        let drained = store.drain("root");
        let stamps: Vec<u64> = drained.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![4, 5]);
        assert_eq!(store.stored("root"), 0);
    }

    #[test]
    fn store_without_init_is_ignored() {
        let mut store = BacktraceStore::default();
        store.store("nobody", event(1));
        assert!(store.drain("nobody").is_empty());
    }

    #[test]
    fn drain_keeps_the_ring_alive() {
        let mut store = BacktraceStore::default();
        store.set_capacity("root", 4);
        store.store("root", event(1));
        assert_eq!(store.drain("root").len(), 1);

        // The ring still exists with its capacity, just empty.
        store.store("root", event(2));
        assert_eq!(store.stored("root"), 1);
    }

    #[test]
    fn erase_removes_the_ring() {
        let mut store = BacktraceStore::default();
        store.set_capacity("root", 4);
        store.store("root", event(1));
        store.erase("root");
        store.store("root", event(2));
        assert!(store.drain("root").is_empty());
    }

    #[test]
    fn shrinking_capacity_discards_oldest() {
        let mut store = BacktraceStore::default();
        store.set_capacity("root", 4);
        for ts in 1..=4 {
            store.store("root", event(ts));
        }
        store.set_capacity("root", 2);
        let stamps: Vec<u64> = store.drain("root").iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![3, 4]);
    }
}
