//! Backend-side reconstructed records and the reusable slot ring they live
//! in. Slots are recycled across cycles, so every conditionally-written
//! field is reset by the decoder instead of relying on defaults.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::level::Level;
use crate::logger::Logger;
use crate::record::{decode_args, DecoderFn, EventKind, Metadata};

static RESET_METADATA: Metadata =
    Metadata::new("", "", Level::None, EventKind::Log);

/// A fully reconstructed record awaiting sink dispatch.
pub(crate) struct TransitEvent {
    /// Nanoseconds since the Unix epoch, whatever the producer's clock was.
    pub timestamp: u64,
    pub thread_id: u64,
    pub thread_name: Arc<str>,
    pub metadata: &'static Metadata,
    /// Kept alive by the logger registry until the gated removal in the
    /// worker's idle cleanup.
    pub logger: *const Logger,
    pub decoder: DecoderFn,
    pub formatted_msg: String,
    pub named_args: Option<Vec<(String, String)>>,
    pub flush_flag: Option<*const AtomicBool>,
    pub dynamic_level: Level,
}

// SAFETY: the raw pointers refer to `'static` metadata, registry-owned
// loggers and flush flags owned by a producer blocked on them; all stay
// valid wherever the worker thread consumes the event.
unsafe impl Send for TransitEvent {}

impl Default for TransitEvent {
    fn default() -> Self {
        Self {
            timestamp: 0,
            thread_id: 0,
            thread_name: Arc::from(""),
            metadata: &RESET_METADATA,
            logger: std::ptr::null(),
            decoder: decode_args,
            formatted_msg: String::new(),
            named_args: None,
            flush_flag: None,
            dynamic_level: Level::None,
        }
    }
}

impl TransitEvent {
    /// Statement severity, honouring dynamic-level call sites.
    pub(crate) fn log_level(&self) -> Level {
        if self.metadata.log_level() == Level::Dynamic {
            self.dynamic_level
        } else {
            self.metadata.log_level()
        }
    }
}

/// Grow-only ring of reusable transit-event slots, one per producer.
///
/// `back` stages a slot for the decoder to fill; `push_back` commits it.
/// A staged slot that is never committed (a deferred record) is simply
/// handed out again on the next `back` call. Popped slots return to the
/// pool with their string capacity intact, so the hot path stops
/// allocating once the ring has warmed up.
#[derive(Default)]
pub(crate) struct TransitEventRing {
    live: VecDeque<TransitEvent>,
    pool: Vec<TransitEvent>,
    staged: Option<TransitEvent>,
}

impl TransitEventRing {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reserve(&mut self, slots: usize) {
        self.live.reserve(slots);
        while self.pool.len() + self.live.len() < slots {
            self.pool.push(TransitEvent::default());
        }
    }

    pub(crate) fn back(&mut self) -> &mut TransitEvent {
        if self.staged.is_none() {
            self.staged = Some(self.pool.pop().unwrap_or_default());
        }
        self.staged.as_mut().expect("staged slot just ensured")
    }

    pub(crate) fn push_back(&mut self) {
        let event = self.staged.take().expect("push_back without a staged slot");
        self.live.push_back(event);
    }

    pub(crate) fn front(&self) -> Option<&TransitEvent> {
        self.live.front()
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut TransitEvent> {
        self.live.front_mut()
    }

    pub(crate) fn pop_front(&mut self) {
        if let Some(mut event) = self.live.pop_front() {
            event.formatted_msg.clear();
            self.pool.push(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut ring = TransitEventRing::new();
        for ts in [10u64, 20, 30] {
            ring.back().timestamp = ts;
            ring.push_back();
        }
        assert_eq!(ring.len(), 3);
        for expected in [10u64, 20, 30] {
            assert_eq!(ring.front().unwrap().timestamp, expected);
            ring.pop_front();
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn abandoned_slot_is_reused() {
        let mut ring = TransitEventRing::new();
        ring.back().timestamp = 99;
        // Never committed: the next back() must hand out the same staging slot.
        assert_eq!(ring.back().timestamp, 99);
        assert!(ring.is_empty());
    }

    #[test]
    fn popped_slot_keeps_string_capacity() {
        let mut ring = TransitEventRing::new();
        ring.back().formatted_msg.push_str("a fairly long formatted message");
        ring.push_back();
        ring.pop_front();

        let slot = ring.back();
        assert!(slot.formatted_msg.is_empty());
        assert!(slot.formatted_msg.capacity() > 0);
    }

    #[test]
    fn reserve_prewarms_pool() {
        let mut ring = TransitEventRing::new();
        ring.reserve(8);
        assert!(ring.is_empty());
        for ts in 0..8u64 {
            ring.back().timestamp = ts;
            ring.push_back();
        }
        assert_eq!(ring.len(), 8);
    }
}
