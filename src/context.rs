//! Producer-side thread contexts and their registry.
//!
//! Each logging thread owns one [`ThreadContext`] carrying its SPSC byte
//! queue, a failure counter and a validity flag. The backend worker is the
//! only other party: it drains the queue, owns the context's transit-event
//! ring, and unregisters the context once it is invalid and fully drained.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use crate::backend::WorkerShared;
use crate::queue::{AllocationInfo, BoundedByteQueue, UnboundedByteQueue};
use crate::transit::TransitEventRing;

/// Queue variant a producer registers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Fixed capacity; a full queue drops the record and counts the drop.
    BoundedDropping { capacity: usize },
    /// Fixed capacity; a full queue spins the producer until space frees up
    /// and counts one blocking occurrence per stall.
    BoundedBlocking { capacity: usize },
    /// Grows by relinking segments; reallocations are reported, not errors.
    Unbounded { initial_capacity: usize },
}

enum FrontendQueue {
    Bounded {
        queue: BoundedByteQueue,
        blocking: bool,
    },
    Unbounded(UnboundedByteQueue),
}

pub(crate) struct QueueReadResult<'a> {
    pub bytes: Option<&'a [u8]>,
    pub allocation: Option<AllocationInfo>,
}

pub(crate) struct ThreadContext {
    thread_id: u64,
    thread_name: Arc<str>,
    queue: FrontendQueue,
    /// Drops for a dropping queue, blocking occurrences for a blocking one.
    failure_count: AtomicUsize,
    valid: AtomicBool,
    /// Owned by the backend worker; producers never touch it. Holding it
    /// here keeps the context and its pending events in one place until
    /// both are drained.
    transit_ring: UnsafeCell<TransitEventRing>,
}

// SAFETY: the queue endpoints are single-producer/single-consumer by
// construction (the owning thread writes, the worker reads) and the transit
// ring behind the UnsafeCell is only ever accessed by the worker thread.
unsafe impl Send for ThreadContext {}
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    pub(crate) fn new(kind: QueueKind) -> Arc<Self> {
        let queue = match kind {
            QueueKind::BoundedDropping { capacity } => FrontendQueue::Bounded {
                queue: BoundedByteQueue::new(capacity),
                blocking: false,
            },
            QueueKind::BoundedBlocking { capacity } => FrontendQueue::Bounded {
                queue: BoundedByteQueue::new(capacity),
                blocking: true,
            },
            QueueKind::Unbounded { initial_capacity } => {
                FrontendQueue::Unbounded(UnboundedByteQueue::new(initial_capacity))
            }
        };

        let current = std::thread::current();
        Arc::new(Self {
            thread_id: current_thread_id(),
            thread_name: Arc::from(current.name().unwrap_or("unnamed")),
            queue,
            failure_count: AtomicUsize::new(0),
            valid: AtomicBool::new(true),
            transit_ring: UnsafeCell::new(TransitEventRing::new()),
        })
    }

    pub(crate) fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub(crate) fn thread_name(&self) -> Arc<str> {
        Arc::clone(&self.thread_name)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn is_bounded(&self) -> bool {
        matches!(self.queue, FrontendQueue::Bounded { .. })
    }

    pub(crate) fn is_dropping(&self) -> bool {
        matches!(
            self.queue,
            FrontendQueue::Bounded { blocking: false, .. }
        )
    }

    pub(crate) fn take_failure_count(&self) -> usize {
        self.failure_count.swap(0, Ordering::Relaxed)
    }

    /// Producer side: writes one encoded record per the queue's policy.
    /// Returns false only when the record was dropped.
    pub(crate) fn write_record<F: FnMut(&mut [u8])>(&self, len: usize, fill: &mut F) -> bool {
        match &self.queue {
            FrontendQueue::Bounded { queue, blocking } => {
                if queue.try_write(len, fill) {
                    return true;
                }
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                if !*blocking || len + 1 > queue.capacity() {
                    return false;
                }
                let backoff = Backoff::new();
                loop {
                    backoff.snooze();
                    if queue.try_write(len, fill) {
                        return true;
                    }
                }
            }
            FrontendQueue::Unbounded(queue) => {
                queue.write(len, fill);
                true
            }
        }
    }

    pub(crate) fn prepare_read(&self) -> QueueReadResult<'_> {
        match &self.queue {
            FrontendQueue::Bounded { queue, .. } => QueueReadResult {
                bytes: queue.prepare_read(),
                allocation: None,
            },
            FrontendQueue::Unbounded(queue) => {
                let (bytes, allocation) = queue.prepare_read();
                QueueReadResult { bytes, allocation }
            }
        }
    }

    pub(crate) fn finish_read(&self, record_bytes: usize) {
        match &self.queue {
            FrontendQueue::Bounded { queue, .. } => queue.finish_read(record_bytes),
            FrontendQueue::Unbounded(queue) => queue.finish_read(record_bytes),
        }
    }

    pub(crate) fn commit_read(&self) {
        match &self.queue {
            FrontendQueue::Bounded { queue, .. } => queue.commit_read(),
            FrontendQueue::Unbounded(queue) => queue.commit_read(),
        }
    }

    /// Bounds the bytes the worker reads from this producer per cycle.
    pub(crate) fn queue_capacity(&self) -> usize {
        match &self.queue {
            FrontendQueue::Bounded { queue, .. } => queue.capacity(),
            FrontendQueue::Unbounded(queue) => queue.read_capacity(),
        }
    }

    pub(crate) fn queue_empty(&self) -> bool {
        match &self.queue {
            FrontendQueue::Bounded { queue, .. } => queue.empty(),
            FrontendQueue::Unbounded(queue) => queue.empty(),
        }
    }

    /// # Safety
    /// Only the backend worker thread may call this; the ring has a single
    /// owner and no internal synchronization.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn transit_ring_mut(&self) -> &mut TransitEventRing {
        &mut *self.transit_ring.get()
    }

    /// # Safety
    /// Only the backend worker thread may call this.
    pub(crate) unsafe fn transit_ring(&self) -> &TransitEventRing {
        &*self.transit_ring.get()
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn current_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::gettid() as u64 }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn current_thread_id() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static THREAD_ID: u64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    THREAD_ID.with(|id| *id)
}

/// Tracks live producer contexts for the worker.
///
/// Producers append under the registry lock; the worker observes additions
/// through a monotonic new-context flag it checks and clears once per cycle,
/// and it is the only remover.
#[derive(Default)]
pub(crate) struct ThreadContextRegistry {
    contexts: Mutex<Vec<Arc<ThreadContext>>>,
    new_context: AtomicBool,
    invalidated: AtomicBool,
}

impl ThreadContextRegistry {
    pub(crate) fn register(&self, ctx: Arc<ThreadContext>) {
        self.contexts.lock().push(ctx);
        self.new_context.store(true, Ordering::Release);
    }

    pub(crate) fn take_new_context_flag(&self) -> bool {
        self.new_context.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ThreadContext>> {
        self.contexts.lock().clone()
    }

    /// Taken under the registry lock so it cannot race with the worker
    /// clearing the hint in `remove` after sweeping the last invalid
    /// context.
    pub(crate) fn note_invalidated(&self) {
        let _contexts = self.contexts.lock();
        self.invalidated.store(true, Ordering::Release);
    }

    pub(crate) fn has_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub(crate) fn remove(&self, ctx: &Arc<ThreadContext>) {
        let mut contexts = self.contexts.lock();
        contexts.retain(|existing| !Arc::ptr_eq(existing, ctx));
        if !contexts.iter().any(|c| !c.is_valid()) {
            self.invalidated.store(false, Ordering::Release);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.lock().len()
    }
}

/// Per-thread registration handle handed out by the backend.
///
/// Not `Send`: the queue producer side belongs to the registering thread.
/// Dropping it marks the context invalid; the worker unregisters the context
/// once its queue and transit ring are both empty.
pub struct Producer {
    ctx: Arc<ThreadContext>,
    registry: Arc<ThreadContextRegistry>,
    shared: Arc<WorkerShared>,
    _not_send: PhantomData<*const ()>,
}

impl Producer {
    pub(crate) fn register(
        registry: Arc<ThreadContextRegistry>,
        shared: Arc<WorkerShared>,
        kind: QueueKind,
    ) -> Self {
        let ctx = ThreadContext::new(kind);
        registry.register(Arc::clone(&ctx));
        shared.notify();
        Self {
            ctx,
            registry,
            shared,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn context(&self) -> &ThreadContext {
        &self.ctx
    }

    pub(crate) fn worker_running(&self) -> bool {
        self.shared.running()
    }

    pub(crate) fn notify_worker(&self) {
        self.shared.notify();
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.ctx.invalidate();
        self.registry.note_invalidated();
        self.shared.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_raises_new_context_flag_once() {
        let registry = ThreadContextRegistry::default();
        assert!(!registry.take_new_context_flag());

        registry.register(ThreadContext::new(QueueKind::BoundedDropping { capacity: 64 }));
        assert!(registry.take_new_context_flag());
        assert!(!registry.take_new_context_flag());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn dropping_queue_counts_failures() {
        let ctx = ThreadContext::new(QueueKind::BoundedDropping { capacity: 64 });
        let payload = [0u8; 40];

        let mut fill = |buf: &mut [u8]| buf.copy_from_slice(&payload);
        assert!(ctx.write_record(payload.len(), &mut fill));
        // The ring can hold one 41-byte frame; the next two records drop.
        assert!(!ctx.write_record(payload.len(), &mut fill));
        assert!(!ctx.write_record(payload.len(), &mut fill));

        assert_eq!(ctx.take_failure_count(), 2);
        assert_eq!(ctx.take_failure_count(), 0);
    }

    #[test]
    fn oversized_record_is_dropped_even_when_blocking() {
        let ctx = ThreadContext::new(QueueKind::BoundedBlocking { capacity: 64 });
        let huge = [0u8; 128];
        let mut fill = |buf: &mut [u8]| buf.copy_from_slice(&huge);
        assert!(!ctx.write_record(huge.len(), &mut fill));
        assert_eq!(ctx.take_failure_count(), 1);
    }

    #[test]
    fn removing_last_invalid_context_clears_hint() {
        let registry = ThreadContextRegistry::default();
        let ctx = ThreadContext::new(QueueKind::Unbounded { initial_capacity: 64 });
        registry.register(Arc::clone(&ctx));

        ctx.invalidate();
        registry.note_invalidated();
        assert!(registry.has_invalidated());

        registry.remove(&ctx);
        assert!(!registry.has_invalidated());
        assert_eq!(registry.len(), 0);
    }
}
