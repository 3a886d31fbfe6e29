//! Lock-free SPSC byte queues carrying encoded records from producer threads
//! to the backend worker.
//!
//! Both variants share the batch read contract the worker relies on:
//! `prepare_read` exposes a contiguous region starting at a record header,
//! `finish_read` advances a consumer-local cursor per record, and
//! `commit_read` publishes the cumulative consumption once per drain so the
//! shared cursor is touched a single time per cycle.
//!
//! Records never straddle the physical end of a ring. When a record would
//! wrap, the producer stores a one-byte wrap marker and skips the tail
//! remainder; `prepare_read` consumes markers transparently. Every record is
//! therefore prefixed by one opcode byte, and a published byte always
//! belongs to a complete record.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

const WRAP: u8 = 0;
const RECORD: u8 = 1;

const MIN_CAPACITY: usize = 64;

/// Emitted when the unbounded queue's reader crosses into a grown segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub previous_capacity: usize,
    pub new_capacity: usize,
}

/// Bounded SPSC byte ring with power-of-two capacity.
///
/// Cursors are monotonically increasing byte positions; the physical index
/// is `pos & mask`. Each side keeps its own position in a `Cell` plus a
/// cached copy of the other side's shared cursor, so the shared atomics are
/// only touched when the cache runs out.
pub(crate) struct BoundedByteQueue {
    buf: Box<[Cell<u8>]>,
    capacity: usize,
    mask: usize,
    /// Producer-only: next write position and cached committed read cursor.
    write_pos: CachePadded<Cell<usize>>,
    cached_read: Cell<usize>,
    /// Consumer-only: next read position and cached committed write cursor.
    read_pos: CachePadded<Cell<usize>>,
    cached_write: Cell<usize>,
    committed_write: CachePadded<AtomicUsize>,
    committed_read: CachePadded<AtomicUsize>,
}

// SAFETY: the producer thread only touches `write_pos`/`cached_read` and the
// consumer thread only touches `read_pos`/`cached_write`; the byte buffer is
// partitioned between them by the committed cursors, which are the only
// shared state and are accessed with acquire/release ordering.
unsafe impl Send for BoundedByteQueue {}
unsafe impl Sync for BoundedByteQueue {}

impl BoundedByteQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        let buf = (0..capacity).map(|_| Cell::new(0)).collect::<Vec<_>>();
        Self {
            buf: buf.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(Cell::new(0)),
            cached_read: Cell::new(0),
            read_pos: CachePadded::new(Cell::new(0)),
            cached_write: Cell::new(0),
            committed_write: CachePadded::new(AtomicUsize::new(0)),
            committed_read: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn empty(&self) -> bool {
        self.committed_write.load(Ordering::Acquire) == self.committed_read.load(Ordering::Acquire)
    }

    fn slot(&self, pos: usize) -> *mut u8 {
        self.buf[pos & self.mask].as_ptr()
    }

    fn free_for(&self, pos: usize, needed: usize) -> bool {
        let used = pos.wrapping_sub(self.cached_read.get());
        if self.capacity - used >= needed {
            return true;
        }
        self.cached_read
            .set(self.committed_read.load(Ordering::Acquire));
        let used = pos.wrapping_sub(self.cached_read.get());
        self.capacity - used >= needed
    }

    /// Reserves `len` contiguous bytes, lets `fill` write them and publishes
    /// the record. Returns false when the record does not fit.
    pub(crate) fn try_write<F: FnMut(&mut [u8])>(&self, len: usize, fill: &mut F) -> bool {
        let framed = len + 1;
        if framed > self.capacity {
            return false;
        }

        let mut pos = self.write_pos.get();
        let to_end = self.capacity - (pos & self.mask);
        // Total footprint of this publish, counting the skipped tail on wrap.
        let needed = if framed > to_end { to_end + framed } else { framed };

        if !self.free_for(pos, needed) {
            return false;
        }

        if framed > to_end {
            // SAFETY: at least one free byte exists before the physical end
            // and the consumer cannot advance past `committed_write`.
            unsafe { *self.slot(pos) = WRAP };
            pos = pos.wrapping_add(to_end);
        }

        // SAFETY: `framed` free bytes starting at `pos` are contiguous; the
        // wrap above guarantees the region does not cross the physical end.
        unsafe {
            *self.slot(pos) = RECORD;
            let region = std::slice::from_raw_parts_mut(self.slot(pos.wrapping_add(1)), len);
            fill(region);
        }

        let end = pos.wrapping_add(framed);
        self.write_pos.set(end);
        self.committed_write.store(end, Ordering::Release);
        true
    }

    /// Contiguous published bytes starting at the next record header, or
    /// `None` when everything readable has been consumed.
    pub(crate) fn prepare_read(&self) -> Option<&[u8]> {
        loop {
            let pos = self.read_pos.get();
            let mut available = self.cached_write.get().wrapping_sub(pos);
            if available == 0 {
                self.cached_write
                    .set(self.committed_write.load(Ordering::Acquire));
                available = self.cached_write.get().wrapping_sub(pos);
                if available == 0 {
                    return None;
                }
            }

            let to_end = self.capacity - (pos & self.mask);
            // SAFETY: at least one byte up to `cached_write` is published.
            let opcode = unsafe { *self.slot(pos) };
            if opcode == WRAP {
                self.read_pos.set(pos.wrapping_add(to_end));
                continue;
            }

            let readable = available.min(to_end);
            // SAFETY: `readable` published bytes starting at `pos` are
            // contiguous; records never cross the physical end, so the region
            // after the opcode contains the complete record.
            return Some(unsafe {
                std::slice::from_raw_parts(self.slot(pos.wrapping_add(1)), readable - 1)
            });
        }
    }

    pub(crate) fn finish_read(&self, record_bytes: usize) {
        // One extra byte for the record opcode.
        self.read_pos
            .set(self.read_pos.get().wrapping_add(record_bytes + 1));
    }

    pub(crate) fn commit_read(&self) {
        self.committed_read
            .store(self.read_pos.get(), Ordering::Release);
    }
}

struct Segment {
    ring: BoundedByteQueue,
    next: AtomicPtr<Segment>,
}

impl Segment {
    fn alloc(capacity: usize) -> *mut Segment {
        Box::into_raw(Box::new(Segment {
            ring: BoundedByteQueue::new(capacity),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded SPSC byte queue: a chain of bounded segments.
///
/// When a record does not fit, the producer allocates a segment of at least
/// twice the capacity, writes the record there and links it. The consumer
/// drains a segment completely, follows the link, frees the old segment and
/// surfaces an [`AllocationInfo`] so the worker can report the growth.
pub(crate) struct UnboundedByteQueue {
    /// Producer-only.
    producer_seg: Cell<*mut Segment>,
    /// Consumer-only.
    consumer_seg: Cell<*mut Segment>,
}

// SAFETY: `producer_seg` is only touched by the producer thread and
// `consumer_seg` only by the consumer thread; segment handoff goes through
// the `next` atomic with release/acquire ordering and a drained segment is
// freed by the consumer only after the producer has permanently moved on.
unsafe impl Send for UnboundedByteQueue {}
unsafe impl Sync for UnboundedByteQueue {}

impl UnboundedByteQueue {
    pub(crate) fn new(initial_capacity: usize) -> Self {
        let seg = Segment::alloc(initial_capacity);
        Self {
            producer_seg: Cell::new(seg),
            consumer_seg: Cell::new(seg),
        }
    }

    /// Writes a record, growing the queue when the current segment is full.
    pub(crate) fn write<F: FnMut(&mut [u8])>(&self, len: usize, fill: &mut F) {
        // SAFETY: producer_seg always points at a live segment and is only
        // dereferenced on the producer thread.
        let seg = unsafe { &*self.producer_seg.get() };
        if seg.ring.try_write(len, fill) {
            return;
        }

        let new_capacity = (seg.ring.capacity() * 2).max((len + 2).next_power_of_two());
        let new_seg = Segment::alloc(new_capacity);
        // SAFETY: freshly allocated, not yet visible to the consumer.
        let wrote = unsafe { (*new_seg).ring.try_write(len, fill) };
        debug_assert!(wrote, "record must fit a freshly grown segment");
        seg.next.store(new_seg, Ordering::Release);
        self.producer_seg.set(new_seg);
    }

    pub(crate) fn prepare_read(&self) -> (Option<&[u8]>, Option<AllocationInfo>) {
        let mut allocation = None;
        loop {
            // SAFETY: consumer_seg always points at a live segment and is
            // only dereferenced on the consumer thread.
            let seg = unsafe { &*self.consumer_seg.get() };
            if let Some(bytes) = seg.ring.prepare_read() {
                return (Some(bytes), allocation);
            }

            let next = seg.next.load(Ordering::Acquire);
            if next.is_null() {
                return (None, allocation);
            }

            // The acquire above orders the producer's final records in this
            // segment before the link became visible; look once more before
            // abandoning it.
            if let Some(bytes) = seg.ring.prepare_read() {
                return (Some(bytes), allocation);
            }

            allocation = Some(AllocationInfo {
                previous_capacity: seg.ring.capacity(),
                // SAFETY: a linked segment is fully constructed.
                new_capacity: unsafe { (*next).ring.capacity() },
            });
            let drained = self.consumer_seg.replace(next);
            // SAFETY: the producer moved on permanently when it linked
            // `next` and the segment is fully drained; nothing references it.
            unsafe { drop(Box::from_raw(drained)) };
        }
    }

    pub(crate) fn finish_read(&self, record_bytes: usize) {
        // SAFETY: consumer thread only.
        unsafe { &*self.consumer_seg.get() }.ring.finish_read(record_bytes);
    }

    pub(crate) fn commit_read(&self) {
        // SAFETY: consumer thread only.
        unsafe { &*self.consumer_seg.get() }.ring.commit_read();
    }

    /// Capacity of the segment the reader is currently draining; bounds the
    /// bytes the worker takes from this producer per cycle.
    pub(crate) fn read_capacity(&self) -> usize {
        // SAFETY: consumer thread only.
        unsafe { &*self.consumer_seg.get() }.ring.capacity()
    }

    /// Consumer-side emptiness; only meaningful on the consumer thread.
    pub(crate) fn empty(&self) -> bool {
        // SAFETY: consumer thread only.
        let seg = unsafe { &*self.consumer_seg.get() };
        seg.ring.empty() && seg.next.load(Ordering::Acquire).is_null()
    }
}

impl Drop for UnboundedByteQueue {
    fn drop(&mut self) {
        let mut cur = self.consumer_seg.get();
        while !cur.is_null() {
            // SAFETY: drop has exclusive access; the chain is owned here.
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { drop(Box::from_raw(cur)) };
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn write_payload(q: &BoundedByteQueue, payload: &[u8]) -> bool {
        let mut fill = |buf: &mut [u8]| buf.copy_from_slice(payload);
        q.try_write(payload.len(), &mut fill)
    }

    fn read_payload(q: &BoundedByteQueue, len: usize) -> Option<Vec<u8>> {
        let bytes = q.prepare_read()?;
        assert!(bytes.len() >= len, "published region shorter than a record");
        let out = bytes[..len].to_vec();
        q.finish_read(len);
        q.commit_read();
        Some(out)
    }

    #[test]
    fn test_basic_write_read() {
        println!("\n=== Test: Basic Write/Read ===");
        let q = BoundedByteQueue::new(64);

        assert!(q.empty());
        assert!(write_payload(&q, b"hello"));
        assert!(!q.empty());

        let got = read_payload(&q, 5).expect("should have a record");
        assert_eq!(got, b"hello");
        assert!(q.empty());
        assert!(q.prepare_read().is_none());
        println!("✓ Test passed\n");
    }

    #[test]
    fn test_rejects_when_full() {
        println!("\n=== Test: Rejects When Full ===");
        let q = BoundedByteQueue::new(64);
        let payload = [7u8; 20];

        let mut written = 0;
        while write_payload(&q, &payload) {
            written += 1;
        }
        println!("Wrote {written} records before filling up");
        assert!(written >= 2);
        assert!(!write_payload(&q, &payload));

        // Draining one record makes room again.
        read_payload(&q, payload.len()).unwrap();
        assert!(write_payload(&q, &payload));
        println!("✓ Test passed\n");
    }

    #[test]
    fn test_record_larger_than_capacity() {
        let q = BoundedByteQueue::new(64);
        let huge = vec![1u8; 128];
        assert!(!write_payload(&q, &huge));
        assert!(q.empty());
    }

    #[test]
    fn test_wrap_around() {
        println!("\n=== Test: Wrap Around ===");
        let q = BoundedByteQueue::new(64);

        // Alternating writes and reads of uneven sizes force the cursor over
        // the physical end many times.
        for round in 0..200u32 {
            let len = 1 + (round as usize * 7) % 23;
            let payload: Vec<u8> = (0..len).map(|i| (round as u8).wrapping_add(i as u8)).collect();
            assert!(write_payload(&q, &payload), "round {round} did not fit");
            let got = read_payload(&q, len).expect("record just written");
            assert_eq!(got, payload, "round {round} corrupted");
        }
        assert!(q.empty());
        println!("✓ Test passed\n");
    }

    #[test]
    fn test_deferred_record_stays_readable() {
        let q = BoundedByteQueue::new(64);
        assert!(write_payload(&q, b"abc"));

        // Peek without finishing: the record must still be there afterwards.
        let first = q.prepare_read().unwrap()[..3].to_vec();
        let again = q.prepare_read().unwrap()[..3].to_vec();
        assert_eq!(first, again);

        q.finish_read(3);
        q.commit_read();
        assert!(q.empty());
    }

    #[test]
    fn test_spsc_across_threads() {
        println!("\n=== Test: SPSC Across Threads ===");
        let q = Arc::new(BoundedByteQueue::new(256));
        let total = 10_000u32;

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for seq in 0..total {
                    let mut fill = |buf: &mut [u8]| buf.copy_from_slice(&seq.to_ne_bytes());
                    while !q.try_write(4, &mut fill) {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let start = Instant::now();
        let mut expected = 0u32;
        while expected < total {
            if let Some(bytes) = q.prepare_read() {
                let mut seq = [0u8; 4];
                seq.copy_from_slice(&bytes[..4]);
                assert_eq!(u32::from_ne_bytes(seq), expected, "records out of order");
                expected += 1;
                q.finish_read(4);
                q.commit_read();
            } else if start.elapsed() > Duration::from_secs(10) {
                panic!("timeout, consumed only {expected} records");
            }
        }

        producer.join().unwrap();
        assert!(q.empty());
        println!("Consumed {expected} records in order");
        println!("✓ Test passed\n");
    }

    #[test]
    fn test_unbounded_growth_reports_allocation() {
        println!("\n=== Test: Unbounded Growth ===");
        let q = UnboundedByteQueue::new(64);

        // Overfill the initial segment without draining.
        let payload = [9u8; 24];
        for _ in 0..8 {
            let mut fill = |buf: &mut [u8]| buf.copy_from_slice(&payload);
            q.write(payload.len(), &mut fill);
        }

        let mut records = 0;
        let mut allocations = Vec::new();
        loop {
            let (bytes, allocation) = q.prepare_read();
            if let Some(info) = allocation {
                allocations.push(info);
            }
            let Some(bytes) = bytes else { break };
            assert_eq!(&bytes[..payload.len()], &payload);
            q.finish_read(payload.len());
            q.commit_read();
            records += 1;
        }

        assert_eq!(records, 8);
        assert!(!allocations.is_empty(), "growth must be reported");
        for info in &allocations {
            println!(
                "Segment grew from {} to {} bytes",
                info.previous_capacity, info.new_capacity
            );
            assert!(info.new_capacity > info.previous_capacity);
        }
        assert!(q.empty());
        println!("✓ Test passed\n");
    }

    #[test]
    fn test_unbounded_record_larger_than_segment() {
        let q = UnboundedByteQueue::new(64);
        let big: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let mut fill = |buf: &mut [u8]| buf.copy_from_slice(&big);
        q.write(big.len(), &mut fill);

        let (bytes, _allocation) = q.prepare_read();
        let bytes = bytes.expect("record present");
        assert_eq!(&bytes[..big.len()], &big[..]);
        q.finish_read(big.len());
        q.commit_read();
        assert!(q.empty());
    }
}
