//! The backend worker: the single consumer draining every producer queue.
//!
//! One cycle of the main loop reads bounded batches from each live producer
//! into that producer's transit-event ring (decode, timestamp conversion,
//! formatting), then repeatedly pops the globally minimum-timestamped event
//! across all rings and writes it to the sinks of its logger. With nothing
//! to do it performs maintenance (sink flush and periodic tasks, failure
//! reports, TSC resync, lifecycle cleanup) and parks until a producer
//! notifies or the sleep bound elapses.
//!
//! Everything here runs on the worker thread; the shared surface is the
//! [`WorkerShared`] block producers and the public handle poke at.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_utils::sync::{Parker, Unparker};
use time::format_description::FormatItem;
use time::{OffsetDateTime, UtcOffset};

use crate::backtrace::BacktraceStore;
use crate::clock::{wall_clock_ns, TscClock};
use crate::config::{BackendOptions, NO_CPU_AFFINITY};
use crate::context::{current_thread_id, ThreadContext, ThreadContextRegistry};
use crate::format::{
    format_and_split_arguments, FormatterCache, NamedArgTemplateCache, DEFAULT_PATTERN,
    DEFAULT_TIME_PATTERN,
};
use crate::level::Level;
use crate::logger::{ClockSource, Logger, LoggerRegistry};
use crate::record::{
    format_message, ArgStore, ByteReader, DecoderFn, EventKind, Metadata, RecordHeader,
};
use crate::sink::{Sink, SinkRecord, SinkRegistry};
use crate::transit::TransitEventRing;

/// State shared between the worker thread, the public handle and the
/// producers: the running flag, the wake-up notifier and the lazily
/// published TSC clock.
pub(crate) struct WorkerShared {
    /// Doubles as the run flag: the worker sets it once ready, `stop`
    /// swaps it false.
    pub(crate) is_worker_running: AtomicBool,
    pub(crate) worker_thread_id: AtomicU64,
    /// Release-published by the worker on lazy init, nulled on exit.
    tsc_clock: AtomicPtr<TscClock>,
    unparker: Unparker,
}

impl WorkerShared {
    pub(crate) fn new(unparker: Unparker) -> Self {
        Self {
            is_worker_running: AtomicBool::new(false),
            worker_thread_id: AtomicU64::new(0),
            tsc_clock: AtomicPtr::new(ptr::null_mut()),
            unparker,
        }
    }

    pub(crate) fn running(&self) -> bool {
        self.is_worker_running.load(Ordering::Relaxed)
    }

    pub(crate) fn notify(&self) {
        self.unparker.unpark();
    }

    /// Converts a raw counter value through the worker's TSC clock.
    /// Returns 0 while the clock has not been initialised (or after exit).
    pub(crate) fn time_since_epoch(&self, tsc: u64) -> u64 {
        let clock = self.tsc_clock.load(Ordering::Acquire);
        if clock.is_null() {
            return 0;
        }
        // SAFETY: a non-null acquire load observes a fully constructed
        // clock; the worker destroys it only after its loop has exited.
        unsafe { &*clock }.time_since_epoch_safe(tsc)
    }
}

enum DecodeOutcome {
    /// Record fully reconstructed; this many bytes were consumed.
    Consumed(usize),
    /// Strict-order cut-off hit: leave the record logically unread and
    /// retry it next cycle.
    Deferred,
}

pub(crate) struct BackendWorker {
    opts: BackendOptions,
    shared: Arc<WorkerShared>,
    ctx_registry: Arc<ThreadContextRegistry>,
    logger_registry: Arc<LoggerRegistry>,
    sink_registry: Arc<SinkRegistry>,
    parker: Parker,
    /// Local cache of live producers, rebuilt when the registry raises its
    /// new-context flag.
    contexts: Vec<Arc<ThreadContext>>,
    formatter_cache: FormatterCache,
    named_templates: NamedArgTemplateCache,
    backtrace: BacktraceStore,
    /// Reused across records so the hot path does not allocate.
    arg_store: ArgStore,
    active_sinks: Vec<Weak<dyn Sink>>,
    line_buf: String,
    named_fmt_buf: String,
    split_buf: String,
    process_id: String,
    last_resync: Instant,
}

impl BackendWorker {
    pub(crate) fn new(
        opts: BackendOptions,
        shared: Arc<WorkerShared>,
        ctx_registry: Arc<ThreadContextRegistry>,
        logger_registry: Arc<LoggerRegistry>,
        sink_registry: Arc<SinkRegistry>,
        parker: Parker,
    ) -> Self {
        Self {
            opts,
            shared,
            ctx_registry,
            logger_registry,
            sink_registry,
            parker,
            contexts: Vec::new(),
            formatter_cache: FormatterCache::default(),
            named_templates: NamedArgTemplateCache::default(),
            backtrace: BacktraceStore::default(),
            arg_store: ArgStore::new(),
            active_sinks: Vec::new(),
            line_buf: String::new(),
            named_fmt_buf: String::new(),
            split_buf: String::new(),
            process_id: std::process::id().to_string(),
            last_resync: Instant::now(),
        }
    }

    /// Worker thread entry point.
    pub(crate) fn thread_main(&mut self) {
        if self.opts.backend_cpu_affinity != NO_CPU_AFFINITY {
            if let Err(e) = set_cpu_affinity(self.opts.backend_cpu_affinity) {
                self.opts.notify_error(&e);
            }
        }

        self.shared
            .worker_thread_id
            .store(current_thread_id(), Ordering::Relaxed);
        self.shared.is_worker_running.store(true, Ordering::SeqCst);

        while self.shared.is_worker_running.load(Ordering::Relaxed) {
            if catch_unwind(AssertUnwindSafe(|| self.main_loop())).is_err() {
                self.opts.notify_error("Caught unhandled exception.");
            }
        }

        if catch_unwind(AssertUnwindSafe(|| self.exit())).is_err() {
            self.opts.notify_error("Caught unhandled exception.");
        }
    }

    pub(crate) fn main_loop(&mut self) {
        self.update_contexts_cache();

        let cached = self.populate_transit_events();

        if cached > 0 {
            if cached < self.opts.transit_events_soft_limit as usize {
                // Process one event, then give priority to the queues again.
                self.process_next_event();
            } else {
                while self.process_next_event() {}
            }
            return;
        }

        // Nothing buffered: maintenance time.
        self.flush_and_run_active_sinks(true);
        self.report_failure_counters();
        self.resync_tsc();

        if self.queues_and_rings_empty() {
            self.cleanup_invalidated_contexts();
            self.cleanup_invalidated_loggers();

            if !self.opts.sleep_duration.is_zero() {
                self.parker.park_timeout(self.opts.sleep_duration);
                // TSC samples go stale while parked.
                self.resync_tsc();
            } else if self.opts.enable_yield_when_idle {
                std::thread::yield_now();
            }
        }
    }

    /// Drain-to-empty run after `stop`, then the final flush and the TSC
    /// clock teardown.
    pub(crate) fn exit(&mut self) {
        self.update_contexts_cache();

        loop {
            let cached = self.populate_transit_events();
            if cached > 0 {
                if cached < self.opts.transit_events_soft_limit as usize {
                    self.process_next_event();
                } else {
                    while self.process_next_event() {}
                }
                continue;
            }

            let drained = !self.opts.wait_for_queues_to_empty_before_exit
                || self.queues_and_rings_empty();
            if drained {
                self.report_failure_counters();
                self.flush_and_run_active_sinks(false);
                break;
            }
        }

        let clock = self.shared.tsc_clock.load(Ordering::Relaxed);
        self.shared.tsc_clock.store(ptr::null_mut(), Ordering::Release);
        if !clock.is_null() {
            // SAFETY: the worker is the sole creator of the clock and its
            // loop has exited; readers observe the null store.
            unsafe { drop(Box::from_raw(clock)) };
        }
    }

    fn update_contexts_cache(&mut self) {
        if self.ctx_registry.take_new_context_flag() {
            self.contexts = self.ctx_registry.snapshot();
            let initial = self.opts.transit_event_buffer_initial_capacity as usize;
            for ctx in &self.contexts {
                // SAFETY: transit rings are only touched on the worker thread.
                unsafe { ctx.transit_ring_mut() }.reserve(initial);
            }
        }
    }

    /// Phase 1: reads bounded batches from every producer queue into the
    /// per-producer rings. Returns the total number of buffered events.
    pub(crate) fn populate_transit_events(&mut self) -> usize {
        let ts_now_us = if self.opts.enable_strict_log_timestamp_order {
            wall_clock_ns() / 1_000
        } else {
            0
        };

        let mut cached = 0;
        for i in 0..self.contexts.len() {
            let ctx = Arc::clone(&self.contexts[i]);
            cached += self.read_and_decode_queue(&ctx, ts_now_us);
        }
        cached
    }

    fn read_and_decode_queue(&mut self, ctx: &Arc<ThreadContext>, ts_now_us: u64) -> usize {
        // SAFETY: transit rings are only touched on the worker thread.
        let ring = unsafe { ctx.transit_ring_mut() };
        let queue_capacity = ctx.queue_capacity();
        let hard_limit = self.opts.transit_events_hard_limit as usize;
        let mut total_bytes = 0usize;

        loop {
            let read = ctx.prepare_read();
            if let Some(info) = read.allocation {
                self.report_allocation(ctx, info.previous_capacity, info.new_capacity);
            }
            let Some(bytes) = read.bytes else { break };

            match self.decode_record(ctx, ring, bytes, ts_now_us) {
                DecodeOutcome::Consumed(n) => {
                    ctx.finish_read(n);
                    total_bytes += n;
                }
                DecodeOutcome::Deferred => break,
            }

            // At most one full queue per producer per cycle, and no more
            // events than the hard limit leaves room for.
            if total_bytes >= queue_capacity || ring.len() >= hard_limit {
                break;
            }
        }

        if total_bytes > 0 {
            // Single shared-cursor update per drain.
            ctx.commit_read();
        }

        ring.len()
    }

    fn decode_record(
        &mut self,
        ctx: &Arc<ThreadContext>,
        ring: &mut TransitEventRing,
        bytes: &[u8],
        ts_now_us: u64,
    ) -> DecodeOutcome {
        let mut reader = ByteReader::new(bytes);
        let header = RecordHeader::decode(&mut reader);

        // SAFETY: the registration protocol guarantees both referents
        // outlive the record: metadata is `'static` and the logger is kept
        // by the registry until the gated removal.
        let metadata: &'static Metadata = unsafe { &*(header.metadata as *const Metadata) };
        let logger: &Logger = unsafe { &*(header.logger as *const Logger) };
        // SAFETY: produced from a `DecoderFn` by the frontend encoder.
        let decoder: DecoderFn = unsafe { std::mem::transmute(header.decoder) };

        if logger.pattern_formatter().get().is_none() {
            let formatter = match self.formatter_cache.find_or_create(
                logger.format_pattern(),
                logger.time_pattern(),
                logger.timezone(),
            ) {
                Ok(formatter) => formatter,
                Err(e) => {
                    self.opts.notify_error(&format!(
                        "cannot build formatter for logger \"{}\": {e}",
                        logger.name()
                    ));
                    self.formatter_cache
                        .find_or_create(DEFAULT_PATTERN, DEFAULT_TIME_PATTERN, logger.timezone())
                        .expect("default pattern is valid")
                }
            };
            let _ = logger.pattern_formatter().set(formatter);
        }

        let event = ring.back();
        event.timestamp = header.timestamp;
        event.thread_id = ctx.thread_id();
        event.thread_name = ctx.thread_name();
        event.metadata = metadata;
        event.logger = header.logger as *const Logger;
        event.decoder = decoder;

        match logger.clock_source() {
            ClockSource::Tsc => {
                let clock = self.tsc_clock_or_init();
                event.timestamp = clock.time_since_epoch_safe(event.timestamp);
                if ts_now_us != 0 && event.timestamp / 1_000 >= ts_now_us {
                    return DecodeOutcome::Deferred;
                }
            }
            ClockSource::System => {
                if ts_now_us != 0 && event.timestamp / 1_000 >= ts_now_us {
                    return DecodeOutcome::Deferred;
                }
            }
            // A caller-supplied timestamp cannot be compared against ours.
            ClockSource::User => {}
        }

        if metadata.event_kind() != EventKind::Flush {
            if !metadata.has_named_args() {
                if let Some(named) = event.named_args.as_mut() {
                    named.clear();
                }
                self.arg_store.clear();
                decoder(&mut reader, &mut self.arg_store);

                event.formatted_msg.clear();
                if let Err(e) = format_message(
                    metadata.message_format(),
                    self.arg_store.values(),
                    &mut event.formatted_msg,
                ) {
                    let error = format_error_line(metadata, &e.to_string());
                    event.formatted_msg.clear();
                    event.formatted_msg.push_str(&error);
                    self.opts.notify_error(&error);
                }
            } else {
                let template = self.named_templates.get_or_parse(metadata.message_format());
                let named = event.named_args.get_or_insert_with(Vec::new);
                named.clear();
                for name in &template.1 {
                    named.push((name.clone(), String::new()));
                }

                self.arg_store.clear();
                decoder(&mut reader, &mut self.arg_store);

                event.formatted_msg.clear();
                let mut result = format_message(
                    &template.0,
                    self.arg_store.values(),
                    &mut event.formatted_msg,
                );
                if result.is_ok() {
                    result = format_and_split_arguments(
                        named,
                        self.arg_store.values(),
                        &mut self.named_fmt_buf,
                        &mut self.split_buf,
                    );
                }
                if let Err(e) = result {
                    let error = format_error_line(metadata, &e.to_string());
                    event.formatted_msg.clear();
                    event.formatted_msg.push_str(&error);
                    self.opts.notify_error(&error);
                }
            }

            if metadata.log_level() == Level::Dynamic {
                event.dynamic_level = Level::from_u8(reader.get_u8());
            } else {
                // Slots are reused; a stale dynamic level must never leak
                // into a non-dynamic statement.
                event.dynamic_level = Level::None;
            }
            event.flush_flag = None;
        } else {
            event.flush_flag = Some(reader.get_usize() as *const AtomicBool);
            event.formatted_msg.clear();
            event.dynamic_level = Level::None;
            if let Some(named) = event.named_args.as_mut() {
                named.clear();
            }
        }

        ring.push_back();
        DecodeOutcome::Consumed(reader.consumed())
    }

    fn tsc_clock_or_init(&mut self) -> &TscClock {
        let mut clock = self.shared.tsc_clock.load(Ordering::Relaxed);
        if clock.is_null() {
            clock = Box::into_raw(Box::new(TscClock::new()));
            self.shared.tsc_clock.store(clock, Ordering::Release);
            self.last_resync = Instant::now();
        }
        // SAFETY: only the worker creates and destroys the clock, and it is
        // alive for the whole worker loop.
        unsafe { &*clock }
    }

    /// Phase 2: pops the event with the minimum timestamp across all rings
    /// and dispatches it. Returns false when every ring is empty.
    pub(crate) fn process_next_event(&mut self) -> bool {
        let mut min_ts = u64::MAX;
        let mut best = None;
        for (i, ctx) in self.contexts.iter().enumerate() {
            // SAFETY: transit rings are only touched on the worker thread.
            if let Some(event) = unsafe { ctx.transit_ring() }.front() {
                if event.timestamp < min_ts {
                    min_ts = event.timestamp;
                    best = Some(i);
                }
            }
        }

        let Some(i) = best else { return false };
        let ctx = Arc::clone(&self.contexts[i]);
        // SAFETY: transit rings are only touched on the worker thread.
        let ring = unsafe { ctx.transit_ring_mut() };

        // A failing event is reported and skipped, never allowed to wedge
        // the loop.
        if catch_unwind(AssertUnwindSafe(|| self.process_event(ring))).is_err() {
            self.opts.notify_error("Caught unhandled exception.");
        }

        // SAFETY: as above.
        unsafe { ctx.transit_ring_mut() }.pop_front();
        true
    }

    fn process_event(&mut self, ring: &mut TransitEventRing) {
        let Some(event) = ring.front_mut() else { return };
        // SAFETY: loggers are removed only when every queue and ring is
        // empty, which cannot be the case while this event exists.
        let logger = unsafe { &*event.logger };

        match event.metadata.event_kind() {
            EventKind::Log => {
                if event.log_level() != Level::Backtrace {
                    self.write_event_to_sinks(event);

                    if event.log_level() >= logger.backtrace_flush_level() {
                        let drained = self.backtrace.drain(logger.name());
                        for stored in &drained {
                            self.write_event_to_sinks(stored);
                        }
                    }
                } else {
                    let name = logger.name().to_string();
                    let stolen = std::mem::take(event);
                    self.backtrace.store(&name, stolen);
                }
            }
            EventKind::InitBacktrace => match event.formatted_msg.trim().parse::<usize>() {
                Ok(capacity) => self.backtrace.set_capacity(logger.name(), capacity),
                Err(_) => self.opts.notify_error(&format!(
                    "invalid backtrace capacity \"{}\" for logger \"{}\"",
                    event.formatted_msg,
                    logger.name()
                )),
            },
            EventKind::FlushBacktrace => {
                let drained = self.backtrace.drain(logger.name());
                for stored in &drained {
                    self.write_event_to_sinks(stored);
                }
            }
            EventKind::Flush => {
                self.flush_and_run_active_sinks(false);
                if let Some(flag) = event.flush_flag.take() {
                    // SAFETY: the flushing thread blocks on this flag, so it
                    // outlives the record. The take() above clears our copy;
                    // the slot is reused.
                    unsafe { &*flag }.store(true, Ordering::Release);
                }
            }
        }
    }

    fn write_event_to_sinks(&mut self, event: &crate::transit::TransitEvent) {
        // SAFETY: see process_event.
        let logger = unsafe { &*event.logger };
        let Some(formatter) = logger.pattern_formatter().get() else {
            return;
        };

        let named_args = event.named_args.as_deref().filter(|v| !v.is_empty());
        formatter.format(
            event.timestamp,
            event.thread_id,
            &event.thread_name,
            &self.process_id,
            logger.name(),
            event.log_level().as_str(),
            event.metadata,
            named_args,
            &event.formatted_msg,
            &mut self.line_buf,
        );

        let record = SinkRecord {
            metadata: event.metadata,
            timestamp: event.timestamp,
            thread_id: event.thread_id,
            thread_name: &event.thread_name,
            logger_name: logger.name(),
            level: event.log_level(),
            named_args,
            line: &self.line_buf,
        };

        for sink in logger.sinks() {
            if sink.apply_filters(&record) {
                if let Err(e) = sink.write(&record) {
                    self.opts.notify_error(&format!("sink write error: {e}"));
                }
            }
        }
    }

    /// Flushes every sink of every valid logger, deduplicated, and runs the
    /// periodic tasks when asked. Flush always comes first.
    fn flush_and_run_active_sinks(&mut self, run_periodic: bool) {
        self.active_sinks.clear();
        let registry = Arc::clone(&self.logger_registry);
        registry.for_each_valid(|logger| {
            for sink in logger.sinks() {
                let seen = self
                    .active_sinks
                    .iter()
                    .any(|w| w.upgrade().is_some_and(|existing| Arc::ptr_eq(&existing, sink)));
                if !seen {
                    self.active_sinks.push(Arc::downgrade(sink));
                }
            }
        });

        for weak in &self.active_sinks {
            let Some(sink) = weak.upgrade() else { continue };
            if let Err(e) = sink.flush() {
                self.opts.notify_error(&format!("sink flush error: {e}"));
            }
            if run_periodic {
                if let Err(e) = sink.run_periodic_tasks() {
                    self.opts.notify_error(&format!("sink periodic task error: {e}"));
                }
            }
        }
    }

    fn report_failure_counters(&self) {
        for ctx in &self.contexts {
            // Unbounded queues neither drop nor block.
            if !ctx.is_bounded() {
                continue;
            }
            let failed = ctx.take_failure_count();
            if failed == 0 {
                continue;
            }
            let stamp = local_time_stamp();
            let msg = if ctx.is_dropping() {
                format!(
                    "{stamp} inkwire INFO: Dropped {failed} log messages from thread {}",
                    ctx.thread_id()
                )
            } else {
                format!(
                    "{stamp} inkwire INFO: Experienced {failed} blocking occurrences on thread {}",
                    ctx.thread_id()
                )
            };
            self.opts.notify_error(&msg);
        }
    }

    fn report_allocation(&self, ctx: &ThreadContext, previous: usize, new: usize) {
        let stamp = local_time_stamp();
        self.opts.notify_error(&format!(
            "{stamp} inkwire INFO: A new SPSC queue has been allocated with a new capacity \
             of {new} bytes and a previous capacity of {previous} bytes from thread {}",
            ctx.thread_id()
        ));
    }

    fn resync_tsc(&mut self) {
        let clock = self.shared.tsc_clock.load(Ordering::Relaxed);
        if clock.is_null() {
            return;
        }
        if self.last_resync.elapsed() > self.opts.rdtsc_resync_interval {
            // SAFETY: see tsc_clock_or_init.
            if unsafe { &*clock }.resync(2_500) {
                self.last_resync = Instant::now();
            }
        }
    }

    fn queues_and_rings_empty(&mut self) -> bool {
        self.update_contexts_cache();
        self.contexts.iter().all(|ctx| {
            // SAFETY: transit rings are only touched on the worker thread.
            ctx.queue_empty() && unsafe { ctx.transit_ring() }.is_empty()
        })
    }

    fn cleanup_invalidated_contexts(&mut self) {
        if !self.ctx_registry.has_invalidated() {
            return;
        }
        let registry = Arc::clone(&self.ctx_registry);
        self.contexts.retain(|ctx| {
            // SAFETY: transit rings are only touched on the worker thread.
            let removable =
                !ctx.is_valid() && ctx.queue_empty() && unsafe { ctx.transit_ring() }.is_empty();
            if removable {
                registry.remove(ctx);
            }
            !removable
        });
    }

    fn cleanup_invalidated_loggers(&mut self) {
        let registry = Arc::clone(&self.logger_registry);
        let removed = registry.cleanup_invalidated(|| self.queues_and_rings_empty());

        if !removed.is_empty() {
            // Sweeping sinks is comparatively expensive; only worth it when
            // a logger actually went away.
            self.sink_registry.cleanup_unused();
            self.formatter_cache.sweep_expired();
            for name in &removed {
                self.backtrace.erase(name);
            }
        }
    }
}

fn format_error_line(metadata: &Metadata, error: &str) -> String {
    format!(
        "[Could not format log statement. message: \"{}\", location: \"{}\", error: \"{}\"]",
        metadata.message_format(),
        metadata.source_location(),
        error
    )
}

const TIME_ONLY: &[FormatItem<'static>] =
    time::macros::format_description!("[hour]:[minute]:[second]");

fn local_time_stamp() -> String {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetDateTime::now_utc()
        .to_offset(offset)
        .format(&TIME_ONLY)
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: u16) -> Result<(), String> {
    // SAFETY: the set is zero-initialized and pid 0 targets the calling
    // thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(format!(
                "sched_setaffinity({cpu}) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: u16) -> Result<(), String> {
    Ok(())
}
