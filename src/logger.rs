//! Loggers: named front doors that encode records into the calling thread's
//! queue, plus the registry that owns them.
//!
//! The hot path is the producer side of the pipeline: stamp a timestamp,
//! reserve queue space, copy the fixed header and the encoded arguments,
//! publish, wake the worker. Everything expensive (decoding, formatting,
//! I/O) happens later on the worker thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;

use crate::clock::{rdtsc, wall_clock_ns};
use crate::context::Producer;
use crate::error::BackendError;
use crate::format::{PatternFormatter, Timezone, DEFAULT_PATTERN, DEFAULT_TIME_PATTERN};
use crate::level::Level;
use crate::record::{
    decode_args, encode_args, encoded_args_size, Arg, ByteWriter, DecoderFn, EventKind, Metadata,
    RecordHeader, HEADER_SIZE,
};
use crate::sink::Sink;

/// Where a logger's timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Wall clock, nanoseconds since the Unix epoch.
    System,
    /// Raw CPU counter; the worker converts it through the calibrated clock.
    Tsc,
    /// Caller supplies nanoseconds since the epoch. Exempt from the
    /// strict-order cut-off, so cross-producer order is the caller's problem.
    User,
}

pub struct LoggerOptions {
    pub name: String,
    pub sinks: Vec<Arc<dyn Sink>>,
    pub format_pattern: String,
    pub time_pattern: String,
    pub timezone: Timezone,
    pub clock_source: ClockSource,
}

impl LoggerOptions {
    pub fn new(name: impl Into<String>, sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            name: name.into(),
            sinks,
            format_pattern: DEFAULT_PATTERN.to_string(),
            time_pattern: DEFAULT_TIME_PATTERN.to_string(),
            timezone: Timezone::Utc,
            clock_source: ClockSource::System,
        }
    }

    pub fn format_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.format_pattern = pattern.into();
        self
    }

    pub fn time_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.time_pattern = pattern.into();
        self
    }

    pub fn timezone(mut self, timezone: Timezone) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn clock_source(mut self, clock_source: ClockSource) -> Self {
        self.clock_source = clock_source;
        self
    }
}

static FLUSH_METADATA: Metadata = Metadata::new("", "", Level::None, EventKind::Flush);
static INIT_BACKTRACE_METADATA: Metadata =
    Metadata::new("{}", "", Level::None, EventKind::InitBacktrace);
static FLUSH_BACKTRACE_METADATA: Metadata =
    Metadata::new("", "", Level::None, EventKind::FlushBacktrace);

/// A named logging entity. Only ever handed out as `Arc<Logger>` by the
/// registry, so the address producers put on the wire stays stable until
/// the worker's gated removal.
pub struct Logger {
    name: String,
    format_pattern: String,
    time_pattern: String,
    timezone: Timezone,
    clock_source: ClockSource,
    sinks: Vec<Arc<dyn Sink>>,
    backtrace_flush_level: AtomicU8,
    /// Installed at most once, by the worker, then shared.
    pattern_formatter: OnceLock<Arc<PatternFormatter>>,
    valid: AtomicBool,
}

impl Logger {
    fn new(options: LoggerOptions) -> Arc<Self> {
        Arc::new(Self {
            name: options.name,
            format_pattern: options.format_pattern,
            time_pattern: options.time_pattern,
            timezone: options.timezone,
            clock_source: options.clock_source,
            sinks: options.sinks,
            backtrace_flush_level: AtomicU8::new(Level::None as u8),
            pattern_formatter: OnceLock::new(),
            valid: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    pub(crate) fn format_pattern(&self) -> &str {
        &self.format_pattern
    }

    pub(crate) fn time_pattern(&self) -> &str {
        &self.time_pattern
    }

    pub(crate) fn timezone(&self) -> Timezone {
        self.timezone
    }

    pub(crate) fn sinks(&self) -> &[Arc<dyn Sink>] {
        &self.sinks
    }

    pub(crate) fn backtrace_flush_level(&self) -> Level {
        Level::from_u8(self.backtrace_flush_level.load(Ordering::Relaxed))
    }

    pub(crate) fn pattern_formatter(&self) -> &OnceLock<Arc<PatternFormatter>> {
        &self.pattern_formatter
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Logs one statement with the logger's own clock.
    pub fn log(&self, producer: &Producer, metadata: &'static Metadata, args: &[Arg<'_>]) {
        self.enqueue(producer, metadata, self.timestamp_now(), args, None);
    }

    /// Logs with a caller-supplied timestamp in nanoseconds since the epoch;
    /// meant for `ClockSource::User` loggers.
    pub fn log_with_timestamp(
        &self,
        producer: &Producer,
        metadata: &'static Metadata,
        timestamp_ns: u64,
        args: &[Arg<'_>],
    ) {
        self.enqueue(producer, metadata, timestamp_ns, args, None);
    }

    /// Logs through a `Level::Dynamic` call site, carrying the level in the
    /// record itself.
    pub fn log_dynamic(
        &self,
        producer: &Producer,
        metadata: &'static Metadata,
        level: Level,
        args: &[Arg<'_>],
    ) {
        self.enqueue(producer, metadata, self.timestamp_now(), args, Some(level));
    }

    /// Synchronous flush rendezvous: enqueues a flush record carrying the
    /// address of a stack flag, then busy-waits until the worker has pushed
    /// everything this producer enqueued beforehand to the sinks, flushed
    /// them, and set the flag.
    pub fn flush(&self, producer: &Producer) {
        if !producer.worker_running() {
            return;
        }

        let flag = AtomicBool::new(false);
        let len = HEADER_SIZE + std::mem::size_of::<usize>();
        let header = self.header(&FLUSH_METADATA, wall_clock_ns());
        let flag_addr = &flag as *const AtomicBool as usize;

        let mut fill = |buf: &mut [u8]| {
            let mut w = ByteWriter::new(buf);
            header.encode(&mut w);
            w.put_usize(flag_addr);
            debug_assert_eq!(w.written(), len);
        };
        if !producer.context().write_record(len, &mut fill) {
            return;
        }
        producer.notify_worker();

        let backoff = Backoff::new();
        while !flag.load(Ordering::Acquire) {
            if !producer.worker_running() {
                break;
            }
            backoff.snooze();
        }
    }

    /// Arms backtrace capture: statements at `Level::Backtrace` are buffered
    /// in a ring of `capacity` events and spilled to the sinks when a
    /// statement at or above `flush_level` is written.
    pub fn init_backtrace(&self, producer: &Producer, capacity: u32, flush_level: Level) {
        self.backtrace_flush_level
            .store(flush_level as u8, Ordering::Relaxed);
        // The ring capacity travels as the record's only argument.
        self.enqueue(
            producer,
            &INIT_BACKTRACE_METADATA,
            self.timestamp_now(),
            &[Arg::U64(u64::from(capacity))],
            None,
        );
    }

    /// Spills the stored backtrace events to the sinks unconditionally.
    pub fn flush_backtrace(&self, producer: &Producer) {
        self.enqueue(
            producer,
            &FLUSH_BACKTRACE_METADATA,
            self.timestamp_now(),
            &[],
            None,
        );
    }

    fn timestamp_now(&self) -> u64 {
        match self.clock_source {
            ClockSource::Tsc => rdtsc(),
            ClockSource::System | ClockSource::User => wall_clock_ns(),
        }
    }

    fn header(&self, metadata: &'static Metadata, timestamp: u64) -> RecordHeader {
        RecordHeader {
            timestamp,
            metadata: metadata as *const Metadata as usize,
            logger: self as *const Logger as usize,
            decoder: (decode_args as DecoderFn) as usize,
        }
    }

    fn enqueue(
        &self,
        producer: &Producer,
        metadata: &'static Metadata,
        timestamp: u64,
        args: &[Arg<'_>],
        dynamic_level: Option<Level>,
    ) {
        let dynamic_tail = usize::from(metadata.log_level() == Level::Dynamic);
        let len = HEADER_SIZE + encoded_args_size(args) + dynamic_tail;
        let header = self.header(metadata, timestamp);

        let mut fill = |buf: &mut [u8]| {
            let mut w = ByteWriter::new(buf);
            header.encode(&mut w);
            encode_args(args, &mut w);
            if dynamic_tail == 1 {
                w.put_u8(dynamic_level.unwrap_or(Level::Info) as u8);
            }
            debug_assert_eq!(w.written(), len);
        };

        if producer.context().write_record(len, &mut fill) {
            producer.notify_worker();
        }
    }
}

/// Owns the loggers. Insertion happens on caller threads under the lock;
/// the worker is the only remover, and only through the gated cleanup.
#[derive(Default)]
pub(crate) struct LoggerRegistry {
    loggers: Mutex<Vec<Arc<Logger>>>,
}

impl LoggerRegistry {
    pub(crate) fn create(&self, options: LoggerOptions) -> Result<Arc<Logger>, BackendError> {
        let mut loggers = self.loggers.lock();
        if loggers.iter().any(|l| l.name() == options.name) {
            return Err(BackendError::LoggerExists(options.name));
        }
        let logger = Logger::new(options);
        loggers.push(Arc::clone(&logger));
        Ok(logger)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Logger>> {
        self.loggers
            .lock()
            .iter()
            .find(|l| l.name() == name && l.is_valid())
            .cloned()
    }

    pub(crate) fn mark_invalid(&self, name: &str) -> bool {
        match self.loggers.lock().iter().find(|l| l.name() == name) {
            Some(logger) => {
                logger.invalidate();
                true
            }
            None => false,
        }
    }

    pub(crate) fn for_each_valid(&self, mut f: impl FnMut(&Arc<Logger>)) {
        for logger in self.loggers.lock().iter() {
            if logger.is_valid() {
                f(logger);
            }
        }
    }

    /// Removes invalidated loggers, re-running `gate` before each removal:
    /// producers may still hold the logger's address in flight, so a logger
    /// goes away only while every queue and ring is observably empty.
    pub(crate) fn cleanup_invalidated(&self, mut gate: impl FnMut() -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        let mut loggers = self.loggers.lock();
        let mut i = 0;
        while i < loggers.len() {
            if !loggers[i].is_valid() && gate() {
                removed.push(loggers[i].name().to_string());
                loggers.remove(i);
            } else {
                i += 1;
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.loggers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = LoggerRegistry::default();
        registry
            .create(LoggerOptions::new("root", Vec::new()))
            .unwrap();
        assert!(matches!(
            registry.create(LoggerOptions::new("root", Vec::new())),
            Err(BackendError::LoggerExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn invalid_loggers_are_hidden_from_get() {
        let registry = LoggerRegistry::default();
        registry
            .create(LoggerOptions::new("root", Vec::new()))
            .unwrap();
        assert!(registry.get("root").is_some());

        assert!(registry.mark_invalid("root"));
        assert!(registry.get("root").is_none());
        // Still owned until the worker's gated cleanup removes it.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn cleanup_respects_the_gate() {
        let registry = LoggerRegistry::default();
        registry
            .create(LoggerOptions::new("root", Vec::new()))
            .unwrap();
        registry.mark_invalid("root");

        assert!(registry.cleanup_invalidated(|| false).is_empty());
        assert_eq!(registry.len(), 1);

        let removed = registry.cleanup_invalidated(|| true);
        assert_eq!(removed, vec!["root".to_string()]);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn options_carry_defaults() {
        let options = LoggerOptions::new("net", Vec::new())
            .clock_source(ClockSource::Tsc)
            .timezone(Timezone::Local);
        assert_eq!(options.format_pattern, DEFAULT_PATTERN);
        assert_eq!(options.time_pattern, DEFAULT_TIME_PATTERN);
        assert_eq!(options.clock_source, ClockSource::Tsc);
        assert_eq!(options.timezone, Timezone::Local);
    }
}
