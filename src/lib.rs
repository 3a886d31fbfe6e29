//! Asynchronous low-latency structured logging backend.
//!
//! Producer threads encode log records into per-thread lock-free SPSC byte
//! queues; a single background worker drains every queue, reconstructs and
//! formats the events, merges them by timestamp and dispatches them to the
//! sinks of their loggers.
//!
//! # Architecture
//!
//! ```text
//! [Producer Threads] → [SPSC byte queues] → [Backend worker] → [Sinks]
//!       ↓                    ↓                    ↓               ↓
//!   Encode header       Lock-free ring      Decode, convert    File/
//!   + arguments         per thread          timestamps,        stream/
//!   (sub-μs)                                format, merge      custom
//! ```
//!
//! The producer hot path copies a fixed header and the encoded arguments
//! into its queue and wakes the worker; decoding, timestamp conversion,
//! message formatting and I/O all happen on the worker thread. Events are
//! emitted in non-decreasing timestamp order across producers while strict
//! ordering is enabled (the default).
//!
//! # Usage
//!
//! ```rust,ignore
//! use inkwire::{Backend, BackendOptions, LoggerOptions, QueueKind, Metadata, Arg, Level, EventKind};
//!
//! static META: Metadata = Metadata::new("port={}", "main.rs:12", Level::Info, EventKind::Log);
//!
//! let backend = Backend::start(BackendOptions::default())?;
//! let sink = std::sync::Arc::new(inkwire::FileSink::create("app.log")?);
//! let logger = backend.add_logger(LoggerOptions::new("root", vec![sink]))?;
//!
//! let producer = backend.register_producer(QueueKind::Unbounded { initial_capacity: 64 * 1024 });
//! logger.log(&producer, &META, &[Arg::U64(8080)]);
//! logger.flush(&producer);
//! ```

mod backend;
mod backtrace;
mod clock;
mod config;
mod context;
mod error;
mod facade;
mod format;
mod level;
mod logger;
mod queue;
mod record;
mod sink;
mod transit;

pub use config::{BackendOptions, ErrorNotifier, NO_CPU_AFFINITY};
pub use context::{Producer, QueueKind};
pub use error::{BackendError, ConfigError};
pub use format::{Timezone, DEFAULT_PATTERN, DEFAULT_TIME_PATTERN};
pub use level::Level;
pub use logger::{ClockSource, Logger, LoggerOptions};
pub use record::{
    decode_args, Arg, ArgStore, ArgValue, ByteReader, ByteWriter, DecoderFn, EventKind, Metadata,
};
pub use sink::{FileSink, Sink, SinkRecord, StreamSink};

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_utils::sync::Parker;
use parking_lot::Mutex;

use crate::backend::{BackendWorker, WorkerShared};
use crate::context::ThreadContextRegistry;
use crate::facade::FacadeLogger;
use crate::logger::LoggerRegistry;
use crate::sink::SinkRegistry;

/// Handle to a running backend worker and its registries.
///
/// `start` spawns the worker thread and hands back this handle; dropping it
/// (or calling [`Backend::stop`]) drains per the configured exit policy,
/// flushes the sinks one last time and joins the thread.
pub struct Backend {
    shared: Arc<WorkerShared>,
    ctx_registry: Arc<ThreadContextRegistry>,
    logger_registry: Arc<LoggerRegistry>,
    sink_registry: Arc<SinkRegistry>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Backend {
    /// Validates the options and spawns the worker thread, spinning until it
    /// signals readiness.
    pub fn start(options: BackendOptions) -> Result<Self, BackendError> {
        let options = options.validated()?;

        let parker = Parker::new();
        let shared = Arc::new(WorkerShared::new(parker.unparker().clone()));
        let ctx_registry = Arc::new(ThreadContextRegistry::default());
        let logger_registry = Arc::new(LoggerRegistry::default());
        let sink_registry = Arc::new(SinkRegistry::default());

        let thread_name = platform_thread_name(&options.thread_name);
        let mut worker = BackendWorker::new(
            options,
            Arc::clone(&shared),
            Arc::clone(&ctx_registry),
            Arc::clone(&logger_registry),
            Arc::clone(&sink_registry),
            parker,
        );

        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.thread_main())?;

        // Startup handshake: wait until the worker flags itself running.
        while !shared.is_worker_running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_micros(100));
        }

        Ok(Self {
            shared,
            ctx_registry,
            logger_registry,
            sink_registry,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    /// OS thread id of the worker, once it has started.
    pub fn backend_thread_id(&self) -> u64 {
        self.shared.worker_thread_id.load(Ordering::Relaxed)
    }

    /// Wakes the worker if it is parked. Safe from any thread.
    pub fn notify(&self) {
        self.shared.notify();
    }

    /// Converts a raw TSC reading through the worker's calibrated clock.
    /// Returns 0 until the first TSC-clocked record initialised the clock.
    pub fn time_since_epoch(&self, rdtsc_value: u64) -> u64 {
        self.shared.time_since_epoch(rdtsc_value)
    }

    /// Registers the calling thread as a producer. The handle is not `Send`;
    /// dropping it marks the context invalid and the worker unregisters it
    /// once its queue and pending events are drained.
    pub fn register_producer(&self, kind: QueueKind) -> Producer {
        Producer::register(
            Arc::clone(&self.ctx_registry),
            Arc::clone(&self.shared),
            kind,
        )
    }

    pub fn add_logger(&self, options: LoggerOptions) -> Result<Arc<Logger>, BackendError> {
        self.logger_registry.create(options)
    }

    pub fn logger(&self, name: &str) -> Option<Arc<Logger>> {
        self.logger_registry.get(name)
    }

    /// Requests removal. The logger is destroyed by the worker only at a
    /// moment when every producer queue and transit ring is empty; records
    /// already in flight still come out.
    pub fn remove_logger(&self, name: &str) -> bool {
        let marked = self.logger_registry.mark_invalid(name);
        if marked {
            self.shared.notify();
        }
        marked
    }

    /// Returns the named sink, creating it on first use. The registry keeps
    /// the strong reference until no logger uses the sink any more.
    pub fn register_sink(
        &self,
        name: &str,
        make: impl FnOnce() -> Arc<dyn Sink>,
    ) -> Arc<dyn Sink> {
        self.sink_registry.get_or_create(name, make)
    }

    pub fn sink(&self, name: &str) -> Option<Arc<dyn Sink>> {
        self.sink_registry.get(name)
    }

    /// Routes the `log` crate's macros into `logger`. May only succeed once
    /// per process (the facade owns the global `log` slot).
    pub fn install_log_facade(
        &self,
        logger: Arc<Logger>,
        max_level: log::LevelFilter,
    ) -> Result<(), BackendError> {
        let facade = FacadeLogger::new(
            Arc::clone(&self.ctx_registry),
            Arc::clone(&self.shared),
            logger,
            max_level,
        );
        log::set_boxed_logger(Box::new(facade))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Stops the worker: drains per `wait_for_queues_to_empty_before_exit`,
    /// flushes the sinks one final time and joins. Idempotent.
    pub fn stop(&self) {
        if !self.shared.is_worker_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.notify();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Linux caps thread names at 15 bytes plus the terminator.
fn platform_thread_name(name: &str) -> String {
    if cfg!(target_os = "linux") && name.len() > 15 {
        let mut end = 15;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        return name[..end].to_string();
    }
    name.to_string()
}

static GLOBAL_BACKEND: OnceLock<Backend> = OnceLock::new();

/// Starts the process-wide default backend, or returns the existing one.
pub fn init(options: BackendOptions) -> Result<&'static Backend, BackendError> {
    if let Some(existing) = GLOBAL_BACKEND.get() {
        return Ok(existing);
    }
    let backend = Backend::start(options)?;
    match GLOBAL_BACKEND.set(backend) {
        Ok(()) => Ok(GLOBAL_BACKEND.get().expect("just initialised")),
        Err(backend) => {
            // Lost the race; this instance stops, the winner serves.
            backend.stop();
            Ok(GLOBAL_BACKEND.get().expect("winner is initialised"))
        }
    }
}

/// The process-wide backend, if [`init`] has run.
pub fn global() -> Option<&'static Backend> {
    GLOBAL_BACKEND.get()
}
