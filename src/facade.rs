//! Adapter wiring the `log` facade into the backend.
//!
//! `log` call sites have no static metadata to put on the wire, so the
//! adapter renders `record.args()` on the producer side and ships the result
//! as a single string argument through one shared `Dynamic`-level call site,
//! with the record's level in the dynamic tail byte. Each thread lazily
//! registers one producer context; its thread-local destructor invalidates
//! the context when the thread exits.

use std::cell::RefCell;
use std::sync::Arc;

use crate::backend::WorkerShared;
use crate::context::{Producer, QueueKind, ThreadContextRegistry};
use crate::level::Level;
use crate::logger::Logger;
use crate::record::{Arg, EventKind, Metadata};

static FACADE_METADATA: Metadata = Metadata::new("{}", "", Level::Dynamic, EventKind::Log);

const FACADE_QUEUE: QueueKind = QueueKind::Unbounded {
    initial_capacity: 64 * 1024,
};

fn map_level(level: log::Level) -> Level {
    match level {
        log::Level::Error => Level::Error,
        log::Level::Warn => Level::Warning,
        log::Level::Info => Level::Info,
        log::Level::Debug => Level::Debug,
        log::Level::Trace => Level::Trace,
    }
}

thread_local! {
    static FACADE_PRODUCER: RefCell<Option<Producer>> = const { RefCell::new(None) };
}

pub(crate) struct FacadeLogger {
    registry: Arc<ThreadContextRegistry>,
    shared: Arc<WorkerShared>,
    logger: Arc<Logger>,
    max_level: log::LevelFilter,
}

impl FacadeLogger {
    pub(crate) fn new(
        registry: Arc<ThreadContextRegistry>,
        shared: Arc<WorkerShared>,
        logger: Arc<Logger>,
        max_level: log::LevelFilter,
    ) -> Self {
        Self {
            registry,
            shared,
            logger,
            max_level,
        }
    }

    fn with_producer<R>(&self, f: impl FnOnce(&Producer) -> R) -> R {
        FACADE_PRODUCER.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_none() {
                *slot = Some(Producer::register(
                    Arc::clone(&self.registry),
                    Arc::clone(&self.shared),
                    FACADE_QUEUE,
                ));
            }
            f(slot.as_ref().expect("registered above"))
        })
    }
}

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = record.args().to_string();
        self.with_producer(|producer| {
            self.logger.log_dynamic(
                producer,
                &FACADE_METADATA,
                map_level(record.level()),
                &[Arg::Str(&msg)],
            );
        });
    }

    fn flush(&self) {
        self.with_producer(|producer| self.logger.flush(producer));
    }
}

#[cfg(test)]
mod tests {
    use crate::sink::{Sink, SinkRecord};
    use crate::{Backend, BackendOptions, Level, LoggerOptions};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct LineSink {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl Sink for LineSink {
        fn write(&self, record: &SinkRecord<'_>) -> io::Result<()> {
            self.lines
                .lock()
                .push((record.level, record.line.to_string()));
            Ok(())
        }

        fn flush(&self) -> io::Result<()> {
            Ok(())
        }
    }

    // The one test in the crate allowed to call log::set_boxed_logger.
    #[test]
    fn facade_routes_log_macros() {
        let backend = Backend::start(BackendOptions {
            sleep_duration: Duration::from_micros(200),
            ..BackendOptions::default()
        })
        .unwrap();

        let sink = Arc::new(LineSink::default());
        let logger = backend
            .add_logger(LoggerOptions::new(
                "facade",
                vec![Arc::clone(&sink) as Arc<dyn Sink>],
            ))
            .unwrap();

        backend
            .install_log_facade(Arc::clone(&logger), log::LevelFilter::Info)
            .unwrap();

        log::info!("hello {}", 42);
        log::warn!("careful");
        log::debug!("filtered out");
        log::logger().flush();

        // flush() is a rendezvous, so both lines must already be there.
        let lines = sink.lines.lock().clone();
        assert_eq!(lines.len(), 2, "got: {lines:?}");
        assert_eq!(lines[0].0, Level::Info);
        assert!(lines[0].1.contains("hello 42"));
        assert_eq!(lines[1].0, Level::Warning);
        assert!(lines[1].1.contains("careful"));

        // A producer thread dying invalidates its context without losing
        // records.
        std::thread::spawn(|| {
            log::error!("from a short-lived thread");
        })
        .join()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let lines = sink.lines.lock();
                if lines.iter().any(|(_, l)| l.contains("from a short-lived thread")) {
                    break;
                }
            }
            assert!(Instant::now() < deadline, "record from dead thread lost");
            std::thread::sleep(Duration::from_millis(5));
        }

        backend.stop();
        assert!(!backend.is_running());
    }
}
