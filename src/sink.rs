//! Output endpoints and their registry.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::level::Level;
use crate::record::Metadata;

/// Borrowed view of one formatted event, handed to every sink call.
pub struct SinkRecord<'a> {
    pub metadata: &'static Metadata,
    pub timestamp: u64,
    pub thread_id: u64,
    pub thread_name: &'a str,
    pub logger_name: &'a str,
    pub level: Level,
    pub named_args: Option<&'a [(String, String)]>,
    /// The fully rendered output line, trailing newline included.
    pub line: &'a str,
}

/// An output endpoint. Reference-counted and shared across loggers; every
/// method is fallible and the worker reports failures through the error
/// notifier instead of propagating them.
pub trait Sink: Send + Sync {
    /// Gate called before `write`; returning false skips the event.
    fn apply_filters(&self, _record: &SinkRecord<'_>) -> bool {
        true
    }

    fn write(&self, record: &SinkRecord<'_>) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;

    /// Housekeeping hook invoked once per idle cycle, after `flush`.
    fn run_periodic_tasks(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes rendered lines to any `io::Write`, optionally gated by a minimum
/// level.
pub struct StreamSink<W: Write + Send> {
    writer: Mutex<W>,
    min_level: Option<Level>,
}

impl<W: Write + Send> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            min_level: None,
        }
    }

    pub fn with_min_level(writer: W, min_level: Level) -> Self {
        Self {
            writer: Mutex::new(writer),
            min_level: Some(min_level),
        }
    }
}

impl<W: Write + Send> Sink for StreamSink<W> {
    fn apply_filters(&self, record: &SinkRecord<'_>) -> bool {
        match self.min_level {
            Some(min) => record.level >= min,
            None => true,
        }
    }

    fn write(&self, record: &SinkRecord<'_>) -> io::Result<()> {
        self.writer.lock().write_all(record.line.as_bytes())
    }

    fn flush(&self) -> io::Result<()> {
        self.writer.lock().flush()
    }
}

pub type FileSink = StreamSink<BufWriter<File>>;

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        Ok(StreamSink::new(BufWriter::new(file)))
    }
}

/// Holds the strong sink references, keyed by name.
///
/// Loggers clone the `Arc`s; the worker sweeps entries nothing else
/// references after loggers were removed.
#[derive(Default)]
pub(crate) struct SinkRegistry {
    sinks: Mutex<FxHashMap<String, Arc<dyn Sink>>>,
}

impl SinkRegistry {
    pub(crate) fn get_or_create(
        &self,
        name: &str,
        make: impl FnOnce() -> Arc<dyn Sink>,
    ) -> Arc<dyn Sink> {
        let mut sinks = self.sinks.lock();
        if let Some(existing) = sinks.get(name) {
            return Arc::clone(existing);
        }
        let sink = make();
        sinks.insert(name.to_string(), Arc::clone(&sink));
        sink
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Sink>> {
        self.sinks.lock().get(name).cloned()
    }

    /// Drops every sink only the registry still references.
    pub(crate) fn cleanup_unused(&self) {
        self.sinks
            .lock()
            .retain(|_, sink| Arc::strong_count(sink) > 1);
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use crate::record::EventKind;

    static META: Metadata = Metadata::new("{}", "here.rs:1", Level::Info, EventKind::Log);

    fn record<'a>(level: Level, line: &'a str) -> SinkRecord<'a> {
        SinkRecord {
            metadata: &META,
            timestamp: 0,
            thread_id: 1,
            thread_name: "t",
            logger_name: "root",
            level,
            named_args: None,
            line,
        }
    }

    /// In-memory writer so tests can inspect what reached the sink.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stream_sink_writes_lines() {
        let buf = SharedBuf::default();
        let sink = StreamSink::new(buf.clone());
        sink.write(&record(Level::Info, "hello\n")).unwrap();
        sink.flush().unwrap();
        assert_eq!(String::from_utf8(buf.0.lock().clone()).unwrap(), "hello\n");
    }

    #[test]
    fn min_level_filters() {
        let sink = StreamSink::with_min_level(SharedBuf::default(), Level::Warning);
        assert!(!sink.apply_filters(&record(Level::Info, "x\n")));
        assert!(sink.apply_filters(&record(Level::Warning, "x\n")));
        assert!(sink.apply_filters(&record(Level::Critical, "x\n")));
    }

    #[test]
    fn registry_shares_and_sweeps() {
        let registry = SinkRegistry::default();
        let a = registry.get_or_create("console", || Arc::new(StreamSink::new(SharedBuf::default())));
        let b = registry.get_or_create("console", || Arc::new(StreamSink::new(SharedBuf::default())));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        // Still referenced: survives the sweep.
        registry.cleanup_unused();
        assert_eq!(registry.len(), 1);

        drop(a);
        drop(b);
        registry.cleanup_unused();
        assert_eq!(registry.len(), 0);
    }
}
