//! An asynchronous sink for the [`log`] facade.
//!
//! Formatting happens on the calling thread; the formatted line is handed
//! to a background writer thread over a channel, so logging from the
//! reactor or a worker never blocks on file I/O. The writer drains the
//! channel in batches and flushes once per batch.
//!
//! The logger is an explicitly constructed object. [`AsyncLogger::install`]
//! registers it as the global sink for the `log` macros, but nothing in
//! this crate requires that; a test can drive a private instance directly.

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

/// Renders a record into one output line (without the trailing newline).
pub type Formatter = Box<dyn Fn(&Record) -> String + Send + Sync>;

/// Number of queued lines the writer drains per wakeup by default.
pub const DEFAULT_BATCH_SIZE: usize = 8;

enum Message {
    Line(String),
    Shutdown,
}

/// Configures and spawns an [`AsyncLogger`].
pub struct LoggerBuilder {
    writer: Box<dyn Write + Send>,
    level: LevelFilter,
    batch_size: usize,
    formatter: Formatter,
}

impl LoggerBuilder {
    /// Sets the level filter. Records below it are discarded at the call
    /// site. The default is `Info`.
    pub fn level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    /// Sets the number of lines written per writer wakeup. Zero is coerced
    /// to one.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Replaces the line formatter.
    pub fn formatter(mut self, formatter: Formatter) -> Self {
        self.formatter = formatter;
        self
    }

    /// Spawns the writer thread and returns the running logger.
    pub fn build(self) -> AsyncLogger {
        let (tx, rx) = mpsc::channel();
        let batch = self.batch_size;
        let mut writer = self.writer;
        let worker = thread::Builder::new()
            .name("erebus-logger".to_owned())
            .spawn(move || drain(&rx, writer.as_mut(), batch))
            .expect("failed to spawn logger thread");

        AsyncLogger {
            level: self.level,
            formatter: self.formatter,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }
}

/// The asynchronous logger.
///
/// # Examples
///
/// ```no_run
/// use erebus::logger::AsyncLogger;
///
/// let logger = AsyncLogger::to_stderr().build().install().unwrap();
/// log::info!("listening");
/// logger.shutdown();
/// ```
pub struct AsyncLogger {
    level: LevelFilter,
    formatter: Formatter,
    tx: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    /// Starts a builder writing to the given sink.
    pub fn to_writer(writer: Box<dyn Write + Send>) -> LoggerBuilder {
        LoggerBuilder {
            writer,
            level: LevelFilter::Info,
            batch_size: DEFAULT_BATCH_SIZE,
            formatter: Box::new(default_format),
        }
    }

    /// Starts a builder writing to stderr.
    pub fn to_stderr() -> LoggerBuilder {
        Self::to_writer(Box::new(io::stderr()))
    }

    /// Starts a builder appending to a file.
    pub fn to_file(path: &str) -> io::Result<LoggerBuilder> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::to_writer(Box::new(file)))
    }

    /// Registers this logger as the global sink for the `log` macros.
    ///
    /// The logger is leaked into a `'static` reference, which is what the
    /// facade requires; the returned reference can still be used to
    /// [`shutdown`](Self::shutdown) at process exit.
    pub fn install(self) -> Result<&'static AsyncLogger, log::SetLoggerError> {
        let level = self.level;
        let leaked: &'static AsyncLogger = Box::leak(Box::new(self));
        log::set_logger(leaked)?;
        log::set_max_level(level);
        Ok(leaked)
    }

    /// Flushes everything queued so far and joins the writer thread.
    ///
    /// Idempotent; records logged afterwards are dropped.
    pub fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.tx.send(Message::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = (self.formatter)(record);
        // The send fails only after shutdown; the record is dropped then.
        let _ = self.tx.send(Message::Line(line));
    }

    fn flush(&self) {}
}

impl Drop for AsyncLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain(rx: &Receiver<Message>, writer: &mut dyn Write, batch: usize) {
    loop {
        let first = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let mut pending = Vec::with_capacity(batch);
        let mut shutdown = false;
        match first {
            Message::Line(line) => pending.push(line),
            Message::Shutdown => shutdown = true,
        }
        while pending.len() < batch {
            match rx.try_recv() {
                Ok(Message::Line(line)) => pending.push(line),
                Ok(Message::Shutdown) => {
                    shutdown = true;
                    break;
                }
                Err(_) => break,
            }
        }
        for line in &pending {
            let _ = writeln!(writer, "{line}");
        }
        let _ = writer.flush();
        if shutdown {
            // Drain whatever raced in behind the shutdown marker.
            while let Ok(Message::Line(line)) = rx.try_recv() {
                let _ = writeln!(writer, "{line}");
            }
            let _ = writer.flush();
            break;
        }
    }
}

/// The default line format: unix timestamp, level, thread, target, message.
fn default_format(record: &Record) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let thread = thread::current();
    format!(
        "{}.{:03} {:5} [{}] {}: {}",
        now.as_secs(),
        now.subsec_millis(),
        record.level(),
        thread.name().unwrap_or("?"),
        record.target(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// A `Write` sink tests can inspect after the writer thread is done.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    /// Tests that logged lines reach the sink once the logger shuts down.
    #[test]
    fn test_lines_reach_sink() {
        let sink = SharedSink::default();
        let logger = AsyncLogger::to_writer(Box::new(sink.clone()))
            .level(LevelFilter::Debug)
            .batch_size(2)
            .build();

        logger.log(
            &Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Info)
                .target("test")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("world"))
                .level(log::Level::Debug)
                .target("test")
                .build(),
        );
        logger.shutdown();

        let out = sink.contents();
        assert!(out.contains("hello"), "missing line in {out:?}");
        assert!(out.contains("world"), "missing line in {out:?}");
    }

    /// Tests that records below the level filter are discarded.
    #[test]
    fn test_level_filter() {
        let sink = SharedSink::default();
        let logger = AsyncLogger::to_writer(Box::new(sink.clone()))
            .level(LevelFilter::Warn)
            .build();

        logger.log(
            &Record::builder()
                .args(format_args!("quiet"))
                .level(log::Level::Info)
                .target("test")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("loud"))
                .level(log::Level::Warn)
                .target("test")
                .build(),
        );
        logger.shutdown();

        let out = sink.contents();
        assert!(!out.contains("quiet"));
        assert!(out.contains("loud"));
    }

    /// Tests that shutdown is idempotent and safe to call twice.
    #[test]
    fn test_shutdown_twice() {
        let logger = AsyncLogger::to_writer(Box::new(SharedSink::default())).build();
        logger.shutdown();
        logger.shutdown();
    }

    /// Tests that a custom formatter replaces the default line shape.
    #[test]
    fn test_custom_formatter() {
        let sink = SharedSink::default();
        let logger = AsyncLogger::to_writer(Box::new(sink.clone()))
            .formatter(Box::new(|r| format!("<{}>", r.args())))
            .build();
        logger.log(
            &Record::builder()
                .args(format_args!("x"))
                .level(log::Level::Error)
                .target("test")
                .build(),
        );
        logger.shutdown();
        assert!(sink.contents().contains("<x>"));
    }
}
