//! Log plumbing: the event stream the developer console tails, the tracing
//! layer that feeds it, and subscriber initialisation.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use protocol::{LogEntry, LogRecord};
use tokio::sync::broadcast;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Events retained for late subscribers.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Capacity of the live event feed.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

/// Tracing targets never republished into the stream. The console writes
/// its own diagnostics there, and echoing them back would loop.
const EXCLUDED_TARGET: &str = "paneterm::console";

struct StreamState {
    history: VecDeque<Arc<LogEntry>>,
    next_id: u64,
}

struct StreamInner {
    state: Mutex<StreamState>,
    tx: broadcast::Sender<Arc<LogEntry>>,
    limit: usize,
    published: AtomicU64,
}

/// An append-only stream of log events.
///
/// Keeps the most recent events for consumers that attach late and
/// broadcasts new ones as they arrive. Entry ids increase monotonically.
#[derive(Clone)]
pub struct LogStream {
    inner: Arc<StreamInner>,
}

impl LogStream {
    /// Create a stream retaining at most `limit` events.
    pub fn new(limit: usize) -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    history: VecDeque::new(),
                    next_id: 1,
                }),
                tx,
                limit: limit.max(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event and notify listeners.
    pub fn publish(&self, record: LogRecord) -> Arc<LogEntry> {
        let mut state = self.lock();
        let entry = Arc::new(LogEntry {
            id: state.next_id,
            record,
        });
        state.next_id += 1;
        state.history.push_back(Arc::clone(&entry));
        while state.history.len() > self.inner.limit {
            state.history.pop_front();
        }
        // Sent under the lock so listeners observe ids in order.
        let _ = self.inner.tx.send(Arc::clone(&entry));
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> Vec<Arc<LogEntry>> {
        self.lock().history.iter().cloned().collect()
    }

    /// Subscribe to events published from now on.
    pub fn listen(&self) -> broadcast::Receiver<Arc<LogEntry>> {
        self.inner.tx.subscribe()
    }

    /// Subscribe and snapshot the history atomically, so no event is missed
    /// or seen twice between the two.
    pub fn history_and_listen(&self) -> (Vec<Arc<LogEntry>>, broadcast::Receiver<Arc<LogEntry>>) {
        let state = self.lock();
        let rx = self.inner.tx.subscribe();
        let history = state.history.iter().cloned().collect();
        (history, rx)
    }

    /// Total number of events ever published.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("limit", &self.inner.limit)
            .field("published", &self.published())
            .finish()
    }
}

/// A tracing layer that republishes events into a [`LogStream`].
pub struct ConsoleLayer {
    stream: LogStream,
}

impl ConsoleLayer {
    pub fn new(stream: LogStream) -> Self {
        Self { stream }
    }
}

impl<S> Layer<S> for ConsoleLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(EXCLUDED_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let text = format!("[{}] {}", metadata.target(), visitor.finish());

        let record = match *metadata.level() {
            Level::ERROR => LogRecord::error(text),
            Level::WARN => LogRecord::warn(text),
            Level::INFO => LogRecord::info(text),
            _ => LogRecord::debug(text),
        };
        self.stream.publish(record);
    }
}

/// Collects the message and fields of an event into one line.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        let _ = write!(self.fields, " {name}={value}");
    }

    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }
}

/// Where formatted tracing output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput<'a> {
    Stderr,
    /// Append to a file through a background writer. Used while the host
    /// terminal is in raw mode.
    File(&'a Path),
}

/// Install the global subscriber.
///
/// `filter` is an `EnvFilter` directive such as `"info"` or
/// `"paneterm=debug"`. When `console` is given, events are also
/// republished into it. The returned guard flushes the file writer on drop.
pub fn init(
    filter: &str,
    output: LogOutput<'_>,
    console: Option<LogStream>,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("Invalid log filter: {filter}"))?;
    let console = console.map(ConsoleLayer::new);

    match output {
        LogOutput::Stderr => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(console)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(None)
        }
        LogOutput::File(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let file_name = path
                .file_name()
                .context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .with(console)
                .try_init()
                .context("Failed to install tracing subscriber")?;
            Ok(Some(guard))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn text_of(entry: &LogEntry) -> String {
        match entry.record.args() {
            Some([Value::String(s)]) => s.clone(),
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_publish_assigns_increasing_ids() {
        let stream = LogStream::default();
        let a = stream.publish(LogRecord::info("a"));
        let b = stream.publish(LogRecord::info("b"));
        assert!(b.id > a.id);
        assert_eq!(stream.published(), 2);
        assert_eq!(stream.history().len(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let stream = LogStream::new(3);
        for i in 0..5 {
            stream.publish(LogRecord::info(format!("{i}")));
        }
        let history = stream.history();
        assert_eq!(history.len(), 3);
        assert_eq!(text_of(&history[0]), "2");
        assert_eq!(text_of(&history[2]), "4");
    }

    #[tokio::test]
    async fn test_listen_receives_new_events_only() {
        let stream = LogStream::default();
        stream.publish(LogRecord::info("old"));
        let (history, mut rx) = stream.history_and_listen();
        assert_eq!(history.len(), 1);

        stream.publish(LogRecord::warn("new"));
        let entry = rx.recv().await.unwrap();
        assert_eq!(text_of(&entry), "new");
        assert!(entry.id > history[0].id);
    }

    #[test]
    fn test_console_layer_republishes_events() {
        let stream = LogStream::default();
        let subscriber = tracing_subscriber::registry().with(ConsoleLayer::new(stream.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "paneterm::pty", pid = 42, "Shell exited");
            tracing::info!(target: "paneterm::console", "Dropped");
        });

        let history = stream.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record.level(), protocol::LogLevel::Warn);
        assert_eq!(text_of(&history[0]), "[paneterm::pty] Shell exited pid=42");
    }

    #[test]
    fn test_init_rejects_bad_filter() {
        let result = init("paneterm=loud", LogOutput::Stderr, None);
        assert!(result.is_err());
    }
}
