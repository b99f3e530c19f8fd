use crate::metrics::{MetricsSnapshot, ShipperMetrics};
use crate::queue::{self, IngestionQueue};
use crate::record::{Level, LogRecord};
use crate::sink::BulkSink;
use crate::writer::BatchWriter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Tuning knobs for a [`LogShipper`].
///
/// The defaults match the reference deployment: 4-day retention, an
/// 8192-record queue, and commit cadence bounded by a 512-record /
/// 5-second session window.
#[derive(Debug, Clone)]
pub struct ShipperOptions {
    /// Bulk-write target passed to [`BulkSink::open`].
    pub database: String,
    /// Expiration metadata offset: records are marked to auto-purge this
    /// long after they are written.
    pub retention: Duration,
    /// Whether records keep their scope list.
    pub include_scopes: bool,
    pub queue_capacity: usize,
    /// Dequeue wait; doubles as the commit cadence when traffic stops.
    pub idle_timeout: Duration,
    /// Session rotation ceiling by record count.
    pub session_max_records: usize,
    /// Session rotation ceiling by age.
    pub session_max_age: Duration,
    /// Total wait budget for retrying a failed session open.
    pub open_retry_window: Duration,
    pub open_retry_delay: Duration,
    /// Attempts for re-sending an uncommitted batch after a write failure.
    pub write_retry_attempts: u32,
    /// Initial backoff between attempts; doubles each time.
    pub write_retry_initial_delay: Duration,
    /// Wall-clock budget for the whole retry sequence.
    pub write_retry_window: Duration,
}

impl ShipperOptions {
    pub fn new(database: impl Into<String>) -> Self {
        ShipperOptions { database: database.into(), ..Default::default() }
    }
}

impl Default for ShipperOptions {
    fn default() -> Self {
        ShipperOptions {
            database: "logs".to_string(),
            retention: Duration::from_secs(4 * 24 * 60 * 60),
            include_scopes: true,
            queue_capacity: 8192,
            idle_timeout: Duration::from_millis(500),
            session_max_records: 512,
            session_max_age: Duration::from_secs(5),
            open_retry_window: Duration::from_secs(10),
            open_retry_delay: Duration::from_millis(200),
            write_retry_attempts: 8,
            write_retry_initial_delay: Duration::from_millis(50),
            write_retry_window: Duration::from_secs(8),
        }
    }
}

struct Inner {
    queue: IngestionQueue,
    options: ShipperOptions,
    metrics: Arc<ShipperMetrics>,
    loggers: Mutex<HashMap<String, Logger>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Owns the ingestion queue and the single writer task.
///
/// `start` constructs the pipeline, `submit`/[`Logger`] feed it, and
/// `shutdown` drains it. Cloning shares the same pipeline; a shipper is
/// not restartable after shutdown.
#[derive(Clone)]
pub struct LogShipper {
    inner: Arc<Inner>,
}

impl LogShipper {
    /// Construct the queue and start exactly one writer task bound to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(sink: Arc<dyn BulkSink>, options: ShipperOptions) -> LogShipper {
        let metrics = Arc::new(ShipperMetrics::new());
        let (queue, consumer) = queue::bounded(options.queue_capacity, Arc::clone(&metrics));
        let writer = BatchWriter::new(sink, consumer, options.clone(), Arc::clone(&metrics));
        let worker = tokio::spawn(writer.run());
        LogShipper {
            inner: Arc::new(Inner {
                queue,
                options,
                metrics,
                loggers: Mutex::new(HashMap::new()),
                worker: Mutex::new(Some(worker)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue one record.
    ///
    /// Safe from any number of concurrent producers; waits at most the
    /// record's severity-scaled backpressure timeout and never raises.
    /// After [`LogShipper::shutdown`] this is a no-op.
    pub async fn submit(&self, mut record: LogRecord) {
        if !self.inner.options.include_scopes {
            record.scopes = None;
        }
        self.inner.queue.enqueue(record).await;
    }

    /// Get or create the [`Logger`] for `category`.
    ///
    /// The registry is owned by this instance; there is no process-wide
    /// logger table.
    pub fn logger(&self, category: impl Into<String>) -> Logger {
        let category = category.into();
        let mut loggers = lock(&self.inner.loggers);
        loggers
            .entry(category.clone())
            .or_insert_with(|| Logger {
                category,
                queue: self.inner.queue.clone(),
                include_scopes: self.inner.options.include_scopes,
            })
            .clone()
    }

    pub fn options(&self) -> &ShipperOptions {
        &self.inner.options
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Stop intake, drain everything already accepted, and wait for the
    /// writer task to exit. Idempotent; a second call (even concurrent with
    /// the first) returns without waiting.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.queue.complete();
        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                eprintln!("log writer task failed during shutdown: {e}");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> IngestionQueue {
        self.inner.queue.clone()
    }

    #[cfg(test)]
    pub(crate) fn logger_count(&self) -> usize {
        lock(&self.inner.loggers).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Category-bound producer handle created by [`LogShipper::logger`].
#[derive(Clone)]
pub struct Logger {
    category: String,
    queue: IngestionQueue,
    include_scopes: bool,
}

impl Logger {
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Build a record carrying this logger's category.
    pub fn record(&self, level: Level, text: impl Into<String>) -> LogRecord {
        LogRecord::new(level, self.category.clone(), text)
    }

    /// Enqueue with the severity-scaled backpressure wait.
    pub async fn log(&self, mut record: LogRecord) {
        if !self.include_scopes {
            record.scopes = None;
        }
        self.queue.enqueue(record).await;
    }

    /// Non-blocking enqueue for synchronous call sites.
    pub fn log_now(&self, mut record: LogRecord) {
        if !self.include_scopes {
            record.scopes = None;
        }
        self.queue.try_enqueue(record);
    }
}
