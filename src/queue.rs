use crate::metrics::ShipperMetrics;
use crate::record::LogRecord;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Duration;

/// State shared between the producer and consumer halves.
struct Shared {
    completed: AtomicBool,
    shutdown: Notify,
}

/// Result of a timed dequeue.
#[derive(Debug)]
pub enum Dequeue {
    Record(LogRecord),
    /// No record arrived within the wait; the queue is still accepting.
    TimedOut,
    /// Completion was signaled and every buffered record has been handed out.
    Drained,
}

/// Producer half of the bounded ingestion queue.
///
/// Cheap to clone; any number of producers may enqueue concurrently. The
/// queue is the only synchronization point of the pipeline: producers wait
/// at most a severity-scaled timeout when it is full, and nothing they do
/// can raise into application code.
#[derive(Clone)]
pub struct IngestionQueue {
    tx: mpsc::Sender<LogRecord>,
    shared: Arc<Shared>,
    metrics: Arc<ShipperMetrics>,
}

/// Consumer half, owned by the single writer task.
pub struct QueueConsumer {
    rx: mpsc::Receiver<LogRecord>,
    shared: Arc<Shared>,
}

/// Create a bounded queue split into its producer and consumer halves.
pub fn bounded(capacity: usize, metrics: Arc<ShipperMetrics>) -> (IngestionQueue, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared { completed: AtomicBool::new(false), shutdown: Notify::new() });
    let queue = IngestionQueue { tx, shared: Arc::clone(&shared), metrics };
    let consumer = QueueConsumer { rx, shared };
    (queue, consumer)
}

impl IngestionQueue {
    /// Enqueue a record, waiting up to the record's severity-scaled timeout
    /// when the queue is full.
    ///
    /// Never returns an error: a full queue, a completed queue, or a dead
    /// consumer all end in the record being dropped and counted. Enqueueing
    /// after [`IngestionQueue::complete`] is a documented no-op.
    pub async fn enqueue(&self, record: LogRecord) {
        if self.shared.completed.load(Ordering::Acquire) {
            self.metrics.record_dropped();
            return;
        }
        let wait = record.level.enqueue_wait();
        match self.tx.try_send(record) {
            Ok(()) => self.metrics.record_enqueued(),
            Err(TrySendError::Closed(_)) => self.metrics.record_dropped(),
            Err(TrySendError::Full(record)) => match self.tx.send_timeout(record, wait).await {
                Ok(()) => self.metrics.record_enqueued(),
                Err(SendTimeoutError::Timeout(record)) => {
                    self.metrics.record_dropped();
                    eprintln!(
                        "log queue full, dropping {} record from '{}'",
                        record.level.as_str(),
                        record.category
                    );
                }
                Err(SendTimeoutError::Closed(_)) => self.metrics.record_dropped(),
            },
        }
    }

    /// Non-blocking enqueue for synchronous call sites such as the tracing
    /// layer: a full queue drops the record immediately.
    pub fn try_enqueue(&self, record: LogRecord) {
        if self.shared.completed.load(Ordering::Acquire) {
            self.metrics.record_dropped();
            return;
        }
        match self.tx.try_send(record) {
            Ok(()) => self.metrics.record_enqueued(),
            Err(TrySendError::Full(record)) => {
                self.metrics.record_dropped();
                eprintln!(
                    "log queue full, dropping {} record from '{}'",
                    record.level.as_str(),
                    record.category
                );
            }
            Err(TrySendError::Closed(_)) => self.metrics.record_dropped(),
        }
    }

    /// Signal that no further records will be accepted. Idempotent.
    pub fn complete(&self) {
        self.shared.completed.store(true, Ordering::Release);
        self.shared.shutdown.notify_one();
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }
}

impl QueueConsumer {
    /// Wait up to `wait` for one record.
    ///
    /// Records buffered before completion keep flowing after it is signaled;
    /// [`Dequeue::Drained`] is only returned once the queue is completed AND
    /// empty, so the writer never exits with accepted records still queued.
    pub async fn dequeue(&mut self, wait: Duration) -> Dequeue {
        if self.shared.completed.load(Ordering::Acquire) {
            // Closing the receiver rejects sends that lost the race with
            // completion while still handing out everything buffered.
            self.rx.close();
        }
        let waited = tokio::select! {
            record = self.rx.recv() => Some(record),
            _ = self.shared.shutdown.notified() => None,
            _ = tokio::time::sleep(wait) => return Dequeue::TimedOut,
        };
        match waited {
            Some(Some(record)) => Dequeue::Record(record),
            Some(None) => Dequeue::Drained,
            // Woken by completion mid-wait: switch to drain mode and pull
            // whatever is left.
            None => {
                self.rx.close();
                match self.rx.try_recv() {
                    Ok(record) => Dequeue::Record(record),
                    Err(_) => Dequeue::Drained,
                }
            }
        }
    }

    /// Stop intake from the consumer side; used by the writer on fatal sink
    /// failures.
    pub fn complete(&self) {
        self.shared.completed.store(true, Ordering::Release);
        self.shared.shutdown.notify_one();
    }

    /// Records currently buffered and not yet handed out.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    /// True once completion is signaled and all buffered records were drained.
    pub fn is_complete(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire) && self.rx.is_empty()
    }

    pub fn completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }
}
