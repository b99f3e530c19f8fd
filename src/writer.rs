use crate::metrics::ShipperMetrics;
use crate::queue::{Dequeue, QueueConsumer};
use crate::record::LogRecord;
use crate::shipper::ShipperOptions;
use crate::sink::{BulkSession, BulkSink, SinkError};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Instant};

/// Worker states. `Stopped` is terminal and reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    /// No open sink session.
    Idle,
    /// Holding a live session with uncommitted writes.
    SessionOpen,
    /// Queue completed and drained; finishing the in-flight commit.
    Draining,
    Stopped,
}

/// The single background worker: drains the queue, accumulates records into
/// bulk-write sessions, and commits them with retry and backoff.
///
/// Failure policy: transient sink errors are retried against fresh sessions
/// until the retry budget runs out, then the batch is abandoned with a
/// diagnostic and the loop moves on. A missing target is fatal: intake is
/// completed and the worker stops. Nothing here ever propagates into
/// producer call sites.
pub(crate) struct BatchWriter {
    sink: Arc<dyn BulkSink>,
    consumer: QueueConsumer,
    options: ShipperOptions,
    metrics: Arc<ShipperMetrics>,
    session: Option<Box<dyn BulkSession>>,
    session_opened_at: Instant,
    /// Records written into the open session since the last successful
    /// commit. Retries reuse these instances; they are never re-queued.
    pending: Vec<LogRecord>,
}

impl BatchWriter {
    pub(crate) fn new(
        sink: Arc<dyn BulkSink>,
        consumer: QueueConsumer,
        options: ShipperOptions,
        metrics: Arc<ShipperMetrics>,
    ) -> Self {
        BatchWriter {
            sink,
            consumer,
            options,
            metrics,
            session: None,
            session_opened_at: Instant::now(),
            pending: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state = WriterState::Idle;
        loop {
            state = match state {
                WriterState::Idle => self.idle().await,
                WriterState::SessionOpen => self.session_open().await,
                WriterState::Draining => self.drain().await,
                WriterState::Stopped => return,
            };
        }
    }

    async fn idle(&mut self) -> WriterState {
        match self.consumer.dequeue(self.options.idle_timeout).await {
            Dequeue::TimedOut => WriterState::Idle,
            Dequeue::Drained => WriterState::Stopped,
            Dequeue::Record(record) => match self.open_with_retry().await {
                Ok(session) => {
                    self.session = Some(session);
                    self.session_opened_at = Instant::now();
                    self.metrics.session_opened();
                    self.store(record).await
                }
                Err(e) => {
                    self.pending.push(record);
                    self.stop(e)
                }
            },
        }
    }

    async fn session_open(&mut self) -> WriterState {
        match self.consumer.dequeue(self.options.idle_timeout).await {
            Dequeue::Record(record) => self.store(record).await,
            // No traffic: commit what the session holds rather than letting
            // it go stale.
            Dequeue::TimedOut => self.rotate().await,
            Dequeue::Drained => WriterState::Draining,
        }
    }

    async fn drain(&mut self) -> WriterState {
        // Whatever the commit outcome, there is nothing left to pull.
        self.rotate().await;
        WriterState::Stopped
    }

    /// Write one record into the open session, rotating the session once it
    /// holds `session_max_records` or has been open for `session_max_age`.
    async fn store(&mut self, record: LogRecord) -> WriterState {
        self.pending.push(record);
        let expires_at = Utc::now() + self.options.retention;
        let result = match (self.session.as_mut(), self.pending.last()) {
            (Some(session), Some(record)) => session.write(record, expires_at).await,
            _ => return WriterState::Idle,
        };
        match result {
            Ok(()) => {
                if self.pending.len() >= self.options.session_max_records
                    || self.session_opened_at.elapsed() >= self.options.session_max_age
                {
                    self.rotate().await
                } else {
                    WriterState::SessionOpen
                }
            }
            Err(e) if e.is_fatal() => self.stop(e),
            Err(e) => self.recover(e).await,
        }
    }

    /// Close the open session, committing its records.
    async fn rotate(&mut self) -> WriterState {
        let session = match self.session.take() {
            Some(session) => session,
            None => return WriterState::Idle,
        };
        match session.close().await {
            Ok(()) => {
                self.metrics.record_committed(self.pending.len() as u64);
                self.pending.clear();
                WriterState::Idle
            }
            Err(e) if e.is_fatal() => self.stop(e),
            Err(e) => self.recover(e).await,
        }
    }

    /// A write or commit failed: the broken session is discarded without
    /// closing and the whole uncommitted batch is re-sent through fresh
    /// sessions with doubling backoff, until it lands or the budget runs
    /// out.
    async fn recover(&mut self, error: SinkError) -> WriterState {
        self.session = None;
        let batch = self.pending.len();
        eprintln!("bulk write failed, retrying batch of {batch} log record(s): {error}");
        let deadline = Instant::now() + self.options.write_retry_window;
        let mut delay = self.options.write_retry_initial_delay;
        let mut last_error = error;
        for _ in 0..self.options.write_retry_attempts {
            sleep(delay).await;
            delay *= 2;
            match self.flush_pending().await {
                Ok(()) => {
                    self.metrics.record_committed(batch as u64);
                    self.pending.clear();
                    return WriterState::Idle;
                }
                Err(e) if e.is_fatal() => return self.stop(e),
                Err(e) => last_error = e,
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        eprintln!("abandoning batch of {batch} log record(s) after retries: {last_error}");
        self.metrics.record_abandoned(batch as u64);
        self.pending.clear();
        WriterState::Idle
    }

    /// One retry attempt: fresh session, rewrite the batch, commit.
    async fn flush_pending(&mut self) -> Result<(), SinkError> {
        let mut session = self.sink.open(&self.options.database).await?;
        self.metrics.session_opened();
        let expires_at = Utc::now() + self.options.retention;
        for record in &self.pending {
            session.write(record, expires_at).await?;
        }
        session.close().await
    }

    /// Opening a session is retried with short sleeps under a capped total
    /// wait; past that (or on a fatal error) the failure is final for this
    /// worker.
    async fn open_with_retry(&mut self) -> Result<Box<dyn BulkSession>, SinkError> {
        let deadline = Instant::now() + self.options.open_retry_window;
        loop {
            match self.sink.open(&self.options.database).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if self.consumer.completed() || Instant::now() >= deadline {
                        return Err(e);
                    }
                    eprintln!("failed to open bulk session, retrying: {e}");
                    sleep(self.options.open_retry_delay).await;
                }
            }
        }
    }

    /// Terminal failure: report, drop what cannot be delivered, stop intake,
    /// and exit the loop for good.
    fn stop(&mut self, error: SinkError) -> WriterState {
        let queued = self.consumer.buffered();
        eprintln!(
            "fatal sink failure, stopping log shipping ({} in-flight, {queued} queued record(s) lost): {error}",
            self.pending.len()
        );
        let lost = self.pending.len() + queued;
        if lost > 0 {
            self.metrics.record_abandoned(lost as u64);
        }
        self.pending.clear();
        self.session = None;
        self.consumer.complete();
        WriterState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySink;
    use crate::queue::{self, IngestionQueue};
    use crate::record::{Level, LogRecord};
    use tokio::task::JoinHandle;
    use tokio::time::Duration;

    fn options() -> ShipperOptions {
        ShipperOptions {
            idle_timeout: Duration::from_millis(20),
            ..ShipperOptions::new("logs")
        }
    }

    fn spawn_writer(
        sink: &MemorySink,
        options: ShipperOptions,
    ) -> (IngestionQueue, Arc<ShipperMetrics>, JoinHandle<()>) {
        let metrics = Arc::new(ShipperMetrics::new());
        let (queue, consumer) = queue::bounded(options.queue_capacity, Arc::clone(&metrics));
        let writer = BatchWriter::new(Arc::new(sink.clone()), consumer, options, Arc::clone(&metrics));
        let handle = tokio::spawn(writer.run());
        (queue, metrics, handle)
    }

    fn record(text: &str) -> LogRecord {
        LogRecord::new(Level::Information, "test", text)
    }

    #[tokio::test(start_paused = true)]
    async fn commits_batch_when_traffic_pauses() {
        let sink = MemorySink::new();
        let (queue, metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("only")).await;

        // One idle timeout is enough to force the commit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.committed().len(), 1);
        assert_eq!(metrics.snapshot().committed, 1);

        queue.complete();
        handle.await.expect("worker");
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_session_at_record_ceiling() {
        let sink = MemorySink::new();
        let opts = ShipperOptions { session_max_records: 2, ..options() };
        let (queue, _metrics, handle) = spawn_writer(&sink, opts);
        for i in 0..4 {
            queue.enqueue(record(&format!("r{i}"))).await;
        }
        queue.complete();
        handle.await.expect("worker");

        assert_eq!(sink.committed().len(), 4);
        assert!(sink.sessions_closed() >= 2, "expected periodic rotation");
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_fifo_order() {
        let sink = MemorySink::new();
        let (queue, _metrics, handle) = spawn_writer(&sink, options());
        for i in 0..10 {
            queue.enqueue(record(&format!("r{i}"))).await;
        }
        queue.complete();
        handle.await.expect("worker");

        let texts: Vec<String> = sink.committed().iter().map(|s| s.record.text.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_write_failures() {
        let sink = MemorySink::new();
        sink.fail_next_writes(2);
        let (queue, metrics, handle) = spawn_writer(&sink, options());
        for i in 0..3 {
            queue.enqueue(record(&format!("r{i}"))).await;
        }
        queue.complete();
        handle.await.expect("worker");

        assert_eq!(sink.committed().len(), 3);
        assert_eq!(metrics.snapshot().abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_close_failures() {
        let sink = MemorySink::new();
        sink.fail_next_closes(1);
        let (queue, _metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("survives commit failure")).await;
        queue.complete();
        handle.await.expect("worker");

        assert_eq!(sink.committed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandons_batch_after_retry_budget_then_continues() {
        let sink = MemorySink::new();
        // First write plus every retry attempt fails; the next record is
        // untouched by the injection and must still be delivered.
        sink.fail_next_writes(1 + options().write_retry_attempts as usize);
        let (queue, metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("abandoned")).await;
        queue.enqueue(record("delivered")).await;
        queue.complete();
        handle.await.expect("worker");

        let committed = sink.committed();
        assert_eq!(metrics.snapshot().abandoned, 1);
        assert!(committed.iter().any(|s| s.record.text == "delivered"));
        assert!(committed.iter().all(|s| s.record.text != "abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_target_stops_the_worker() {
        let sink = MemorySink::new();
        sink.set_missing_target(true);
        let (queue, _metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("never lands")).await;

        // The worker exits on its own; nobody calls complete().
        handle.await.expect("worker");
        assert!(queue.is_completed());
        assert!(sink.committed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn open_retry_budget_exhaustion_stops_the_worker() {
        let sink = MemorySink::new();
        sink.fail_next_opens(usize::MAX);
        let (queue, _metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("never lands")).await;

        handle.await.expect("worker");
        assert!(queue.is_completed());
        assert!(sink.opens() > 1, "open should have been retried");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_open_failure_recovers() {
        let sink = MemorySink::new();
        sink.fail_next_opens(2);
        let (queue, _metrics, handle) = spawn_writer(&sink, options());
        queue.enqueue(record("after retry")).await;

        // Open retries stand down once completion is signaled, so let them
        // finish before shutting the queue.
        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.complete();
        handle.await.expect("worker");

        assert_eq!(sink.committed().len(), 1);
        assert_eq!(sink.opens(), 3);
    }
}
