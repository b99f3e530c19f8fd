use crate::record::LogRecord;
use crate::sink::{BulkSession, BulkSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;

/// A committed record together with the expiration metadata it was written
/// with.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: LogRecord,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    committed: Vec<StoredRecord>,
    opens: usize,
    sessions_closed: usize,
    fail_opens: usize,
    fail_writes: usize,
    fail_closes: usize,
    missing_target: bool,
}

/// In-memory [`BulkSink`] with failure injection.
///
/// Useful for tests and for measuring pipeline overhead without external
/// I/O. Sessions buffer writes and only move them into the committed set on
/// a successful close, mirroring the session contract; a failed write
/// breaks the handle for good.
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
    write_delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write by `delay`; lets overload tests slow the drain side.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    /// Fail the next `n` opens with a transient error.
    pub fn fail_next_opens(&self, n: usize) {
        self.lock().fail_opens = n;
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().fail_writes = n;
    }

    /// Fail the next `n` closes with a transient error.
    pub fn fail_next_closes(&self, n: usize) {
        self.lock().fail_closes = n;
    }

    /// Make every open fail fatally, as if the target had been deleted.
    pub fn set_missing_target(&self, missing: bool) {
        self.lock().missing_target = missing;
    }

    pub fn committed(&self) -> Vec<StoredRecord> {
        self.lock().committed.clone()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn sessions_closed(&self) -> usize {
        self.lock().sessions_closed
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn open(&self, target: &str) -> Result<Box<dyn BulkSession>, SinkError> {
        let mut state = self.lock();
        state.opens += 1;
        if state.missing_target {
            return Err(SinkError::TargetMissing(target.to_string()));
        }
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(SinkError::transport("injected open failure"));
        }
        Ok(Box::new(MemorySession {
            sink: self.clone(),
            buffered: Vec::new(),
            broken: false,
        }))
    }
}

struct MemorySession {
    sink: MemorySink,
    buffered: Vec<StoredRecord>,
    broken: bool,
}

#[async_trait]
impl BulkSession for MemorySession {
    async fn write(
        &mut self,
        record: &LogRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        if self.broken {
            return Err(SinkError::SessionClosed);
        }
        if let Some(delay) = self.sink.write_delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.sink.lock();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                self.broken = true;
                return Err(SinkError::transport("injected write failure"));
            }
        }
        self.buffered.push(StoredRecord { record: record.clone(), expires_at });
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), SinkError> {
        if self.broken {
            return Err(SinkError::SessionClosed);
        }
        let mut state = self.sink.lock();
        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(SinkError::transport("injected close failure"));
        }
        state.committed.extend(self.buffered);
        state.sessions_closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, LogRecord};

    #[tokio::test]
    async fn commits_only_on_close() {
        let sink = MemorySink::new();
        let mut session = sink.open("logs").await.expect("open");
        let record = LogRecord::new(Level::Information, "test", "hello");
        session.write(&record, Utc::now()).await.expect("write");
        assert!(sink.committed().is_empty());
        session.close().await.expect("close");
        assert_eq!(sink.committed().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_breaks_the_session() {
        let sink = MemorySink::new();
        sink.fail_next_writes(1);
        let mut session = sink.open("logs").await.expect("open");
        let record = LogRecord::new(Level::Information, "test", "hello");
        assert!(session.write(&record, Utc::now()).await.is_err());
        assert!(matches!(
            session.write(&record, Utc::now()).await,
            Err(SinkError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn missing_target_is_fatal() {
        let sink = MemorySink::new();
        sink.set_missing_target(true);
        let err = sink.open("gone").await.err().expect("must fail");
        assert!(err.is_fatal());
    }
}
