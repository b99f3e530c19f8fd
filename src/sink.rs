use crate::record::LogRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors reported by a [`BulkSink`] or [`BulkSession`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// The named write target does not exist. Never retried: the writer
    /// stops ingestion permanently when it sees this.
    #[error("target '{0}' does not exist")]
    TargetMissing(String),

    /// Network / transport / backend failure. Retried with backoff.
    #[error("sink transport error: {0}")]
    Transport(String),

    /// A record could not be serialized for the wire.
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Write attempted on a session already broken by an earlier failure.
    #[error("session is no longer usable")]
    SessionClosed,
}

impl SinkError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SinkError::Transport(msg.into())
    }

    /// Fatal errors terminate ingestion instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::TargetMissing(_))
    }
}

/// Remote store exposing bulk-write sessions for [`LogRecord`]s.
///
/// The writer task is the only caller: a session handle is owned by it
/// exclusively and is either open-and-owned or discarded, never shared.
#[async_trait]
pub trait BulkSink: Send + Sync {
    /// Open a bulk-write session against `target`.
    ///
    /// **Returns**
    /// - `Ok(session)` on success.
    /// - `Err(SinkError::TargetMissing)` when the target does not exist;
    ///   the writer treats this as fatal.
    /// - any other error is considered transient and retried with short
    ///   sleeps under a capped total wait.
    async fn open(&self, target: &str) -> Result<Box<dyn BulkSession>, SinkError>;
}

/// A handle accumulating writes until closed.
///
/// After any failed call the handle is unusable and must be discarded
/// without closing; the records it held are re-sent through a fresh
/// session by the writer.
#[async_trait]
pub trait BulkSession: Send {
    /// Buffer one record for this session.
    ///
    /// `expires_at` is write metadata, not part of the record: it tells the
    /// store to auto-purge the document after that point.
    async fn write(
        &mut self,
        record: &LogRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SinkError>;

    /// Commit everything buffered by this session.
    ///
    /// A failure here counts as a write failure for every record in the
    /// session.
    async fn close(self: Box<Self>) -> Result<(), SinkError>;
}
