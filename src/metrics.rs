use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the queue and the writer.
///
/// Producers never see pipeline failures directly; these counters plus the
/// stderr diagnostics are the only observable trace of dropped or abandoned
/// records.
#[derive(Debug, Default)]
pub struct ShipperMetrics {
    /// Records accepted into the queue.
    pub enqueued: AtomicU64,
    /// Records dropped at the queue (full, or arriving after completion).
    pub dropped: AtomicU64,
    /// Records committed by a successfully closed sink session.
    pub committed: AtomicU64,
    /// Records abandoned after the write retry budget was exhausted.
    pub abandoned: AtomicU64,
    /// Sink sessions opened.
    pub sessions_opened: AtomicU64,
}

impl ShipperMetrics {
    pub const fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_committed(&self, count: u64) {
        self.committed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`ShipperMetrics`].
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub committed: u64,
    pub abandoned: u64,
    pub sessions_opened: u64,
}
