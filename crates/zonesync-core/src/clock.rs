//! Time sources and the remote clock offset
//!
//! Every persisted `last_updated` is expressed in the sync server's clock
//! frame: local wall-clock time plus the most recent offset estimate. This
//! keeps local edits comparable with timestamps pulled from the server.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of epoch-millisecond wall-clock time
pub trait TimeSource: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// The system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Local time plus the estimated offset to the server clock
#[derive(Debug)]
pub struct SyncClock {
    source: Arc<dyn TimeSource>,
    offset: AtomicI64,
    /// Local time of the last offset estimate, 0 if never estimated
    estimated_at: AtomicI64,
}

impl SyncClock {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            offset: AtomicI64::new(0),
            estimated_at: AtomicI64::new(0),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }

    /// Local wall-clock time
    pub fn local_now(&self) -> i64 {
        self.source.now_millis()
    }

    /// Current time in the server frame
    pub fn now(&self) -> i64 {
        self.local_now() + self.offset()
    }

    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::SeqCst)
    }

    /// Whether the offset has been estimated at least once
    pub fn is_estimated(&self) -> bool {
        self.estimated_at.load(Ordering::SeqCst) != 0
    }

    /// Whether a fresh estimate is due given the re-estimation period
    pub fn estimate_due(&self, period_ms: i64) -> bool {
        let at = self.estimated_at.load(Ordering::SeqCst);
        at == 0 || self.local_now() - at >= period_ms
    }

    /// Record an offset from a time request bracketed by `sent_at` and
    /// `received_at` (both local); half the round trip is the one-way delay.
    pub fn record_estimate(&self, server_time: i64, sent_at: i64, received_at: i64) -> i64 {
        let half_rtt = (received_at - sent_at).max(0) / 2;
        let offset = server_time + half_rtt - received_at;
        self.offset.store(offset, Ordering::SeqCst);
        self.estimated_at.store(received_at.max(1), Ordering::SeqCst);
        offset
    }

    /// Refine the offset from a server timestamp observed at local `observed_at`
    pub fn refine(&self, server_time: i64, observed_at: i64) -> i64 {
        let offset = server_time - observed_at;
        self.offset.store(offset, Ordering::SeqCst);
        offset
    }
}
