//! Wall-clock access and the backoff schedule shared by ingestion and the
//! retry queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MILLIS_PER_SEC: u64 = 1_000;

/// Exponent ceiling for the retry backoff. Keeps `base × 2^n` from
/// overflowing when the configured cap is raised.
const MAX_BACKOFF_EXPONENT: u32 = 20;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    fn now_secs(&self) -> u64 {
        self.now_ms() / MILLIS_PER_SEC
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// `base × 2^retry_count`, saturating.
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let factor = 1u32 << retry_count.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(factor)
}
