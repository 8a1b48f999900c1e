//! Wall-clock and identifier source.
//!
//! Production code uses [`SystemClock`]; tests inject a [`VirtualClock`] so
//! polling loops and cooldown windows run deterministically. All timestamps
//! are UTC and all durations are integer milliseconds.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time, monotonically non-decreasing within a process.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current time as UTC milliseconds.
    fn now_ms(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }

    /// Mint a globally unique, time-prefixed, sortable identifier.
    fn new_id(&self) -> Uuid;

    /// Sleep for the given duration. The virtual clock advances instantly.
    async fn sleep(&self, duration: Duration);
}

/// System clock, clamped so `now_utc` never goes backwards in-process.
pub struct SystemClock {
    last_ms: Mutex<i64>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last_ms: Mutex::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_ms.lock().expect("clock lock poisoned");
        let clamped = now.max(*last);
        *last = clamped;
        ms_to_datetime(clamped)
    }

    fn new_id(&self) -> Uuid {
        Uuid::now_v7()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests. Starts at a fixed instant; `sleep` advances it
/// without waiting, `advance`/`set` move it explicitly.
pub struct VirtualClock {
    now_ms: Mutex<i64>,
    seq: AtomicU32,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: Mutex::new(start.timestamp_millis()),
            seq: AtomicU32::new(0),
        }
    }

    pub fn at_ms(start_ms: i64) -> Self {
        Self {
            now_ms: Mutex::new(start_ms),
            seq: AtomicU32::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now_ms.lock().expect("clock lock poisoned");
        *now += duration.as_millis() as i64;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut now = self.now_ms.lock().expect("clock lock poisoned");
        *now = instant.timestamp_millis();
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        ms_to_datetime(*self.now_ms.lock().expect("clock lock poisoned"))
    }

    fn new_id(&self) -> Uuid {
        // Derive the v7 timestamp from virtual time so ids stay sortable
        // even when the test clock jumps.
        let ms = *self.now_ms.lock().expect("clock lock poisoned");
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let secs = (ms / 1000) as u64;
        let nanos = ((ms % 1000) as u32) * 1_000_000 + (seq % 1_000_000);
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, secs, nanos);
        Uuid::new_v7(ts)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        // Yield so concurrent tasks interleave the way they would in production.
        tokio::task::yield_now().await;
    }
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch is valid"))
}
