use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of wall-clock time for timestamps, rate-limit windows and expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hands out strictly increasing millisecond timestamps.
///
/// Stores keep one of these so that a message appended after another always
/// sorts after it, even when both land in the same millisecond. Precision is
/// millisecond because that is what BSON datetimes hold.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last_ms: AtomicI64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let wanted = now.timestamp_millis();
        let mut prev = self.last_ms.load(Ordering::Acquire);
        loop {
            let next = wanted.max(prev + 1);
            match self
                .last_ms
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return from_millis(next).unwrap_or(now),
                Err(actual) => prev = actual,
            }
        }
    }
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
