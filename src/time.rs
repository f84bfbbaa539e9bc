//! Wall-clock timestamps for store records
//!
//! Records carry milliseconds since the Unix epoch. Stamps issued by one
//! participant must strictly increase, otherwise two offers written within
//! the same millisecond would be indistinguishable to the listener's
//! one-shot guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-process clock that never issues the same stamp twice
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a stamp strictly greater than every stamp issued before
    pub fn stamp(&self) -> u64 {
        let now = now_ms();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}
