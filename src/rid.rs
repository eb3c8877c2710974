//! Correlation id generation.
//!
//! Ids are wall-clock milliseconds, bumped to `last + 1` whenever the clock
//! collides with or falls behind the previously issued id. The compare-and-swap
//! loop keeps this strictly increasing across threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next correlation id, strictly greater than every id issued before.
    pub fn next_rid(&self) -> u64 {
        self.next_at(now_ms())
    }

    /// Most recently issued id, or 0 before the first call.
    #[must_use]
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    fn next_at(&self, now: u64) -> u64 {
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn now_ms() -> u64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "rid_test.rs"]
mod tests;
