//! Clock offset and latency estimation from `ALIVE_MONITORING` exchanges.
//!
//! DESIGN
//! ======
//! On open the client sends its send time `t0`. The peer answers with
//! `[server_sent (t2), server_received (t1)]`, and the receive time `t3` is
//! taken locally:
//!
//! ```text
//! offset  = ((t1 - t0) - (t3 - t2)) / 2
//! latency = ((t3 - t0) - (t2 - t1)) / 2
//! ```
//!
//! Both fold into running means over every sample seen this session,
//! including unsolicited ones. Times are float seconds since the Unix epoch.

use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use frames::Value;

use crate::error::DuctError;

/// Running estimate of the remote clock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockSnapshot {
    /// Mean offset of the remote clock relative to ours, in seconds.
    pub offset: f64,
    /// Mean one-way latency, in seconds.
    pub latency: f64,
    /// Samples folded into the means.
    pub count: u64,
}

impl ClockSnapshot {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    fn fold(self, offset: f64, latency: f64) -> Self {
        let n = self.count as f64;
        Self {
            offset: (self.offset * n + offset) / (n + 1.0),
            latency: (self.latency * n + latency) / (n + 1.0),
            count: self.count + 1,
        }
    }
}

#[derive(Debug, Default)]
struct ClockState {
    client_sent: f64,
    snapshot: ClockSnapshot,
}

#[derive(Debug, Default)]
pub struct ClockSync {
    state: Mutex<ClockState>,
}

impl ClockSync {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the estimate for a new session and record the probe send time.
    pub fn start(&self, client_sent: f64) {
        let mut state = self.lock();
        state.client_sent = client_sent;
        state.snapshot = ClockSnapshot::default();
    }

    #[must_use]
    pub fn snapshot(&self) -> ClockSnapshot {
        self.lock().snapshot
    }

    /// Fold an `ALIVE_MONITORING` reply payload received now.
    ///
    /// # Errors
    ///
    /// Returns a protocol error unless the payload is `[server_sent, server_received]`.
    pub fn observe(&self, data: &Value) -> Result<ClockSnapshot, DuctError> {
        let client_received = now_secs();
        let (server_sent, server_received) = match data.as_array().map(Vec::as_slice) {
            Some([sent, received]) => (
                sent.as_f64().or_else(|| sent.as_i64().map(int_secs)),
                received.as_f64().or_else(|| received.as_i64().map(int_secs)),
            ),
            _ => (None, None),
        };
        let (Some(server_sent), Some(server_received)) = (server_sent, server_received) else {
            return Err(DuctError::protocol(format!(
                "alive monitoring payload is not [server_sent, server_received]: {data}"
            )));
        };
        Ok(self.record(server_sent, server_received, client_received))
    }

    /// Fold one sample given all four timestamps.
    pub fn record(&self, server_sent: f64, server_received: f64, client_received: f64) -> ClockSnapshot {
        let mut state = self.lock();
        let (offset, latency) = sample(state.client_sent, server_received, server_sent, client_received);
        state.snapshot = state.snapshot.fold(offset, latency);
        tracing::debug!(offset, latency, count = state.snapshot.count, "ducts: clock sample");
        state.snapshot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Offset and latency of one exchange.
#[must_use]
pub fn sample(client_sent: f64, server_received: f64, server_sent: f64, client_received: f64) -> (f64, f64) {
    let offset = ((server_received - client_sent) - (client_received - server_sent)) / 2.0;
    let latency = ((client_received - client_sent) - (server_sent - server_received)) / 2.0;
    (offset, latency)
}

/// Current time as float seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[allow(clippy::cast_precision_loss)]
fn int_secs(v: i64) -> f64 {
    v as f64
}

#[cfg(test)]
#[path = "clock_test.rs"]
mod tests;
