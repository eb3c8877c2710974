//! Event ids, connection events, and connection-state observers.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Deserialize;

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Websocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code recorded when the peer's close frame carried no status.
pub const NO_STATUS: u16 = 1005;

/// Close code recorded when the stream ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Outcome of a completed transport close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close recorded when the stream ended without a close handshake.
    #[must_use]
    pub fn abnormal() -> Self {
        Self::new(ABNORMAL_CLOSURE, "")
    }

    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Closing,
}

// =============================================================================
// EVENT TABLE
// =============================================================================

/// Reserved events the engine consumes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemEvent {
    AliveMonitoring,
    LoopResponseStart,
    LoopResponseNext,
    LoopResponseEnd,
    DividedResponseAppend,
    DividedResponseEnd,
}

impl SystemEvent {
    pub const ALL: [Self; 6] = [
        Self::AliveMonitoring,
        Self::LoopResponseStart,
        Self::LoopResponseNext,
        Self::LoopResponseEnd,
        Self::DividedResponseAppend,
        Self::DividedResponseEnd,
    ];

    /// Symbolic name as published in the discovery `EVENT` table.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::AliveMonitoring => "ALIVE_MONITORING",
            Self::LoopResponseStart => "LOOP_RESPONSE_START",
            Self::LoopResponseNext => "LOOP_RESPONSE_NEXT",
            Self::LoopResponseEnd => "LOOP_RESPONSE_END",
            Self::DividedResponseAppend => "DIVIDED_RESPONSE_APPEND",
            Self::DividedResponseEnd => "DIVIDED_RESPONSE_END",
        }
    }
}

/// Symbolic event names mapped to signed event ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct EventTable(HashMap<String, i32>);

impl EventTable {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<i32> {
        self.0.get(name).copied()
    }

    #[must_use]
    pub fn system(&self, event: SystemEvent) -> Option<i32> {
        self.get(event.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i32)> {
        self.0.iter().map(|(name, eid)| (name.as_str(), *eid))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, i32)> for EventTable {
    fn from_iter<I: IntoIterator<Item = (S, i32)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, eid)| (name.into(), eid)).collect())
    }
}

// =============================================================================
// CONNECTION EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Open,
    Close,
    Error,
    Message,
}

/// Transport-level event delivered to a [`ConnectionListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open { url: String },
    Close(CloseEvent),
    Error { message: String },
    Message { bytes: Vec<u8> },
}

impl ConnectionEvent {
    #[must_use]
    pub fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Open { .. } => ConnectionEventKind::Open,
            Self::Close(_) => ConnectionEventKind::Close,
            Self::Error { .. } => ConnectionEventKind::Error,
            Self::Message { .. } => ConnectionEventKind::Message,
        }
    }
}

pub type ConnectionHook = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Passthrough observers for connection events. They never alter dispatch.
#[derive(Clone, Default)]
pub struct ConnectionListener {
    pub on_open: Option<ConnectionHook>,
    pub on_close: Option<ConnectionHook>,
    pub on_error: Option<ConnectionHook>,
    pub on_message: Option<ConnectionHook>,
}

impl ConnectionListener {
    #[must_use]
    pub fn hook(&self, kind: ConnectionEventKind) -> Option<&ConnectionHook> {
        match kind {
            ConnectionEventKind::Open => self.on_open.as_ref(),
            ConnectionEventKind::Close => self.on_close.as_ref(),
            ConnectionEventKind::Error => self.on_error.as_ref(),
            ConnectionEventKind::Message => self.on_message.as_ref(),
        }
    }

    /// Run the hook for `event`, if set. A panicking hook is logged.
    pub fn notify(&self, event: &ConnectionEvent) {
        let Some(hook) = self.hook(event.kind()) else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
            tracing::warn!(kind = ?event.kind(), "ducts: connection listener panicked");
        }
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
