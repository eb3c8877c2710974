//! Error types for the ducts client.
//!
//! DESIGN
//! ======
//! One enum for every failure a caller can observe, discriminated by
//! [`ErrorKind`] instead of a type hierarchy. Per-frame dispatch failures are
//! never returned to a caller; they surface as [`EventFault`] values on the
//! event-error callback.

use frames::{Frame, Value};

use crate::event::CloseEvent;

/// Boxed error returned by user event handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse category of a [`DuctError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Discovery or websocket connect failed.
    Transport,
    /// Inbound bytes or a system frame did not match the protocol.
    Protocol,
    /// The remote answered with a negative event id.
    Application,
    /// A registered event handler failed.
    Handler,
    /// The connection closed with a non-normal code.
    Close,
    /// The operation is not valid in the current lifecycle state.
    State,
}

#[derive(Debug, thiserror::Error)]
pub enum DuctError {
    #[error("discovery request failed: {0}")]
    Discovery(#[from] reqwest::Error),
    #[error("discovery returned HTTP {status}")]
    DiscoveryStatus { status: u16 },
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("frame codec failed: {0}")]
    Codec(#[from] frames::CodecError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("remote returned error for event {eid}: {payload}")]
    Application { eid: i32, payload: Value },
    #[error("event handler failed: {0}")]
    Handler(BoxError),
    #[error("connection closed abnormally (code {})", .0.code)]
    AbnormalClose(CloseEvent),
    #[error("not connected")]
    NotConnected,
    #[error("no discovery descriptor retained; open before reconnect")]
    NotDiscovered,
    #[error("close requested while connecting")]
    Connecting,
    #[error("reply abandoned before settlement")]
    Abandoned,
}

impl DuctError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Discovery(_)
            | Self::DiscoveryStatus { .. }
            | Self::WsConnect(_)
            | Self::ConnectTimeout(_) => ErrorKind::Transport,
            Self::Codec(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Application { .. } => ErrorKind::Application,
            Self::Handler(_) => ErrorKind::Handler,
            Self::AbnormalClose(_) => ErrorKind::Close,
            Self::NotConnected | Self::NotDiscovered | Self::Connecting | Self::Abandoned => {
                ErrorKind::State
            }
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// A failure while dispatching one inbound frame.
///
/// Dispatch continues with the next frame after a fault is reported.
#[derive(Debug)]
pub enum EventFault {
    /// The bytes could not be decoded into a frame.
    Decode { error: DuctError },
    /// A handler (user or system) failed for a decoded frame. The pending
    /// call for that frame, if any, stays unresolved.
    Handler { frame: Frame, error: DuctError },
}

impl EventFault {
    /// `(rid, eid)` of the faulting frame; `(-1, -1)` when decoding failed.
    #[must_use]
    pub fn identity(&self) -> (i64, i32) {
        match self {
            Self::Decode { .. } => (-1, -1),
            Self::Handler { frame, .. } => (
                frame.rid.and_then(|rid| i64::try_from(rid).ok()).unwrap_or(-1),
                frame.eid,
            ),
        }
    }

    /// Payload of the faulting frame; nil when decoding failed.
    #[must_use]
    pub fn data(&self) -> &Value {
        const NIL: &Value = &Value::Nil;
        match self {
            Self::Decode { .. } => NIL,
            Self::Handler { frame, .. } => &frame.data,
        }
    }

    #[must_use]
    pub fn error(&self) -> &DuctError {
        match self {
            Self::Decode { error } | Self::Handler { error, .. } => error,
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
