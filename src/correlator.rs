//! Pending-call table: correlation id → one-shot reply slot.
//!
//! An entry is removed atomically by the first frame that settles it. A reply
//! for an id nobody awaits is a silent no-op.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::DuctError;
use crate::stream::ResponseStream;

/// Settled value of a `call`.
#[derive(Debug)]
pub enum Reply {
    /// Single-value reply.
    Value(frames::Value),
    /// Multi-value reply; items arrive on the stream.
    Stream(ResponseStream),
}

impl Reply {
    /// The single value, or a protocol error for a streaming reply.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::Protocol`] when the reply is a stream.
    pub fn into_value(self) -> Result<frames::Value, DuctError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(stream) => Err(DuctError::protocol(format!(
                "expected a single value, got stream for rid {}",
                stream.rid()
            ))),
        }
    }

    /// The response stream, or a protocol error for a single-value reply.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::Protocol`] when the reply is a single value.
    pub fn into_stream(self) -> Result<ResponseStream, DuctError> {
        match self {
            Self::Stream(stream) => Ok(stream),
            Self::Value(value) => Err(DuctError::protocol(format!(
                "expected a stream, got value {value}"
            ))),
        }
    }

    /// Deserialize a single-value reply into `T`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for streams or when the value does not fit `T`.
    pub fn deserialize<T: serde::de::DeserializeOwned>(self) -> Result<T, DuctError> {
        let value = self.into_value()?;
        rmpv::ext::from_value(value).map_err(|e| DuctError::protocol(e.to_string()))
    }
}

pub type CallResult = Result<Reply, DuctError>;

#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call and return the receiving half.
    pub fn register(&self, rid: u64) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(rid, tx).is_some() {
            tracing::warn!(rid, "ducts: replaced pending call with duplicate rid");
        }
        rx
    }

    /// Drop a pending call without settling it.
    pub fn forget(&self, rid: u64) -> bool {
        self.lock().remove(&rid).is_some()
    }

    /// Settle the call awaiting `rid`. Returns false when nobody awaits it.
    pub fn settle(&self, rid: u64, result: CallResult) -> bool {
        let Some(tx) = self.lock().remove(&rid) else {
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = tx.send(result);
        true
    }

    #[must_use]
    pub fn is_pending(&self, rid: u64) -> bool {
        self.lock().contains_key(&rid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<CallResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "correlator_test.rs"]
mod tests;
