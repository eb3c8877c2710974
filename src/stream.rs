//! Streaming replies (`LOOP_RESPONSE_*`).
//!
//! DESIGN
//! ======
//! Each streaming rid gets an unbounded channel. The dispatch path is the only
//! producer and never blocks; the [`ResponseStream`] handed to the caller is
//! the consumer. Once the end marker has been consumed every further
//! `dequeue` yields `None` immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use frames::Value;
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::DuctError;

#[derive(Debug)]
pub(crate) enum StreamItem {
    Value(Value),
    Error { eid: i32, payload: Value },
    End,
}

/// Consumer side of a streaming reply.
#[derive(Debug, Clone)]
pub struct ResponseStream {
    rid: u64,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StreamItem>>>,
    finished: Arc<AtomicBool>,
}

impl ResponseStream {
    fn new(rid: u64, rx: mpsc::UnboundedReceiver<StreamItem>) -> Self {
        Self {
            rid,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Correlation id the stream was delivered under.
    #[must_use]
    pub fn rid(&self) -> u64 {
        self.rid
    }

    /// Next item in produced order; `Ok(None)` once the stream has ended.
    ///
    /// Waits when nothing is buffered yet.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::Application`] for an item the remote flagged as an
    /// error. The stream continues after an error item.
    pub async fn dequeue(&self) -> Result<Option<Value>, DuctError> {
        if self.finished.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        if self.finished.load(Ordering::Acquire) {
            return Ok(None);
        }
        match rx.recv().await {
            Some(StreamItem::Value(value)) => Ok(Some(value)),
            Some(StreamItem::Error { eid, payload }) => Err(DuctError::Application { eid, payload }),
            Some(StreamItem::End) | None => {
                self.finished.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }

    /// True once the end marker has been consumed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Adapt into a `futures` stream that ends with the end marker.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, DuctError>> {
        futures_util::stream::unfold(self, |stream| async move {
            match stream.dequeue().await {
                Ok(Some(value)) => Some((Ok(value), stream)),
                Ok(None) => None,
                Err(error) => Some((Err(error), stream)),
            }
        })
    }
}

/// Producer side: one channel per active streaming rid.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    producers: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamItem>>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `item` for `rid`, creating the stream on first use.
    ///
    /// Returns the consumer handle only when this call created the stream.
    /// The producer entry is dropped after the end marker.
    pub(crate) fn push(&self, rid: u64, item: StreamItem) -> Option<ResponseStream> {
        let mut producers = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        let created = if producers.contains_key(&rid) {
            None
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            producers.insert(rid, tx);
            Some(ResponseStream::new(rid, rx))
        };

        let is_end = matches!(item, StreamItem::End);
        if let Some(tx) = producers.get(&rid) {
            // A dropped consumer just discards the rest of the stream.
            let _ = tx.send(item);
        }
        if is_end {
            producers.remove(&rid);
        }
        created
    }

    /// True while `rid` has an open (not yet ended) stream.
    #[must_use]
    pub fn is_active(&self, rid: u64) -> bool {
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&rid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod tests;
