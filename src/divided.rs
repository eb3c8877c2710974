//! Reassembly of divided responses (`DIVIDED_RESPONSE_*`).
//!
//! Chunks for one rid are appended in arrival order. On the end marker they are
//! concatenated and decoded as one nested frame. Ordering relies on the
//! transport; there is no resequencing or duplicate detection.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use frames::{Frame, Value};

use crate::error::DuctError;

#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: Mutex<HashMap<u64, Vec<Vec<u8>>>>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk for `rid`. Empty chunks are skipped.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the chunk is not binary.
    pub fn append(&self, rid: u64, chunk: Value) -> Result<(), DuctError> {
        let bytes = match chunk {
            Value::Binary(bytes) => bytes,
            Value::Nil => Vec::new(),
            other => {
                return Err(DuctError::protocol(format!(
                    "divided response chunk for rid {rid} is not binary: {other}"
                )));
            }
        };
        let mut buffers = self.lock();
        let chunks = buffers.entry(rid).or_default();
        if !bytes.is_empty() {
            chunks.push(bytes);
        }
        Ok(())
    }

    /// Remove the chunks for `rid` and decode them as one frame.
    ///
    /// # Errors
    ///
    /// Returns a codec error when the joined bytes are not a valid frame.
    pub fn finish(&self, rid: u64) -> Result<Frame, DuctError> {
        let chunks = self.lock().remove(&rid).unwrap_or_default();
        let total = chunks.iter().map(Vec::len).sum::<usize>();
        let mut joined = Vec::with_capacity(total);
        for chunk in &chunks {
            joined.extend_from_slice(chunk);
        }
        tracing::debug!(rid, chunks = chunks.len(), bytes = total, "ducts: divided response joined");
        Ok(frames::decode_frame(&joined)?)
    }

    /// True while chunks are buffered for `rid`.
    #[must_use]
    pub fn is_buffering(&self, rid: u64) -> bool {
        self.lock().contains_key(&rid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<Vec<u8>>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "divided_test.rs"]
mod tests;
