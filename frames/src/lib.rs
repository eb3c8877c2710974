//! Shared frame model and MessagePack codec for the ducts wire protocol.
//!
//! Every websocket message is one MessagePack array of exactly three
//! elements: `[rid | nil, eid, data]`. Payloads stay schemaless
//! (`rmpv::Value`) so the engine never needs to know event shapes.

pub use rmpv::Value;

/// Error returned by [`encode_frame`] and [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be written as MessagePack.
    #[error("failed to encode msgpack frame: {0}")]
    Encode(#[from] rmpv::encode::Error),
    /// The raw bytes are not valid MessagePack.
    #[error("failed to decode msgpack frame: {0}")]
    Decode(#[from] rmpv::decode::Error),
    /// The top-level value is not an array.
    #[error("frame is not an array: {0}")]
    NotAnArray(String),
    /// The top-level array does not hold exactly three elements.
    #[error("frame has {0} elements, expected 3")]
    Arity(usize),
    /// The correlation id is neither nil nor a non-negative integer.
    #[error("invalid correlation id: {0}")]
    InvalidRid(String),
    /// The event id is not an integer that fits in `i32`.
    #[error("invalid event id: {0}")]
    InvalidEid(String),
    /// Bytes remained after the frame array.
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

/// A single message on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Correlation id. `None` is the absent-sentinel (`nil` on the wire).
    pub rid: Option<u64>,
    /// Event id. The magnitude names the event, a negative sign marks an
    /// application error whose payload is the error detail.
    pub eid: i32,
    /// Arbitrary payload.
    pub data: Value,
}

impl Frame {
    pub fn new(rid: Option<u64>, eid: i32, data: impl Into<Value>) -> Self {
        Self {
            rid,
            eid,
            data: data.into(),
        }
    }

    /// Replace the payload, keeping rid and eid.
    #[must_use]
    pub fn with_data(self, data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..self
        }
    }

    /// Replace the correlation id.
    #[must_use]
    pub fn with_rid(self, rid: Option<u64>) -> Self {
        Self { rid, ..self }
    }

    /// True when the event id carries the error sign.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.eid < 0
    }

    /// Event id magnitude used for handler lookup.
    #[must_use]
    pub fn event(&self) -> u32 {
        self.eid.unsigned_abs()
    }
}

/// Encode a frame into MessagePack bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the writer rejects the value.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    let rid = frame.rid.map_or(Value::Nil, Value::from);
    let wire = Value::Array(vec![rid, Value::from(frame.eid), frame.data.clone()]);

    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &wire)?;
    Ok(out)
}

/// Decode MessagePack bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and a shape error when
/// the value is not a `[rid | nil, eid, data]` array.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let mut cursor = bytes;
    let wire = rmpv::decode::read_value(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(CodecError::TrailingBytes(cursor.len()));
    }
    wire_to_frame(wire)
}

fn wire_to_frame(wire: Value) -> Result<Frame, CodecError> {
    let items = match wire {
        Value::Array(items) => items,
        other => return Err(CodecError::NotAnArray(other.to_string())),
    };
    let [rid, eid, data]: [Value; 3] = items
        .try_into()
        .map_err(|items: Vec<Value>| CodecError::Arity(items.len()))?;

    let rid = match rid {
        Value::Nil => None,
        other => Some(
            other
                .as_u64()
                .ok_or_else(|| CodecError::InvalidRid(other.to_string()))?,
        ),
    };
    let eid = eid
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| CodecError::InvalidEid(eid.to_string()))?;

    Ok(Frame { rid, eid, data })
}

/// Convert a JSON value into a MessagePack value.
#[must_use]
pub fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(v) => Value::Boolean(*v),
        serde_json::Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                Value::from(i)
            } else if let Some(u) = v.as_u64() {
                Value::from(u)
            } else {
                Value::F64(v.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(v) => Value::from(v.as_str()),
        serde_json::Value::Array(v) => Value::Array(v.iter().map(json_to_value).collect()),
        serde_json::Value::Object(v) => Value::Map(
            v.iter()
                .map(|(k, v)| (Value::from(k.as_str()), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Convert a MessagePack value into JSON.
///
/// Binary and extension payloads become arrays of byte values; non-string map
/// keys are rendered with their display form.
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(v) => serde_json::Value::Bool(*v),
        Value::Integer(v) => v
            .as_i64()
            .map(serde_json::Value::from)
            .or_else(|| v.as_u64().map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null),
        Value::F32(v) => float_to_json(f64::from(*v)),
        Value::F64(v) => float_to_json(*v),
        Value::String(v) => serde_json::Value::String(
            v.as_str()
                .map_or_else(|| String::from_utf8_lossy(v.as_bytes()).into_owned(), str::to_owned),
        ),
        Value::Binary(v) | Value::Ext(_, v) => {
            serde_json::Value::Array(v.iter().map(|b| serde_json::Value::from(*b)).collect())
        }
        Value::Array(v) => serde_json::Value::Array(v.iter().map(value_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), value_to_json(v)))
                .collect(),
        ),
    }
}

fn float_to_json(v: f64) -> serde_json::Value {
    serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn map_key(key: &Value) -> String {
    key.as_str().map_or_else(|| key.to_string(), str::to_owned)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
