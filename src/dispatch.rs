//! Inbound frame dispatch: decode, route, correlate.
//!
//! DESIGN
//! ======
//! Every inbound message takes one path:
//!
//! 1. decode bytes into a [`Frame`] (failure → `EventFault::Decode`)
//! 2. invoke the catch-all observer
//! 3. look up the handler by `|eid|`, falling back to the uncaught handler
//! 4. the handler returns a [`Dispatch`]: continue with a (possibly
//!    rewritten) frame, hand a stream to the caller, or consume the frame
//! 5. settle the pending call for the resulting rid, if any
//!
//! Handler failures are reported per frame and never stop dispatch of the
//! frames that follow. A panicking callback counts as a failure: handler
//! panics become `EventFault::Handler`, observer panics are logged and
//! dropped. System events (clock sync, streaming, divided
//! responses) are ordinary table entries so they share this path.
//!
//! The engine expects frames one at a time in delivery order; the reader task
//! is its only caller.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use frames::{Frame, Value};

use crate::clock::ClockSync;
use crate::correlator::{Correlator, Reply};
use crate::divided::Reassembler;
use crate::error::{BoxError, DuctError, EventFault};
use crate::event::{EventTable, SystemEvent};
use crate::stream::{ResponseStream, StreamItem, StreamRegistry};

// =============================================================================
// HANDLER TYPES
// =============================================================================

/// What the dispatcher does with a frame after its handler ran.
#[derive(Debug)]
pub enum Dispatch {
    /// Correlate this frame: settle the call awaiting `frame.rid`. A `None`
    /// rid means nothing to correlate.
    Continue(Frame),
    /// Settle the call awaiting `rid` with a streaming reply.
    Stream { rid: u64, stream: ResponseStream },
    /// The frame was fully handled internally.
    Consumed,
}

/// Event handler: may rewrite the frame or consume it.
pub type EventHandler = Arc<dyn Fn(Frame) -> Result<Dispatch, BoxError> + Send + Sync>;

/// Observer invoked for every decoded frame before handler lookup.
pub type CatchallHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Receives per-frame dispatch failures.
pub type EventErrorHandler = Arc<dyn Fn(&EventFault) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    System(SystemEvent),
    User(EventHandler),
}

#[derive(Default)]
struct Hooks {
    table: HashMap<u32, Handler>,
    catchall: Option<CatchallHandler>,
    uncaught: Option<EventHandler>,
    event_error: Option<EventErrorHandler>,
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Default)]
pub struct DispatchEngine {
    hooks: RwLock<Hooks>,
    correlator: Correlator,
    streams: StreamRegistry,
    divided: Reassembler,
    clock: ClockSync,
}

impl DispatchEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    #[must_use]
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    #[must_use]
    pub fn divided(&self) -> &Reassembler {
        &self.divided
    }

    #[must_use]
    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    /// Route `|eid|` to `handler`, replacing any previous entry.
    pub fn set_event_handler<F>(&self, eid: i32, handler: F)
    where
        F: Fn(Frame) -> Result<Dispatch, BoxError> + Send + Sync + 'static,
    {
        self.write_hooks()
            .table
            .insert(eid.unsigned_abs(), Handler::User(Arc::new(handler)));
    }

    /// Remove the entry for `|eid|`. Returns whether one existed.
    pub fn clear_event_handler(&self, eid: i32) -> bool {
        self.write_hooks().table.remove(&eid.unsigned_abs()).is_some()
    }

    #[must_use]
    pub fn has_event_handler(&self, eid: i32) -> bool {
        self.read_hooks().table.contains_key(&eid.unsigned_abs())
    }

    pub fn set_catchall_handler<F>(&self, handler: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.write_hooks().catchall = Some(Arc::new(handler));
    }

    /// Handler for events with no table entry. Without one, frames pass
    /// through unchanged.
    pub fn set_uncaught_handler<F>(&self, handler: F)
    where
        F: Fn(Frame) -> Result<Dispatch, BoxError> + Send + Sync + 'static,
    {
        self.write_hooks().uncaught = Some(Arc::new(handler));
    }

    pub fn set_event_error_handler<F>(&self, handler: F)
    where
        F: Fn(&EventFault) + Send + Sync + 'static,
    {
        self.write_hooks().event_error = Some(Arc::new(handler));
    }

    /// Register the reserved system handlers for every reserved name present
    /// in `events`. Returns how many were installed.
    pub fn install_system_handlers(&self, events: &EventTable) -> usize {
        let mut hooks = self.write_hooks();
        let mut installed = 0;
        for event in SystemEvent::ALL {
            let Some(eid) = events.system(event) else {
                tracing::warn!(event = event.name(), "ducts: reserved event missing from event table");
                continue;
            };
            hooks.table.insert(eid.unsigned_abs(), Handler::System(event));
            installed += 1;
        }
        installed
    }

    // =========================================================================
    // INBOUND PATH
    // =========================================================================

    /// Decode and dispatch one inbound message.
    pub fn dispatch_bytes(&self, bytes: &[u8]) {
        match frames::decode_frame(bytes) {
            Ok(frame) => self.dispatch_frame(frame),
            Err(error) => self.report(EventFault::Decode {
                error: error.into(),
            }),
        }
    }

    /// Dispatch one decoded frame.
    pub fn dispatch_frame(&self, frame: Frame) {
        let catchall = self.read_hooks().catchall.clone();
        if let Some(catchall) = catchall {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| catchall(&frame))) {
                tracing::warn!(
                    rid = ?frame.rid,
                    eid = frame.eid,
                    panic = %panic_message(panic.as_ref()),
                    "ducts: catch-all handler panicked"
                );
            }
        }

        tracing::debug!(rid = ?frame.rid, eid = frame.eid, "ducts: dispatch");
        let identity = frame.clone();
        match self.resolve(frame) {
            Ok(outcome) => self.correlate(outcome),
            Err(error) => self.report(EventFault::Handler {
                frame: identity,
                error,
            }),
        }
    }

    /// Run the handler for `frame` without correlating the result.
    fn resolve(&self, frame: Frame) -> Result<Dispatch, DuctError> {
        let handler = {
            let hooks = self.read_hooks();
            hooks
                .table
                .get(&frame.event())
                .cloned()
                .or_else(|| hooks.uncaught.clone().map(Handler::User))
        };
        match handler {
            Some(Handler::System(event)) => self.handle_system(event, frame),
            Some(Handler::User(handler)) => match panic::catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(result) => result.map_err(DuctError::Handler),
                Err(panic) => Err(DuctError::Handler(
                    format!("handler panicked: {}", panic_message(panic.as_ref())).into(),
                )),
            },
            None => Ok(Dispatch::Continue(frame)),
        }
    }

    fn correlate(&self, outcome: Dispatch) {
        let (rid, result) = match outcome {
            Dispatch::Consumed | Dispatch::Continue(Frame { rid: None, .. }) => return,
            Dispatch::Continue(Frame {
                rid: Some(rid),
                eid,
                data,
            }) => {
                let result = if eid < 0 {
                    Err(DuctError::Application { eid, payload: data })
                } else {
                    Ok(Reply::Value(data))
                };
                (rid, result)
            }
            Dispatch::Stream { rid, stream } => (rid, Ok(Reply::Stream(stream))),
        };
        if !self.correlator.settle(rid, result) {
            tracing::trace!(rid, "ducts: reply without pending call");
        }
    }

    fn report(&self, fault: EventFault) {
        let handler = self.read_hooks().event_error.clone();
        match handler {
            Some(handler) => {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(&fault))) {
                    tracing::warn!(panic = %panic_message(panic.as_ref()), "ducts: event error handler panicked");
                }
            }
            None => {
                let (rid, eid) = fault.identity();
                tracing::warn!(rid, eid, error = %fault.error(), "ducts: event dispatch failed");
            }
        }
    }

    // =========================================================================
    // SYSTEM EVENTS
    // =========================================================================

    fn handle_system(&self, event: SystemEvent, frame: Frame) -> Result<Dispatch, DuctError> {
        match event {
            SystemEvent::AliveMonitoring => {
                self.clock.observe(&frame.data)?;
                Ok(Dispatch::Continue(frame))
            }
            SystemEvent::LoopResponseStart | SystemEvent::LoopResponseNext => {
                let rid = require_rid(&frame, event)?;
                let inner = loop_inner(rid, frame.data)?;
                let eid = inner.eid;
                let payload = self.resolve_payload(inner)?;
                let item = if eid < 0 {
                    StreamItem::Error { eid, payload }
                } else {
                    StreamItem::Value(payload)
                };
                Ok(self.stream_outcome(rid, item))
            }
            SystemEvent::LoopResponseEnd => {
                let rid = require_rid(&frame, event)?;
                if !frame.data.is_nil() {
                    self.resolve_payload(loop_inner(rid, frame.data)?)?;
                }
                Ok(self.stream_outcome(rid, StreamItem::End))
            }
            SystemEvent::DividedResponseAppend => {
                let rid = require_rid(&frame, event)?;
                self.divided.append(rid, frame.data)?;
                Ok(Dispatch::Consumed)
            }
            SystemEvent::DividedResponseEnd => {
                let rid = require_rid(&frame, event)?;
                let inner = self.divided.finish(rid)?;
                self.resolve(inner)
            }
        }
    }

    /// Resolve a nested event through the table and keep its payload.
    fn resolve_payload(&self, inner: Frame) -> Result<Value, DuctError> {
        Ok(match self.resolve(inner)? {
            Dispatch::Continue(frame) => frame.data,
            Dispatch::Stream { .. } | Dispatch::Consumed => Value::Nil,
        })
    }

    fn stream_outcome(&self, rid: u64, item: StreamItem) -> Dispatch {
        match self.streams.push(rid, item) {
            Some(stream) => Dispatch::Stream { rid, stream },
            None => Dispatch::Consumed,
        }
    }

    fn read_hooks(&self) -> std::sync::RwLockReadGuard<'_, Hooks> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_hooks(&self) -> std::sync::RwLockWriteGuard<'_, Hooks> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.read_hooks();
        f.debug_struct("DispatchEngine")
            .field("handlers", &hooks.table.len())
            .field("pending", &self.correlator.len())
            .field("streams", &self.streams.len())
            .field("divided", &self.divided.len())
            .field("clock", &self.clock.snapshot())
            .finish_non_exhaustive()
    }
}

fn require_rid(frame: &Frame, event: SystemEvent) -> Result<u64, DuctError> {
    frame
        .rid
        .ok_or_else(|| DuctError::protocol(format!("{} frame without correlation id", event.name())))
}

/// Split a loop-response payload `[inner_eid, inner_payload]` into a frame.
fn loop_inner(rid: u64, data: Value) -> Result<Frame, DuctError> {
    let items = match data {
        Value::Array(items) => items,
        other => {
            return Err(DuctError::protocol(format!(
                "loop response payload is not [eid, payload]: {other}"
            )));
        }
    };
    let [eid, payload]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
        DuctError::protocol(format!("loop response payload has {} elements, expected 2", items.len()))
    })?;
    let eid = eid
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| DuctError::protocol(format!("invalid loop response event id: {eid}")))?;
    Ok(Frame::new(Some(rid), eid, payload))
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
