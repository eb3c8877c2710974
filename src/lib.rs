//! Client engine for the ducts protocol.
//!
//! DESIGN
//! ======
//! A ducts session is one websocket carrying MessagePack frames
//! `[rid, eid, data]`. The connection is found through an HTTP discovery
//! endpoint that also publishes the event-id table. On top of the socket the
//! engine provides:
//!
//! - request/reply correlation by rid (`Duct::call`)
//! - streaming replies delivered as a [`ResponseStream`]
//! - reassembly of replies split across divided-response frames
//! - a running clock offset/latency estimate against the server
//!
//! Every inbound frame goes through [`DispatchEngine`]; user handlers share
//! the table with the system handlers and may rewrite or consume frames.

pub mod clock;
pub mod config;
pub mod correlator;
pub mod discovery;
pub mod dispatch;
pub mod divided;
pub mod duct;
pub mod error;
pub mod event;
pub mod rid;
pub mod stream;
mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use clock::ClockSnapshot;
pub use config::DuctConfig;
pub use correlator::Reply;
pub use discovery::{OpenParams, Wsd};
pub use dispatch::{Dispatch, DispatchEngine};
pub use duct::Duct;
pub use error::{BoxError, DuctError, ErrorKind, EventFault};
pub use event::{
    CloseEvent, ConnectionEvent, ConnectionEventKind, ConnectionHook, ConnectionListener, ConnectionState,
    EventTable, SystemEvent,
};
pub use frames::{Frame, Value};
pub use stream::ResponseStream;
