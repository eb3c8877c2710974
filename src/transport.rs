//! Websocket transport plumbing.
//!
//! DESIGN
//! ======
//! The socket is split after the handshake. The write half is owned by a
//! writer task fed through an unbounded channel, so `send` never awaits and
//! callers on any task can enqueue frames. The read half is driven by the
//! connection's reader task (see `duct.rs`), which dispatches messages one at
//! a time in delivery order.

use std::time::Duration;

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::DuctError;
use crate::event::{CloseEvent, NO_STATUS, NORMAL_CLOSURE};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Work item for the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// One encoded frame.
    Frame(Vec<u8>),
    /// Start the closing handshake with code 1000.
    Close,
}

/// Open a websocket to `url`, giving up after `timeout`.
pub(crate) async fn connect(url: &str, timeout: Duration) -> Result<WsStream, DuctError> {
    let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| DuctError::ConnectTimeout(url.to_owned()))?
        .map_err(|e| DuctError::WsConnect(Box::new(e)))?;
    tracing::debug!(url, "ducts: websocket connected");
    Ok(stream)
}

/// Drain `rx` into the socket until the channel closes, a write fails, or
/// the close handshake has been sent.
pub(crate) async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let (message, last) = match outbound {
            Outbound::Frame(bytes) => (Message::Binary(bytes.into()), false),
            Outbound::Close => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::from(NORMAL_CLOSURE),
                    reason: Utf8Bytes::from_static(""),
                })),
                true,
            ),
        };
        if let Err(error) = sink.send(message).await {
            tracing::warn!(%error, "ducts: websocket write failed");
            break;
        }
        if last {
            break;
        }
    }
}

/// Close event for a peer close frame; a frame without status maps to 1005.
pub(crate) fn close_event(frame: Option<CloseFrame>) -> CloseEvent {
    frame.map_or_else(
        || CloseEvent::new(NO_STATUS, ""),
        |frame| CloseEvent::new(u16::from(frame.code), frame.reason.as_str()),
    )
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
