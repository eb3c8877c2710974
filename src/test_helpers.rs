//! In-process ducts peer for tests.
//!
//! Serves a discovery route and a websocket endpoint on `127.0.0.1:0`. The
//! websocket side answers a fixed set of events, including streaming and
//! divided replies, so the client can be driven end to end.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use frames::{Frame, Value};
use serde_json::json;

pub const ALIVE_MONITORING: i32 = 1;
pub const LOOP_RESPONSE_START: i32 = 2;
pub const LOOP_RESPONSE_NEXT: i32 = 3;
pub const LOOP_RESPONSE_END: i32 = 4;
pub const DIVIDED_RESPONSE_APPEND: i32 = 5;
pub const DIVIDED_RESPONSE_END: i32 = 6;
pub const EVENT_ECHO: i32 = 100;
pub const EVENT_EXISTS: i32 = 101;
pub const EVENT_ADD: i32 = 102;
pub const EVENT_DELETE: i32 = 103;
pub const EVENT_FAIL: i32 = 104;
pub const EVENT_LOOP: i32 = 105;
pub const EVENT_DIVIDED: i32 = 106;
pub const EVENT_DROP: i32 = 107;

/// Close code the peer uses when asked to drop the connection.
pub const DROP_CLOSE_CODE: u16 = 4000;

#[derive(Default)]
pub struct PeerState {
    keys: Mutex<HashSet<String>>,
    divided_rid: AtomicU64,
    connections: AtomicUsize,
    alive_probes: AtomicUsize,
    last_query: Mutex<HashMap<String, String>>,
    last_user_agent: Mutex<Option<String>>,
}

pub struct MockPeer {
    pub addr: SocketAddr,
    pub state: Arc<PeerState>,
}

impl MockPeer {
    pub async fn start() -> Self {
        let state = Arc::new(PeerState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock peer");
        let addr = listener.local_addr().expect("mock peer addr");

        let app = Router::new()
            .route("/wsd", get(wsd))
            .route("/wsd-unavailable", get(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .route("/wsd-dead-socket", get(wsd_dead_socket))
            .route("/ws", get(ws))
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    #[must_use]
    pub fn wsd_url(&self) -> String {
        format!("http://{}/wsd", self.addr)
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn alive_probes(&self) -> usize {
        self.state.alive_probes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_query(&self) -> HashMap<String, String> {
        self.state.last_query.lock().unwrap().clone()
    }

    #[must_use]
    pub fn last_user_agent(&self) -> Option<String> {
        self.state.last_user_agent.lock().unwrap().clone()
    }
}

fn event_table() -> serde_json::Value {
    json!({
        "ALIVE_MONITORING": ALIVE_MONITORING,
        "LOOP_RESPONSE_START": LOOP_RESPONSE_START,
        "LOOP_RESPONSE_NEXT": LOOP_RESPONSE_NEXT,
        "LOOP_RESPONSE_END": LOOP_RESPONSE_END,
        "DIVIDED_RESPONSE_APPEND": DIVIDED_RESPONSE_APPEND,
        "DIVIDED_RESPONSE_END": DIVIDED_RESPONSE_END,
        "EVENT_ECHO": EVENT_ECHO,
        "EVENT_EXISTS": EVENT_EXISTS,
        "EVENT_ADD": EVENT_ADD,
        "EVENT_DELETE": EVENT_DELETE,
        "EVENT_FAIL": EVENT_FAIL,
        "EVENT_LOOP": EVENT_LOOP,
        "EVENT_DIVIDED": EVENT_DIVIDED,
        "EVENT_DROP": EVENT_DROP,
    })
}

// =============================================================================
// DISCOVERY
// =============================================================================

async fn wsd(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    *state.last_query.lock().unwrap() = query;
    *state.last_user_agent.lock().unwrap() = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_owned();
    axum::Json(json!({
        "websocket_url": format!("ws://{host}/ws"),
        "websocket_url_reconnect": format!("ws://{host}/ws?reconnect=1"),
        "EVENT": event_table(),
    }))
    .into_response()
}

async fn wsd_dead_socket() -> Response {
    axum::Json(json!({
        "websocket_url": "ws://127.0.0.1:1/ws",
        "websocket_url_reconnect": "ws://127.0.0.1:1/ws",
        "EVENT": event_table(),
    }))
    .into_response()
}

// =============================================================================
// WEBSOCKET
// =============================================================================

enum Outgoing {
    Frame(Frame),
    Close(u16),
}

async fn ws(ws: WebSocketUpgrade, State(state): State<Arc<PeerState>>) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<PeerState>) {
    // Keep reading after a close so the handshake reply gets flushed.
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Binary(bytes) = message else {
            continue;
        };
        let Ok(frame) = frames::decode_frame(&bytes) else {
            continue;
        };
        for outgoing in respond(&state, frame) {
            let message = match outgoing {
                Outgoing::Frame(frame) => Message::Binary(frames::encode_frame(&frame).expect("encode").into()),
                Outgoing::Close(code) => Message::Close(Some(CloseFrame {
                    code,
                    reason: Utf8Bytes::from_static("dropped"),
                })),
            };
            if socket.send(message).await.is_err() {
                return;
            }
        }
    }
}

fn respond(state: &PeerState, frame: Frame) -> Vec<Outgoing> {
    let reply = |eid: i32, data: Value| vec![Outgoing::Frame(Frame::new(frame.rid, eid, data))];
    match frame.eid {
        ALIVE_MONITORING => {
            state.alive_probes.fetch_add(1, Ordering::SeqCst);
            let now = crate::clock::now_secs();
            reply(ALIVE_MONITORING, Value::Array(vec![Value::from(now), Value::from(now)]))
        }
        EVENT_ECHO => reply(EVENT_ECHO, frame.data.clone()),
        EVENT_EXISTS => {
            let key = frame.data.as_str().unwrap_or_default();
            let exists = state.keys.lock().unwrap().contains(key);
            reply(EVENT_EXISTS, Value::from(exists))
        }
        EVENT_ADD => {
            let key = map_field(&frame.data, "key").and_then(Value::as_str).unwrap_or_default();
            state.keys.lock().unwrap().insert(key.to_owned());
            reply(EVENT_ADD, Value::Nil)
        }
        EVENT_DELETE => {
            let key = frame.data.as_str().unwrap_or_default();
            let removed = state.keys.lock().unwrap().remove(key);
            reply(EVENT_DELETE, Value::from(removed))
        }
        EVENT_FAIL => reply(-EVENT_FAIL, Value::from("boom")),
        EVENT_LOOP => loop_response(frame.rid, frame.data.as_u64().unwrap_or_default()),
        EVENT_DIVIDED => divided_response(state, &frame),
        EVENT_DROP => vec![Outgoing::Close(DROP_CLOSE_CODE)],
        eid => reply(eid, frame.data.clone()),
    }
}

fn loop_response(rid: Option<u64>, count: u64) -> Vec<Outgoing> {
    let item = |eid: i32, payload: Value| Value::Array(vec![Value::from(eid), payload]);
    let mut out = (0..count)
        .map(|i| {
            let marker = if i == 0 { LOOP_RESPONSE_START } else { LOOP_RESPONSE_NEXT };
            Outgoing::Frame(Frame::new(rid, marker, item(EVENT_LOOP, Value::from(i))))
        })
        .collect::<Vec<_>>();
    out.push(Outgoing::Frame(Frame::new(
        rid,
        LOOP_RESPONSE_END,
        item(EVENT_LOOP, Value::Nil),
    )));
    out
}

/// Payload `{k, value}`: reply with `value` split across `k` chunks.
fn divided_response(state: &PeerState, frame: &Frame) -> Vec<Outgoing> {
    let k = map_field(&frame.data, "k")
        .and_then(Value::as_u64)
        .and_then(|k| usize::try_from(k).ok())
        .unwrap_or(1)
        .max(1);
    let value = map_field(&frame.data, "value").cloned().unwrap_or(Value::Nil);
    let bytes = frames::encode_frame(&Frame::new(frame.rid, EVENT_DIVIDED, value)).expect("encode");
    let outer = Some(state.divided_rid.fetch_add(1, Ordering::SeqCst) + 1);

    let mut out = bytes
        .chunks(bytes.len().div_ceil(k))
        .map(|chunk| {
            Outgoing::Frame(Frame::new(
                outer,
                DIVIDED_RESPONSE_APPEND,
                Value::Binary(chunk.to_vec()),
            ))
        })
        .collect::<Vec<_>>();
    out.push(Outgoing::Frame(Frame::new(outer, DIVIDED_RESPONSE_END, Value::Nil)));
    out
}

fn map_field<'a>(data: &'a Value, name: &str) -> Option<&'a Value> {
    data.as_map()?
        .iter()
        .find(|(key, _)| key.as_str() == Some(name))
        .map(|(_, value)| value)
}
