//! Connection manager: lifecycle, outbound calls, and the reader task.
//!
//! DESIGN
//! ======
//! A [`Duct`] is a cheap handle over shared state. Lifecycle moves through
//! `Closed → Connecting → Connected → Closing → Closed`:
//!
//! - `open` discovers, connects, installs the system handlers, sends the
//!   clock probe, then fires queued open callbacks
//! - `reconnect` runs the same sequence minus discovery, against the retained
//!   reconnect URL
//! - `close` sends a normal close and waits; every concurrent `close` settles
//!   from the same close event
//!
//! The reader task holds only a weak reference; once every handle is dropped
//! it exits on the next inbound message. Closing does not reject pending
//! calls; they stay pending until a reply arrives.

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use frames::{Frame, Value};
use futures_util::StreamExt;
use futures_util::stream::SplitStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::clock::{self, ClockSnapshot};
use crate::config::DuctConfig;
use crate::correlator::Reply;
use crate::discovery::{self, OpenParams, Wsd};
use crate::dispatch::{Dispatch, DispatchEngine};
use crate::error::{BoxError, DuctError, EventFault};
use crate::event::{
    CloseEvent, ConnectionEvent, ConnectionEventKind, ConnectionListener, ConnectionState, EventTable,
    SystemEvent,
};
use crate::rid::RequestIdGenerator;
use crate::transport::{self, Outbound, WsStream};

/// Callback run once after the next successful open.
pub type OpenCallback = Box<dyn FnOnce() + Send>;

// =============================================================================
// SHARED STATE
// =============================================================================

struct Session {
    state: ConnectionState,
    wsd: Option<Wsd>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    close_waiters: Vec<oneshot::Sender<CloseEvent>>,
    on_open: Vec<OpenCallback>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: ConnectionState::Closed,
            wsd: None,
            outbound: None,
            close_waiters: Vec::new(),
            on_open: Vec::new(),
        }
    }
}

struct DuctInner {
    config: DuctConfig,
    engine: DispatchEngine,
    rids: RequestIdGenerator,
    session: Mutex<Session>,
    listener: RwLock<ConnectionListener>,
}

impl DuctInner {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> ConnectionListener {
        self.listener.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn notify(&self, event: &ConnectionEvent) {
        self.listener().notify(event);
    }

    /// Enqueue an encoded frame while a socket is attached.
    fn write(&self, frame: &Frame) -> Result<(), DuctError> {
        let bytes = frames::encode_frame(frame)?;
        let session = self.lock_session();
        let writable = matches!(session.state, ConnectionState::Connecting | ConnectionState::Connected);
        match &session.outbound {
            Some(tx) if writable => tx.send(Outbound::Frame(bytes)).map_err(|_| DuctError::NotConnected),
            _ => Err(DuctError::NotConnected),
        }
    }

    /// Record the terminal close and release every close waiter.
    fn finish_close(&self, close: CloseEvent) {
        let waiters = {
            let mut session = self.lock_session();
            session.state = ConnectionState::Closed;
            session.outbound = None;
            std::mem::take(&mut session.close_waiters)
        };
        if close.is_normal() {
            tracing::info!(code = close.code, "ducts: connection closed");
        } else {
            tracing::warn!(code = close.code, reason = %close.reason, "ducts: connection closed abnormally");
        }
        for waiter in waiters {
            let _ = waiter.send(close.clone());
        }
        self.notify(&ConnectionEvent::Close(close));
    }
}

// =============================================================================
// DUCT
// =============================================================================

/// Client session over one websocket.
#[derive(Clone)]
pub struct Duct {
    inner: Arc<DuctInner>,
}

impl Default for Duct {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Duct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duct")
            .field("state", &self.state())
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

impl Duct {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DuctConfig::default())
    }

    #[must_use]
    pub fn with_config(config: DuctConfig) -> Self {
        Self {
            inner: Arc::new(DuctInner {
                config,
                engine: DispatchEngine::new(),
                rids: RequestIdGenerator::new(),
                session: Mutex::new(Session::default()),
                listener: RwLock::new(ConnectionListener::default()),
            }),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Discover `wsd_url` and connect. A no-op unless the duct is closed.
    ///
    /// # Errors
    ///
    /// Returns a transport error if discovery or the websocket handshake
    /// fails; the duct is then back in `Closed`.
    pub async fn open(&self, wsd_url: &str, params: &OpenParams) -> Result<(), DuctError> {
        if !self.begin_connecting() {
            return Ok(());
        }
        let result = async {
            let client = discovery::http_client(&self.inner.config)?;
            let wsd = discovery::discover(&client, wsd_url, params).await?;
            let url = wsd.websocket_url.clone();
            self.inner.lock_session().wsd = Some(wsd.clone());
            self.establish(wsd, &url).await
        }
        .await;
        self.settle_connecting(result)
    }

    /// Reconnect to the reconnect URL of the retained descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::NotDiscovered`] before the first successful
    /// discovery, or a transport error if the handshake fails.
    pub async fn reconnect(&self) -> Result<(), DuctError> {
        let Some(wsd) = self.wsd() else {
            return Err(DuctError::NotDiscovered);
        };
        self.reconnect_to(wsd).await
    }

    /// Replace the retained descriptor with `wsd`, then reconnect.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the handshake fails.
    pub async fn reconnect_with(&self, wsd: Wsd) -> Result<(), DuctError> {
        if self.state() != ConnectionState::Closed {
            return Ok(());
        }
        self.inner.lock_session().wsd = Some(wsd.clone());
        self.reconnect_to(wsd).await
    }

    async fn reconnect_to(&self, wsd: Wsd) -> Result<(), DuctError> {
        if !self.begin_connecting() {
            return Ok(());
        }
        let url = wsd.reconnect_url().to_owned();
        let result = self.establish(wsd, &url).await;
        self.settle_connecting(result)
    }

    /// Close the connection and wait for the close handshake.
    ///
    /// Returns `Ok(None)` when already closed and `Ok(Some(event))` for a
    /// normal close.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::AbnormalClose`] when the close code is not 1000,
    /// and [`DuctError::Connecting`] while an open is in flight.
    pub async fn close(&self) -> Result<Option<CloseEvent>, DuctError> {
        let rx = {
            let mut session = self.inner.lock_session();
            match session.state {
                ConnectionState::Closed => return Ok(None),
                ConnectionState::Connecting => return Err(DuctError::Connecting),
                ConnectionState::Connected => {
                    session.state = ConnectionState::Closing;
                    if let Some(tx) = &session.outbound {
                        let _ = tx.send(Outbound::Close);
                    }
                    tracing::debug!("ducts: close requested");
                }
                ConnectionState::Closing => {}
            }
            let (tx, rx) = oneshot::channel();
            session.close_waiters.push(tx);
            rx
        };
        let close = rx.await.map_err(|_| DuctError::Abandoned)?;
        if close.is_normal() {
            Ok(Some(close))
        } else {
            Err(DuctError::AbnormalClose(close))
        }
    }

    fn begin_connecting(&self) -> bool {
        let mut session = self.inner.lock_session();
        if session.state != ConnectionState::Closed {
            return false;
        }
        session.state = ConnectionState::Connecting;
        true
    }

    fn settle_connecting(&self, result: Result<(), DuctError>) -> Result<(), DuctError> {
        if let Err(error) = &result {
            {
                let mut session = self.inner.lock_session();
                session.state = ConnectionState::Closed;
                session.outbound = None;
            }
            tracing::warn!(%error, "ducts: connect failed");
            self.inner.notify(&ConnectionEvent::Error {
                message: error.to_string(),
            });
        }
        result
    }

    /// Connect to `url` and bring the session up under `wsd`.
    async fn establish(&self, wsd: Wsd, url: &str) -> Result<(), DuctError> {
        let stream = transport::connect(url, self.inner.config.connect_timeout()).await?;

        let engine = &self.inner.engine;
        engine.install_system_handlers(&wsd.event);
        let client_sent = clock::now_secs();
        engine.clock().start(client_sent);

        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(transport::write_loop(sink, rx));
        self.inner.lock_session().outbound = Some(tx);
        tokio::spawn(read_loop(Arc::downgrade(&self.inner), source));

        if let Some(eid) = wsd.event.system(SystemEvent::AliveMonitoring) {
            self.inner.write(&Frame::new(Some(self.next_rid()), eid, client_sent))?;
        }

        let callbacks = {
            let mut session = self.inner.lock_session();
            // The reader may already have seen the peer close.
            if session.outbound.is_none() {
                return Err(DuctError::NotConnected);
            }
            session.state = ConnectionState::Connected;
            std::mem::take(&mut session.on_open)
        };
        tracing::info!(url, "ducts: connected");
        for callback in callbacks {
            callback();
        }
        self.inner.notify(&ConnectionEvent::Open { url: url.to_owned() });
        Ok(())
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// Next correlation id.
    pub fn next_rid(&self) -> u64 {
        self.inner.rids.next_rid()
    }

    /// Encode and write one frame. Returns `rid`.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::NotConnected`] unless a socket is attached.
    pub fn send(&self, rid: u64, eid: i32, data: impl Into<Value>) -> Result<u64, DuctError> {
        self.inner.write(&Frame::new(Some(rid), eid, data))?;
        Ok(rid)
    }

    /// Send `data` under a fresh rid and wait for the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns [`DuctError::Application`] for a negative-eid reply and
    /// [`DuctError::NotConnected`] when nothing could be sent.
    pub async fn call(&self, eid: i32, data: impl Into<Value>) -> Result<Reply, DuctError> {
        let rid = self.next_rid();
        let correlator = self.inner.engine.correlator();
        let rx = correlator.register(rid);
        if let Err(error) = self.send(rid, eid, data) {
            correlator.forget(rid);
            return Err(error);
        }
        rx.await.map_err(|_| DuctError::Abandoned)?
    }

    // =========================================================================
    // CALLBACKS
    // =========================================================================

    /// Run `callback` now if connected, otherwise after the next open.
    pub fn invoke_on_open<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut session = self.inner.lock_session();
        if session.state == ConnectionState::Connected {
            drop(session);
            callback();
        } else {
            session.on_open.push(Box::new(callback));
        }
    }

    /// Queue `callback` for the next successful open or reconnect.
    pub fn add_onopen_handler<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.lock_session().on_open.push(Box::new(callback));
    }

    pub fn set_connection_listener(&self, listener: ConnectionListener) {
        *self.inner.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    pub fn set_event_handler<F>(&self, eid: i32, handler: F)
    where
        F: Fn(Frame) -> Result<Dispatch, BoxError> + Send + Sync + 'static,
    {
        self.inner.engine.set_event_handler(eid, handler);
    }

    pub fn clear_event_handler(&self, eid: i32) -> bool {
        self.inner.engine.clear_event_handler(eid)
    }

    pub fn set_catchall_handler<F>(&self, handler: F)
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner.engine.set_catchall_handler(handler);
    }

    pub fn set_uncaught_handler<F>(&self, handler: F)
    where
        F: Fn(Frame) -> Result<Dispatch, BoxError> + Send + Sync + 'static,
    {
        self.inner.engine.set_uncaught_handler(handler);
    }

    pub fn set_event_error_handler<F>(&self, handler: F)
    where
        F: Fn(&EventFault) + Send + Sync + 'static,
    {
        self.inner.engine.set_event_error_handler(handler);
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_session().state
    }

    /// Event table of the retained descriptor.
    #[must_use]
    pub fn events(&self) -> Option<EventTable> {
        self.inner.lock_session().wsd.as_ref().map(|wsd| wsd.event.clone())
    }

    /// Id for `name` in the retained event table.
    #[must_use]
    pub fn event(&self, name: &str) -> Option<i32> {
        self.inner.lock_session().wsd.as_ref()?.event.get(name)
    }

    #[must_use]
    pub fn wsd(&self) -> Option<Wsd> {
        self.inner.lock_session().wsd.clone()
    }

    /// Clock estimate of the current session.
    #[must_use]
    pub fn clock(&self) -> ClockSnapshot {
        self.inner.engine.clock().snapshot()
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.engine.correlator().len()
    }
}

// =============================================================================
// READER TASK
// =============================================================================

async fn read_loop(inner: Weak<DuctInner>, mut source: SplitStream<WsStream>) {
    let mut close = CloseEvent::abnormal();
    while let Some(message) = source.next().await {
        let Some(shared) = inner.upgrade() else {
            return;
        };
        match message {
            Ok(Message::Binary(bytes)) => {
                let listener = shared.listener();
                if listener.hook(ConnectionEventKind::Message).is_some() {
                    listener.notify(&ConnectionEvent::Message { bytes: bytes.to_vec() });
                }
                shared.engine.dispatch_bytes(&bytes);
            }
            Ok(Message::Close(frame)) => close = transport::close_event(frame),
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, "ducts: websocket read failed");
                shared.notify(&ConnectionEvent::Error {
                    message: error.to_string(),
                });
                break;
            }
        }
    }
    if let Some(shared) = inner.upgrade() {
        shared.finish_close(close);
    }
}

#[cfg(test)]
#[path = "duct_test.rs"]
mod tests;
