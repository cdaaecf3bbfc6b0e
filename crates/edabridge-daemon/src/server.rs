//! Loopback WebSocket server.
//!
//! At most one peer is attached at a time. A socket becomes the peer only
//! after its first frame decodes as a hello; a later hello from another
//! socket evicts the current peer with [`CloseReason::Replaced`] and fails
//! its outstanding calls. Once the server is stopped no socket can attach.

use crate::config::ServerConfig;
use crate::correlator::RpcCorrelator;
use crate::status::ServerStatus;
use chrono::Utc;
use edabridge_core::handler::respond;
use edabridge_core::{
    AppInfo, CloseReason, Message, ProtocolError, RequestHandler, RpcError, SnapshotWriter,
    TransportError, methods,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as Frame, Utf8Bytes};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Frame>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

enum Outbound {
    Frame(String),
    Close(CloseReason),
}

/// The attached peer.
struct Peer {
    conn_id: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    calls: Arc<RpcCorrelator>,
}

struct Shared {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    active: Mutex<Option<Peer>>,
    status: watch::Sender<ServerStatus>,
    snapshots: Option<SnapshotWriter<ServerStatus>>,
    next_conn: AtomicU64,
    keepalive_in_flight: AtomicBool,
    keepalive_id: Mutex<Option<String>>,
    /// Last inbound frame other than a keepalive reply.
    last_active: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

pub struct TransportServerBuilder {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    snapshots: Option<SnapshotWriter<ServerStatus>>,
}

impl TransportServerBuilder {
    /// Serves requests the peer sends to the server.
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn snapshots(mut self, writer: SnapshotWriter<ServerStatus>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Bind the listener and start accepting. A bind failure is the one
    /// error the server cannot recover from.
    pub async fn bind(self) -> Result<TransportServer, ServerError> {
        let addr = self.config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        tracing::info!("Listening on ws://{}", local_addr);

        let shared = Arc::new(Shared {
            config: self.config,
            handler: self.handler,
            active: Mutex::new(None),
            status: watch::Sender::new(ServerStatus {
                listening_port: local_addr.port(),
                ..Default::default()
            }),
            snapshots: self.snapshots,
            next_conn: AtomicU64::new(1),
            keepalive_in_flight: AtomicBool::new(false),
            keepalive_id: Mutex::new(None),
            last_active: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        shared.update(|_| {});

        let tasks = vec![
            tokio::spawn(accept_loop(listener, shared.clone())),
            tokio::spawn(keepalive_loop(shared.clone())),
        ];
        Ok(TransportServer {
            shared,
            local_addr,
            tasks,
        })
    }
}

/// Handle to a running server. Dropping it stops accepting and closes the
/// attached peer.
pub struct TransportServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportServer {
    pub fn builder(config: ServerConfig) -> TransportServerBuilder {
        TransportServerBuilder {
            config,
            handler: Arc::new(crate::bridge_router()),
            snapshots: None,
        }
    }

    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::builder(config).bind().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_active().is_some()
    }

    /// Call `method` on the attached peer. `timeout` defaults to the
    /// configured call timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.call_timeout());
        self.shared.call(method, params, timeout).await
    }

    /// Start a keepalive ping unless one is already in flight or no peer is
    /// attached. Returns whether a ping was sent.
    pub fn send_keepalive(&self) -> bool {
        self.shared.keepalive()
    }

    /// Close the attached peer, if any, and fail its outstanding calls.
    pub fn close_peer(&self) {
        let peer = self.shared.lock_active().take();
        if let Some(peer) = peer {
            let _ = peer.outbound.send(Outbound::Close(CloseReason::Normal));
            let failed = peer.calls.fail_all();
            tracing::info!("Peer closed; {} pending call(s) failed", failed);
            self.shared.update(clear_peer);
        }
    }

    pub fn status(&self) -> ServerStatus {
        let mut status = self.shared.status.borrow().clone();
        status.pending_calls = self.shared.pending_calls();
        status
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until a peer completes its hello.
    pub async fn wait_for_peer(&self, timeout: Duration) -> bool {
        let mut status = self.subscribe();
        matches!(
            tokio::time::timeout(timeout, status.wait_for(|s| s.peer_attached)).await,
            Ok(Ok(_))
        )
    }

    pub async fn shutdown(mut self) {
        self.stop();
        tracing::info!("Server on {} stopped", self.local_addr);
    }

    fn stop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.close_peer();
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clear_peer(status: &mut ServerStatus) {
    status.peer_attached = false;
    status.peer_app = None;
    status.peer_addr = None;
    status.connected_at = None;
}

impl Shared {
    fn lock_active(&self) -> MutexGuard<'_, Option<Peer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_calls(&self) -> usize {
        self.lock_active().as_ref().map_or(0, |p| p.calls.len())
    }

    fn is_current(&self, conn_id: u64) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|p| p.conn_id == conn_id)
    }

    /// Must not be called with `active` locked.
    fn update(&self, f: impl FnOnce(&mut ServerStatus)) {
        let pending = self.pending_calls();
        self.status.send_modify(|status| {
            f(status);
            status.pending_calls = pending;
        });
        if let Some(snapshots) = &self.snapshots {
            snapshots.offer(self.status.borrow().clone());
        }
    }

    /// Install `peer` as the attached peer. Returns false once the server
    /// is stopped, in which case the socket is closed instead.
    fn attach(&self, peer: Peer, app: AppInfo, addr: SocketAddr) -> bool {
        let previous = {
            let mut active = self.lock_active();
            if self.closed.load(Ordering::Acquire) {
                drop(active);
                let _ = peer.outbound.send(Outbound::Close(CloseReason::Normal));
                return false;
            }
            active.replace(peer)
        };
        if let Some(previous) = previous {
            let _ = previous.outbound.send(Outbound::Close(CloseReason::Replaced));
            let failed = previous.calls.fail_all();
            tracing::info!(
                "Previous peer replaced by {}; {} pending call(s) failed",
                addr,
                failed
            );
        }

        tracing::info!("Peer attached from {}: {}", addr, app);
        self.mark_active();
        let now = Utc::now();
        self.update(|status| {
            status.peer_attached = true;
            status.peer_app = Some(app);
            status.peer_addr = Some(addr.to_string());
            status.connected_at = Some(now);
            status.last_traffic_at = Some(now);
            status.last_error = None;
        });
        true
    }

    fn detach(&self, conn_id: u64, calls: &RpcCorrelator, error: Option<String>) {
        let was_current = {
            let mut active = self.lock_active();
            let current = active.as_ref().is_some_and(|p| p.conn_id == conn_id);
            if current {
                *active = None;
            }
            current
        };
        let failed = calls.fail_all();
        if failed > 0 {
            tracing::debug!("{} pending call(s) failed on disconnect", failed);
        }
        if was_current {
            tracing::info!("Peer disconnected");
            self.update(|status| {
                clear_peer(status);
                if error.is_some() {
                    status.last_error = error;
                }
            });
        }
    }

    fn touch(&self, conn_id: u64) {
        if self.is_current(conn_id) {
            let now = Utc::now();
            self.update(|status| status.last_traffic_at = Some(now));
        }
    }

    fn mark_active(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    fn active_within(&self, period: Duration) -> bool {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < period)
    }

    fn lock_keepalive_id(&self) -> MutexGuard<'_, Option<String>> {
        self.keepalive_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_keepalive_reply(&self, message: &Message) -> bool {
        match message {
            Message::Response { id, .. } => self.lock_keepalive_id().as_deref() == Some(id.as_str()),
            _ => false,
        }
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.call_as(id, method, params, timeout).await
    }

    async fn call_as(
        &self,
        id: String,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        // Registered under the peer lock so a concurrent replacement either
        // sees this call in the drained correlator or no peer at all.
        let (outbound, pending) = {
            let active = self.lock_active();
            let peer = active.as_ref().ok_or(TransportError::NotConnected)?;
            (peer.outbound.clone(), peer.calls.register(id.clone(), method))
        };
        let frame = Message::request(id, method, params)
            .encode()
            .map_err(|e| TransportError::SendFailure(e.to_string()))?;
        outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| RpcError::Disconnected)?;
        tracing::debug!("-> {} ({})", method, pending.id());

        pending.wait(timeout).await
    }

    fn keepalive(self: &Arc<Self>) -> bool {
        if self.lock_active().is_none() {
            return false;
        }
        if self.keepalive_in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("Keepalive still in flight; skipping");
            return false;
        }
        let id = uuid::Uuid::new_v4().to_string();
        *self.lock_keepalive_id() = Some(id.clone());
        let shared = self.clone();
        tokio::spawn(async move {
            let timeout = shared.config.keepalive_timeout();
            if let Err(e) = shared.call_as(id, methods::PING, None, timeout).await {
                tracing::debug!("Keepalive failed: {}", e);
            }
            *shared.lock_keepalive_id() = None;
            shared.keepalive_in_flight.store(false, Ordering::Release);
        });
        true
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(shared, stream, addr).await {
                        tracing::warn!("Connection error from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let period = shared.config.keepalive_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if shared.active_within(period) {
            tracing::trace!("Peer active; keepalive skipped");
            continue;
        }
        shared.keepalive();
    }
}

enum HelloFailure {
    Invalid(String),
    Gone,
}

async fn read_hello(stream: &mut WsStream) -> Result<AppInfo, HelloFailure> {
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(_)) | None => return Err(HelloFailure::Gone),
        };
        return match frame {
            Frame::Text(text) => match Message::decode(text.as_str()) {
                Ok(Message::Hello { app }) => Ok(app),
                Ok(other) => Err(HelloFailure::Invalid(format!(
                    "expected hello, got {}",
                    other.kind()
                ))),
                Err(e) => Err(HelloFailure::Invalid(e.to_string())),
            },
            Frame::Binary(_) => Err(HelloFailure::Invalid("binary frame".into())),
            Frame::Close(_) => Err(HelloFailure::Gone),
            _ => continue,
        };
    }
}

fn close_frame(reason: CloseReason) -> Frame {
    Frame::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: Utf8Bytes::from_static(reason.reason()),
    }))
}

async fn reject(
    shared: &Shared,
    mut sink: WsSink,
    addr: SocketAddr,
    reason: CloseReason,
    error: ProtocolError,
) {
    tracing::warn!("Rejecting {}: {}", addr, error);
    shared.update(|status| status.last_error = Some(error.to_string()));
    if let Err(e) = sink.send(close_frame(reason)).await {
        tracing::debug!("Close frame to {} not sent: {}", addr, e);
    }
    let _ = sink.close().await;
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), WsError> {
    // One window covers both the upgrade and the hello.
    let deadline = Instant::now() + shared.config.handshake_timeout();
    let ws = match tokio::time::timeout_at(deadline, tokio_tungstenite::accept_async(stream)).await {
        Ok(ws) => ws?,
        Err(_) => {
            let error = ProtocolError::HandshakeTimeout;
            tracing::warn!("Dropping {}: {} before upgrade", addr, error);
            shared.update(|status| status.last_error = Some(error.to_string()));
            return Ok(());
        }
    };
    let (sink, mut stream) = ws.split();
    tracing::debug!("New connection from {}", addr);

    let app = match tokio::time::timeout_at(deadline, read_hello(&mut stream)).await {
        Ok(Ok(app)) => app,
        Ok(Err(HelloFailure::Invalid(detail))) => {
            let error = ProtocolError::InvalidHello(detail);
            reject(&shared, sink, addr, CloseReason::InvalidHello, error).await;
            return Ok(());
        }
        Ok(Err(HelloFailure::Gone)) => {
            tracing::debug!("{} left before its hello", addr);
            return Ok(());
        }
        Err(_) => {
            let error = ProtocolError::HandshakeTimeout;
            reject(&shared, sink, addr, CloseReason::HandshakeTimeout, error).await;
            return Ok(());
        }
    };

    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let calls = Arc::new(RpcCorrelator::new());
    tokio::spawn(write_loop(sink, outbound_rx));
    let peer = Peer {
        conn_id,
        outbound: outbound.clone(),
        calls: calls.clone(),
    };
    if !shared.attach(peer, app, addr) {
        tracing::debug!("Server stopped; closing {}", addr);
        return Ok(());
    }

    let result = read_loop(&shared, conn_id, &mut stream, &outbound, &calls).await;
    shared.detach(conn_id, &calls, result.as_ref().err().map(ToString::to_string));
    result
}

async fn read_loop(
    shared: &Arc<Shared>,
    conn_id: u64,
    stream: &mut WsStream,
    outbound: &mpsc::UnboundedSender<Outbound>,
    calls: &RpcCorrelator,
) -> Result<(), WsError> {
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Frame::Text(text) => text,
            Frame::Close(frame) => {
                tracing::debug!("Peer sent close: {:?}", frame);
                break;
            }
            _ => continue,
        };
        shared.touch(conn_id);

        let message = match Message::decode(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid message: {}", e);
                continue;
            }
        };
        if !shared.is_keepalive_reply(&message) {
            shared.mark_active();
        }
        match message {
            Message::Request { id, method, params } => {
                let handler = shared.handler.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let reply = respond(handler.as_ref(), id, &method, params).await;
                    match reply.encode() {
                        Ok(frame) => {
                            let _ = outbound.send(Outbound::Frame(frame));
                        }
                        Err(e) => tracing::warn!("Failed to encode response to {}: {}", method, e),
                    }
                });
            }
            response @ Message::Response { .. } => {
                if let Some((id, outcome)) = response.into_response()
                    && !calls.resolve(&id, outcome)
                {
                    tracing::debug!("Ignoring response for unknown call {}", id);
                }
            }
            Message::Hello { app } => {
                tracing::debug!("Ignoring repeated hello from {}", app);
            }
        }
    }
    Ok(())
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        let sent = match item {
            Outbound::Frame(text) => sink.send(Frame::Text(text.into())).await,
            Outbound::Close(reason) => {
                if let Err(e) = sink.send(close_frame(reason)).await {
                    tracing::debug!("Close frame not sent: {}", e);
                }
                break;
            }
        };
        if let Err(e) = sent {
            tracing::debug!("Write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}
