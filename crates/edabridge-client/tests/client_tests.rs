//! State machine tests against in-memory channels on a paused clock.

use async_trait::async_trait;
use edabridge_client::{
    Channel, ChannelEvent, ChannelSelector, ClientConfig, Connector, EventSender, FrameCallback,
    HostConnector, HostSocketApi, TransportClient,
};
use edabridge_core::{
    CloseReason, ConnectionState, HandlerError, Message, TransportError, Router, codes,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Server side of one mock channel.
struct Peer {
    sent: mpsc::UnboundedReceiver<String>,
    events: EventSender,
    closed: Arc<Mutex<Vec<CloseReason>>>,
}

impl Peer {
    async fn next(&mut self) -> Message {
        let text = self.sent.recv().await.expect("channel dropped");
        Message::decode(&text).expect("client sent invalid frame")
    }

    fn push(&self, message: Message) {
        self.events
            .send(ChannelEvent::Message(message.encode().unwrap()))
            .unwrap();
    }

    fn close_reasons(&self) -> Vec<CloseReason> {
        self.closed.lock().unwrap().clone()
    }
}

struct MockChannel {
    out: mpsc::UnboundedSender<String>,
    closed: Arc<Mutex<Vec<CloseReason>>>,
    stall: bool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.out
            .send(text)
            .map_err(|e| TransportError::SendFailure(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        self.closed.lock().unwrap().push(reason);
    }
}

struct MockConnector {
    fail: AtomicBool,
    /// `open` never completes.
    hang_open: AtomicBool,
    /// Sends on opened channels never complete.
    hang_send: AtomicBool,
    attempts: AtomicUsize,
    attempt_times: mpsc::UnboundedSender<Instant>,
    peers: mpsc::UnboundedSender<Peer>,
}

struct Harness {
    connector: Arc<MockConnector>,
    attempt_times: mpsc::UnboundedReceiver<Instant>,
    peers: mpsc::UnboundedReceiver<Peer>,
}

impl Harness {
    fn new() -> Self {
        let (times_tx, attempt_times) = mpsc::unbounded_channel();
        let (peers_tx, peers) = mpsc::unbounded_channel();
        Self {
            connector: Arc::new(MockConnector {
                fail: AtomicBool::new(false),
                hang_open: AtomicBool::new(false),
                hang_send: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
                attempt_times: times_tx,
                peers: peers_tx,
            }),
            attempt_times,
            peers,
        }
    }

    fn selector(&self) -> ChannelSelector {
        ChannelSelector::new(None, self.connector.clone())
    }

    async fn next_peer(&mut self) -> Peer {
        self.peers.recv().await.expect("connector dropped")
    }

    fn attempts(&self) -> usize {
        self.connector.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, _url: &str, events: EventSender) -> Result<Box<dyn Channel>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let _ = self.attempt_times.send(Instant::now());
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }
        if self.hang_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (out, sent) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(Vec::new()));
        let _ = self.peers.send(Peer {
            sent,
            events,
            closed: closed.clone(),
        });
        Ok(Box::new(MockChannel {
            out,
            closed,
            stall: self.hang_send.load(Ordering::SeqCst),
        }))
    }
}

fn router() -> Arc<Router> {
    Arc::new(
        Router::new()
            .route("ping", |_| async { Ok(json!({"pong": true})) })
            .route("broken", |_| async { Err(HandlerError::new("export failed")) })
            .route("slow", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            }),
    )
}

fn config() -> ClientConfig {
    ClientConfig::default().with_url("ws://127.0.0.1:9050")
}

fn spawn(harness: &Harness, config: ClientConfig) -> TransportClient {
    TransportClient::builder(config)
        .selector(harness.selector())
        .handler(router())
        .spawn()
}

/// Drive a fresh peer through hello and a confirming request.
async fn handshake(peer: &mut Peer) {
    assert!(matches!(peer.next().await, Message::Hello { .. }));
    peer.push(Message::request("hs", "ping", None));
    let (id, result) = peer.next().await.into_response().unwrap();
    assert_eq!(id, "hs");
    assert_eq!(result.unwrap(), json!({"pong": true}));
}

#[tokio::test(start_paused = true)]
async fn test_open_channel_is_not_connected_until_request() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());
    let mut status = client.subscribe();

    client.connect();
    let mut peer = harness.next_peer().await;
    match peer.next().await {
        Message::Hello { app } => assert_eq!(app.name.as_deref(), Some("edabridge-client")),
        other => panic!("expected hello, got {}", other.kind()),
    }
    assert_eq!(client.status().state, ConnectionState::Connecting);
    assert_eq!(client.status().transport.as_deref(), Some("mock"));

    peer.push(Message::request("1", "ping", None));
    let (id, result) = peer.next().await.into_response().unwrap();
    assert_eq!(id, "1");
    assert_eq!(result.unwrap(), json!({"pong": true}));

    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    let snapshot = client.status();
    assert!(snapshot.connected_at.is_some());
    assert!(snapshot.last_traffic_at.is_some());
    assert!(snapshot.last_error.is_none());

    client.shutdown().await;
    assert_eq!(peer.close_reasons(), vec![CloseReason::Normal]);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_watchdog_closes_silent_channel() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());
    let mut status = client.subscribe();

    client.connect();
    let mut peer = harness.next_peer().await;
    let opened_at = Instant::now();
    assert!(matches!(peer.next().await, Message::Hello { .. }));

    status
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(opened_at.elapsed() >= Duration::from_millis(8_000));
    assert_eq!(peer.close_reasons(), vec![CloseReason::HandshakeTimeout]);
    assert_eq!(
        client.status().last_error.as_deref(),
        Some("handshake timed out")
    );

    // no supervisor, no retry
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_that_never_completes_times_out() {
    let harness = Harness::new();
    harness.connector.hang_open.store(true, Ordering::SeqCst);
    let mut cfg = config();
    cfg.connect_timeout_ms = 2_000;
    let client = spawn(&harness, cfg);
    let mut status = client.subscribe();

    let started = Instant::now();
    client.connect();
    status
        .wait_for(|s| s.last_error.is_some())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(2_000));

    let snapshot = client.status();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.last_error.as_deref(), Some("connect timed out"));
    assert_eq!(harness.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hello_stuck_past_connect_window_closes_channel() {
    let mut harness = Harness::new();
    harness.connector.hang_send.store(true, Ordering::SeqCst);
    let client = spawn(&harness, config());
    let mut status = client.subscribe();

    client.connect();
    let peer = harness.next_peer().await;
    status
        .wait_for(|s| s.last_error.is_some())
        .await
        .unwrap();

    assert_eq!(peer.close_reasons(), vec![CloseReason::ConnectTimeout]);
    let snapshot = client.status();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert_eq!(snapshot.last_error.as_deref(), Some("connect timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_reconnects_exactly_once() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());

    client.connect();
    let mut first = harness.next_peer().await;
    handshake(&mut first).await;
    let confirmed_at = Instant::now();

    // silence: the staleness check drops the link and schedules one retry
    let mut second = harness.next_peer().await;
    assert!(confirmed_at.elapsed() > Duration::from_secs(60));
    assert_eq!(first.close_reasons(), vec![CloseReason::Normal]);
    assert!(matches!(second.next().await, Message::Hello { .. }));
    assert!(
        client
            .status()
            .last_error
            .is_some_and(|e| e.starts_with("stale"))
    );

    // the retry is never confirmed; nothing else is scheduled
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(harness.attempts(), 2);
    assert!(harness.peers.try_recv().is_err());
    assert_eq!(client.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_traffic_keeps_connection_fresh() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());

    client.connect();
    let mut peer = harness.next_peer().await;
    handshake(&mut peer).await;

    for i in 0..6 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        peer.push(Message::request(format!("k{i}"), "ping", None));
        assert!(peer.next().await.into_response().is_some());
    }
    assert_eq!(client.status().state, ConnectionState::Connected);
    assert_eq!(harness.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_every_request_gets_one_response() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());

    client.connect();
    let mut peer = harness.next_peer().await;
    handshake(&mut peer).await;

    peer.push(Message::request("a", "broken", None));
    let (id, result) = peer.next().await.into_response().unwrap();
    assert_eq!(id, "a");
    let err = result.unwrap_err();
    assert_eq!(err.code, codes::INTERNAL_ERROR);
    assert_eq!(err.message, "export failed");

    peer.push(Message::request("b", "library.unknown", Some(json!({"q": 1}))));
    let (id, result) = peer.next().await.into_response().unwrap();
    assert_eq!(id, "b");
    assert_eq!(result.unwrap_err().code, codes::METHOD_NOT_FOUND);

    // garbage is logged and skipped, the channel stays up
    peer.events
        .send(ChannelEvent::Message("{not json".into()))
        .unwrap();
    peer.push(Message::request("c", "ping", None));
    let (id, _) = peer.next().await.into_response().unwrap();
    assert_eq!(id, "c");
    assert_eq!(client.status().state, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_reply_for_previous_channel_is_dropped() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());

    client.connect();
    let mut first = harness.next_peer().await;
    handshake(&mut first).await;
    first.push(Message::request("s", "slow", None));
    tokio::time::sleep(Duration::from_secs(1)).await;

    client.disconnect(false);
    client.connect();
    let mut second = harness.next_peer().await;
    assert!(matches!(second.next().await, Message::Hello { .. }));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(second.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_backs_off_between_attempts() {
    let mut harness = Harness::new();
    harness.connector.fail.store(true, Ordering::SeqCst);
    let mut cfg = config();
    cfg.auto_reconnect = true;
    let client = spawn(&harness, cfg);

    let mut times = Vec::new();
    for _ in 0..5 {
        times.push(harness.attempt_times.recv().await.unwrap());
    }
    let gaps: Vec<u128> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis())
        .collect();
    for (gap, expected) in gaps.iter().zip([1500u128, 2400, 3840, 6144]) {
        assert!(
            *gap >= expected && *gap < expected + 10,
            "gap {gap}ms, expected {expected}ms"
        );
    }

    let status = client.status();
    assert!(status.auto_reconnect);
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(
        status
            .last_error
            .is_some_and(|e| e.contains("connection refused"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_recovers_after_server_returns() {
    let mut harness = Harness::new();
    harness.connector.fail.store(true, Ordering::SeqCst);
    let mut cfg = config();
    cfg.auto_reconnect = true;
    let client = spawn(&harness, cfg);
    let mut status = client.subscribe();

    harness.attempt_times.recv().await.unwrap();
    harness.attempt_times.recv().await.unwrap();
    harness.connector.fail.store(false, Ordering::SeqCst);

    let mut peer = harness.next_peer().await;
    handshake(&mut peer).await;
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    assert!(client.status().last_error.is_none());

    // a connected supervisor only re-checks
    tokio::time::sleep(Duration::from_secs(40)).await;
    peer.push(Message::request("k", "ping", None));
    peer.next().await;
    assert_eq!(harness.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_preserves_error_on_request() {
    let mut harness = Harness::new();
    harness.connector.fail.store(true, Ordering::SeqCst);
    let client = spawn(&harness, config());
    let mut status = client.subscribe();

    client.connect();
    status
        .wait_for(|s| s.last_error.is_some())
        .await
        .unwrap();
    assert_eq!(harness.attempts(), 1);

    let _ = status.borrow_and_update();
    client.disconnect(true);
    status.changed().await.unwrap();
    assert!(status.borrow_and_update().last_error.is_some());

    client.disconnect(false);
    status
        .wait_for(|s| s.last_error.is_none())
        .await
        .unwrap();
    assert_eq!(client.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_supervisor() {
    let mut harness = Harness::new();
    harness.connector.fail.store(true, Ordering::SeqCst);
    let mut cfg = config();
    cfg.auto_reconnect = true;
    let client = spawn(&harness, cfg);

    harness.attempt_times.recv().await.unwrap();
    client.disconnect(false);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(harness.attempts(), 1);
    assert!(!client.status().auto_reconnect);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_close_is_reported() {
    let mut harness = Harness::new();
    let client = spawn(&harness, config());
    let mut status = client.subscribe();

    client.connect();
    let mut peer = harness.next_peer().await;
    handshake(&mut peer).await;

    peer.events
        .send(ChannelEvent::Closed {
            code: Some(CloseReason::Replaced.code()),
            reason: CloseReason::Replaced.reason().into(),
        })
        .unwrap();
    status
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(
        client
            .status()
            .last_error
            .is_some_and(|e| e.contains("replaced by new connection"))
    );

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_are_bounded() {
    let mut harness = Harness::new();
    harness.connector.fail.store(true, Ordering::SeqCst);
    let mut cfg = config();
    cfg.auto_reconnect = true;
    cfg.diagnostics_capacity = 5;
    let client = spawn(&harness, cfg);

    for _ in 0..6 {
        harness.attempt_times.recv().await.unwrap();
    }
    let entries = client.diagnostics();
    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|w| w[0].at <= w[1].at));
}

#[derive(Default)]
struct MockHost {
    available: bool,
    registered: Mutex<Vec<(String, String)>>,
    callback: Mutex<Option<FrameCallback>>,
    sent: Mutex<Vec<String>>,
    closed: Mutex<Vec<(String, u16)>>,
}

impl MockHost {
    fn deliver(&self, message: Message) {
        let guard = self.callback.lock().unwrap();
        let callback = guard.as_ref().expect("no socket registered");
        callback(message.encode().unwrap());
    }

    fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|t| Message::decode(t).unwrap())
            .collect()
    }
}

impl HostSocketApi for MockHost {
    fn is_available(&self) -> bool {
        self.available
    }

    fn register(&self, id: &str, url: &str, on_message: FrameCallback) -> Result<(), String> {
        self.registered
            .lock()
            .unwrap()
            .push((id.to_string(), url.to_string()));
        *self.callback.lock().unwrap() = Some(on_message);
        Ok(())
    }

    fn send(&self, _id: &str, data: &str) -> Result<(), String> {
        self.sent.lock().unwrap().push(data.to_string());
        Ok(())
    }

    fn close(&self, id: &str, code: u16, _reason: &str) {
        self.closed.lock().unwrap().push((id.to_string(), code));
    }
}

#[tokio::test(start_paused = true)]
async fn test_host_binding_preferred_when_available() {
    let harness = Harness::new();
    let host = Arc::new(MockHost {
        available: true,
        ..Default::default()
    });
    let selector = ChannelSelector::new(
        Some(Arc::new(HostConnector::new(host.clone()))),
        harness.connector.clone(),
    );
    let client = TransportClient::builder(config())
        .selector(selector)
        .handler(router())
        .spawn();
    let mut status = client.subscribe();

    client.connect();
    status
        .wait_for(|s| s.state == ConnectionState::Connecting)
        .await
        .unwrap();
    assert_eq!(client.status().transport.as_deref(), Some("host"));
    assert_eq!(harness.attempts(), 0);

    let (id, url) = host.registered.lock().unwrap()[0].clone();
    assert!(id.starts_with("edabridge-"));
    assert_eq!(url, "ws://127.0.0.1:9050");
    assert!(matches!(host.sent()[0], Message::Hello { .. }));

    host.deliver(Message::request("1", "ping", None));
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(host.sent().len(), 2);

    client.shutdown().await;
    assert_eq!(host.closed.lock().unwrap()[0], (id, 1000));
}

#[tokio::test(start_paused = true)]
async fn test_host_binding_falls_back_when_unavailable() {
    let mut harness = Harness::new();
    let host = Arc::new(MockHost::default());
    let selector = ChannelSelector::new(
        Some(Arc::new(HostConnector::new(host.clone()))),
        harness.connector.clone(),
    );
    let client = TransportClient::builder(config())
        .selector(selector)
        .handler(router())
        .spawn();

    client.connect();
    let mut peer = harness.next_peer().await;
    handshake(&mut peer).await;

    assert_eq!(client.status().transport.as_deref(), Some("mock"));
    assert!(host.registered.lock().unwrap().is_empty());
}
