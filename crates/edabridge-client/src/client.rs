//! Peer-side connection state machine.
//!
//! ```text
//! Disconnected --connect--> Connecting --first request--> Connected
//!      ^                        |                             |
//!      +---- handshake timeout -+---- close / error / stale --+
//! ```
//!
//! An open channel is not proof the server half is alive: one binding never
//! reports close, so the handshake is confirmed only by an inbound request,
//! and a connected channel that goes silent past the staleness threshold is
//! torn down and retried.
//!
//! All state lives in a single task. Timers are `Option<Instant>` deadlines
//! polled by that task, so there is at most one of each and clearing the
//! field cancels it.

use crate::backoff::Backoff;
use crate::channel::{Channel, ChannelEvent, ChannelSelector};
use crate::config::ClientConfig;
use crate::diagnostics::{DiagnosticEntry, DiagnosticLog};
use crate::status::ClientStatus;
use chrono::{DateTime, Utc};
use edabridge_core::handler::respond;
use edabridge_core::{
    CloseReason, ConnectionState, Message, ProtocolError, RequestHandler, Router, SnapshotWriter,
    TransportError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on a graceful close before the channel is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Command {
    Connect,
    Disconnect { preserve_error: bool },
    SetAutoReconnect(bool),
    Shutdown,
}

/// A response produced by a spawned handler, tagged with the channel epoch
/// it belongs to.
struct Reply {
    epoch: u64,
    message: Message,
}

struct Link {
    channel: Box<dyn Channel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Handle to a running client state machine.
pub struct TransportClient {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    diagnostics: Arc<Mutex<DiagnosticLog>>,
    task: Option<JoinHandle<()>>,
}

pub struct TransportClientBuilder {
    config: ClientConfig,
    selector: ChannelSelector,
    handler: Arc<dyn RequestHandler>,
    snapshots: Option<SnapshotWriter<ClientStatus>>,
}

impl TransportClientBuilder {
    pub fn selector(mut self, selector: ChannelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn snapshots(mut self, writer: SnapshotWriter<ClientStatus>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Start the state machine task. Must be called inside a tokio runtime.
    pub fn spawn(self) -> TransportClient {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (replies, replies_rx) = mpsc::unbounded_channel();
        let diagnostics = Arc::new(Mutex::new(DiagnosticLog::new(
            self.config.diagnostics_capacity,
        )));
        let backoff = Backoff::new(
            Duration::from_millis(self.config.reconnect_base_ms),
            self.config.reconnect_factor,
            Duration::from_millis(self.config.reconnect_cap_ms),
        );

        let mut actor = Actor {
            state: ConnectionState::Disconnected,
            link: None,
            transport: None,
            epoch: 0,
            connected_at: None,
            last_traffic: None,
            last_traffic_at: None,
            last_error: None,
            handshake_deadline: None,
            reconnect_at: None,
            auto_reconnect: false,
            backoff,
            replies,
            replies_rx,
            status: watch::Sender::new(placeholder_status(&self.config)),
            diagnostics: diagnostics.clone(),
            snapshots: self.snapshots,
            selector: self.selector,
            handler: self.handler,
            config: self.config,
        };
        if actor.config.auto_reconnect {
            actor.enable_supervisor();
        }
        actor.publish();
        let status = actor.status.subscribe();
        let task = tokio::spawn(actor.run(commands_rx));

        TransportClient {
            commands,
            status,
            diagnostics,
            task: Some(task),
        }
    }
}

fn placeholder_status(config: &ClientConfig) -> ClientStatus {
    ClientStatus {
        state: ConnectionState::Disconnected,
        url: config.url.clone(),
        transport: None,
        connected_at: None,
        last_traffic_at: None,
        last_error: None,
        auto_reconnect: false,
        next_reconnect_delay_ms: config.reconnect_base_ms,
    }
}

impl TransportClient {
    pub fn builder(config: ClientConfig) -> TransportClientBuilder {
        TransportClientBuilder {
            config,
            selector: ChannelSelector::default(),
            handler: Arc::new(Router::new()),
            snapshots: None,
        }
    }

    /// Open a channel and send the hello. No-op unless disconnected.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the channel and cancel every timer, including the reconnect
    /// supervisor. With `preserve_error` the last error stays visible.
    pub fn disconnect(&self, preserve_error: bool) {
        self.send(Command::Disconnect { preserve_error });
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.send(Command::SetAutoReconnect(enabled));
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Snapshot of the diagnostic ring, oldest first.
    pub fn diagnostics(&self) -> Vec<DiagnosticEntry> {
        match self.diagnostics.lock() {
            Ok(log) => log.entries(),
            Err(poisoned) => poisoned.into_inner().entries(),
        }
    }

    /// Stop the state machine, closing any open channel.
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Client task ended abnormally: {}", e);
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Client task is gone; command dropped");
        }
    }
}

struct Actor {
    config: ClientConfig,
    selector: ChannelSelector,
    handler: Arc<dyn RequestHandler>,

    state: ConnectionState,
    link: Option<Link>,
    transport: Option<&'static str>,
    /// Bumped per channel so late handler replies for an old channel are dropped.
    epoch: u64,
    connected_at: Option<DateTime<Utc>>,
    last_traffic: Option<Instant>,
    last_traffic_at: Option<DateTime<Utc>>,
    last_error: Option<String>,

    handshake_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    auto_reconnect: bool,
    backoff: Backoff,

    replies: mpsc::UnboundedSender<Reply>,
    replies_rx: mpsc::UnboundedReceiver<Reply>,
    status: watch::Sender<ClientStatus>,
    diagnostics: Arc<Mutex<DiagnosticLog>>,
    snapshots: Option<SnapshotWriter<ClientStatus>>,
}

async fn next_event(link: &mut Option<Link>) -> ChannelEvent {
    match link {
        Some(link) => link.events.recv().await.unwrap_or(ChannelEvent::Closed {
            code: None,
            reason: "channel dropped".into(),
        }),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut staleness = tokio::time::interval(self.config.staleness_check_interval());
        staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                event = next_event(&mut self.link) => self.on_event(event).await,
                Some(reply) = self.replies_rx.recv() => self.on_reply(reply).await,
                _ = sleep_until(self.handshake_deadline) => self.on_handshake_timeout().await,
                _ = sleep_until(self.reconnect_at) => self.on_reconnect_tick().await,
                _ = staleness.tick() => self.check_staleness().await,
            }
        }

        self.auto_reconnect = false;
        self.reconnect_at = None;
        self.teardown(CloseReason::Normal, false).await;
        self.diag("shutdown", "");
        tracing::debug!("Client task stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.backoff.reset();
                self.connect().await;
            }
            Command::Disconnect { preserve_error } => {
                self.auto_reconnect = false;
                self.reconnect_at = None;
                self.diag("disconnect", format!("preserve_error={preserve_error}"));
                self.teardown(CloseReason::Normal, preserve_error).await;
            }
            Command::SetAutoReconnect(true) => self.enable_supervisor(),
            Command::SetAutoReconnect(false) => {
                self.auto_reconnect = false;
                self.reconnect_at = None;
                self.diag("auto_reconnect", "disabled");
            }
            Command::Shutdown => {}
        }
        self.publish();
    }

    fn enable_supervisor(&mut self) {
        self.auto_reconnect = true;
        self.backoff.reset();
        self.reconnect_at = Some(Instant::now());
        self.diag("auto_reconnect", "enabled");
    }

    async fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            self.diag("connect_skipped", self.state.as_str());
            return;
        }

        let connector = self.selector.select();
        self.state = ConnectionState::Connecting;
        self.epoch += 1;
        self.transport = Some(connector.kind());
        self.diag(
            "connect",
            format!("{} via {}", self.config.url, connector.kind()),
        );
        tracing::info!("Connecting to {} via {}", self.config.url, connector.kind());
        self.publish();

        // The connect window covers opening the channel and sending hello.
        let deadline = Instant::now() + self.config.connect_timeout();
        let (events_tx, events) = mpsc::unbounded_channel();
        let opened = tokio::time::timeout_at(deadline, connector.open(&self.config.url, events_tx)).await;
        let mut channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return self.fail(e.to_string()).await,
            Err(_) => return self.fail(TransportError::ConnectTimeout.to_string()).await,
        };

        let hello = Message::hello(self.config.app.clone());
        let sent = match hello.encode() {
            Ok(text) => tokio::time::timeout_at(deadline, channel.send(text))
                .await
                .unwrap_or(Err(TransportError::ConnectTimeout)),
            Err(e) => Err(TransportError::SendFailure(e.to_string())),
        };
        if let Err(e) = sent {
            let reason = match e {
                TransportError::ConnectTimeout => CloseReason::ConnectTimeout,
                _ => CloseReason::Normal,
            };
            channel.close(reason).await;
            return self.fail(e.to_string()).await;
        }

        self.link = Some(Link { channel, events });
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout());
        self.diag("hello_sent", self.config.app.to_string());
    }

    /// A connect attempt failed before a link existed.
    async fn fail(&mut self, error: String) {
        tracing::warn!("Connect to {} failed: {}", self.config.url, error);
        self.diag("connect_failed", error.clone());
        self.last_error = Some(error);
        self.teardown(CloseReason::Normal, true).await;
    }

    async fn on_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(text) => self.on_frame(&text),
            ChannelEvent::Closed { code, reason } => {
                let error = match code.and_then(CloseReason::from_code) {
                    Some(CloseReason::Normal) => None,
                    Some(known) => Some(format!("closed by server: {known}")),
                    None => Some(match code {
                        Some(code) => format!("closed by server: {reason} ({code})"),
                        None => format!("channel closed: {reason}"),
                    }),
                };
                self.diag("closed", format!("{code:?} {reason}"));
                tracing::info!("Channel closed ({:?}): {}", code, reason);
                self.lose_link(error).await;
            }
            ChannelEvent::Error(error) => {
                self.diag("channel_error", error.clone());
                tracing::warn!("Channel error: {}", error);
                self.lose_link(Some(error)).await;
            }
        }
        self.publish();
    }

    fn on_frame(&mut self, text: &str) {
        self.last_traffic = Some(Instant::now());
        self.last_traffic_at = Some(Utc::now());

        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Invalid frame from server: {}", e);
                self.diag("decode_error", e.to_string());
                return;
            }
        };

        match message {
            Message::Request { id, method, params } => {
                if self.state == ConnectionState::Connecting {
                    self.confirm_handshake(&method);
                }
                self.dispatch(id, method, params);
            }
            Message::Response { id, .. } => {
                tracing::debug!("Ignoring unsolicited response {}", id);
            }
            Message::Hello { app } => {
                tracing::debug!("Server hello: {}", app);
            }
        }
    }

    fn confirm_handshake(&mut self, method: &str) {
        self.state = ConnectionState::Connected;
        self.handshake_deadline = None;
        self.connected_at = Some(Utc::now());
        self.last_error = None;
        self.diag("handshake_confirmed", method.to_string());
        tracing::info!("Connected to {}", self.config.url);
    }

    fn dispatch(&self, id: String, method: String, params: Option<serde_json::Value>) {
        let handler = self.handler.clone();
        let replies = self.replies.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let message = respond(handler.as_ref(), id, &method, params).await;
            let _ = replies.send(Reply { epoch, message });
        });
    }

    async fn on_reply(&mut self, reply: Reply) {
        if reply.epoch != self.epoch {
            tracing::debug!("Dropping reply for a previous channel");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            tracing::debug!("Dropping reply; channel closed");
            return;
        };
        let sent = match reply.message.encode() {
            Ok(text) => link.channel.send(text).await,
            Err(e) => Err(TransportError::SendFailure(e.to_string())),
        };
        if let Err(e) = sent {
            tracing::warn!("Failed to send response: {}", e);
            self.diag("send_failed", e.to_string());
            self.lose_link(Some(e.to_string())).await;
            self.publish();
        }
    }

    async fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        if self.state != ConnectionState::Connecting {
            return;
        }
        let error = ProtocolError::HandshakeTimeout.to_string();
        tracing::warn!("No request from server within {:?}", self.config.handshake_timeout());
        self.diag("handshake_timeout", "");
        self.last_error = Some(error);
        self.teardown(CloseReason::HandshakeTimeout, true).await;
    }

    async fn check_staleness(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(last) = self.last_traffic else {
            return;
        };
        let idle = last.elapsed();
        if idle <= self.config.staleness_threshold() {
            return;
        }
        tracing::warn!("No traffic for {:?}; reconnecting", idle);
        self.diag("stale", format!("idle {}ms", idle.as_millis()));
        self.last_error = Some(format!("stale: no traffic for {}s", idle.as_secs()));
        self.teardown(CloseReason::Normal, true).await;
        // The dead binding may never report close, so retry once even
        // without the supervisor.
        self.schedule_reconnect(self.base_delay());
        self.publish();
    }

    /// The link failed underneath us: drop it and keep the cause. The
    /// supervisor, if enabled, picks the reconnect up at base delay.
    async fn lose_link(&mut self, error: Option<String>) {
        if let Some(error) = error {
            self.last_error = Some(error);
        }
        self.teardown(CloseReason::Normal, true).await;
        if self.auto_reconnect {
            self.schedule_reconnect(self.base_delay());
        }
    }

    fn base_delay(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_base_ms)
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.reconnect_at = Some(Instant::now() + delay);
        self.diag("reconnect_scheduled", format!("{}ms", delay.as_millis()));
    }

    async fn on_reconnect_tick(&mut self) {
        self.reconnect_at = None;
        match self.state {
            ConnectionState::Connected => {
                if self.auto_reconnect {
                    self.schedule_reconnect(self.config.connected_recheck());
                }
            }
            ConnectionState::Connecting => {
                if self.auto_reconnect {
                    self.schedule_reconnect(self.config.connecting_recheck());
                }
            }
            ConnectionState::Disconnected => {
                self.connect().await;
                if self.auto_reconnect {
                    let delay = self.backoff.next_delay();
                    self.schedule_reconnect(delay);
                }
            }
        }
        self.publish();
    }

    /// Close the link if any and return to `Disconnected`.
    async fn teardown(&mut self, reason: CloseReason, preserve_error: bool) {
        self.handshake_deadline = None;
        if let Some(mut link) = self.link.take()
            && tokio::time::timeout(CLOSE_GRACE, link.channel.close(reason))
                .await
                .is_err()
        {
            tracing::debug!("Graceful close timed out");
        }
        if self.state != ConnectionState::Disconnected {
            self.diag("state", "disconnected");
        }
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
        if !preserve_error {
            self.last_error = None;
        }
        self.publish();
    }

    fn diag(&self, event: &'static str, detail: impl Into<String>) {
        if let Ok(mut log) = self.diagnostics.lock() {
            log.record(event, detail);
        }
    }

    fn publish(&self) {
        let status = ClientStatus {
            state: self.state,
            url: self.config.url.clone(),
            transport: self.transport.map(str::to_string),
            connected_at: self.connected_at,
            last_traffic_at: self.last_traffic_at,
            last_error: self.last_error.clone(),
            auto_reconnect: self.auto_reconnect,
            next_reconnect_delay_ms: self.backoff.current().as_millis() as u64,
        };
        if let Some(snapshots) = &self.snapshots {
            snapshots.offer(status.clone());
        }
        self.status.send_replace(status);
    }
}
