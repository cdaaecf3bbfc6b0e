//! Channel abstraction.
//!
//! The state machine talks to the server through a [`Channel`] opened by a
//! [`Connector`]. Two bindings exist: a standard WebSocket and a socket
//! capability handed in by the host sandbox. The host binding never reports
//! close or error, so the state machine must not rely on those events.

use async_trait::async_trait;
use edabridge_core::{CloseReason, TransportError};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound notifications from an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A text frame.
    Message(String),
    /// The remote end closed the channel.
    Closed { code: Option<u16>, reason: String },
    /// The channel failed.
    Error(String),
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// An open, bidirectional text channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Best-effort close. Never fails.
    async fn close(&mut self, reason: CloseReason);
}

/// Opens channels of one binding.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short name for logs and status.
    fn kind(&self) -> &'static str;

    /// Whether this binding can be used in the current environment.
    fn is_available(&self) -> bool {
        true
    }

    async fn open(&self, url: &str, events: EventSender) -> Result<Box<dyn Channel>, TransportError>;
}

/// Picks the binding once per connect attempt, preferring the host-native
/// one when it is present and available.
#[derive(Clone)]
pub struct ChannelSelector {
    preferred: Option<Arc<dyn Connector>>,
    fallback: Arc<dyn Connector>,
}

impl ChannelSelector {
    pub fn new(preferred: Option<Arc<dyn Connector>>, fallback: Arc<dyn Connector>) -> Self {
        Self { preferred, fallback }
    }

    /// Standard WebSocket only.
    pub fn websocket() -> Self {
        Self::new(None, Arc::new(crate::ws::WebSocketConnector::default()))
    }

    /// Prefer the host sandbox socket, fall back to a standard WebSocket.
    pub fn with_host(api: Arc<dyn crate::host::HostSocketApi>) -> Self {
        Self::new(
            Some(Arc::new(crate::host::HostConnector::new(api))),
            Arc::new(crate::ws::WebSocketConnector::default()),
        )
    }

    pub fn select(&self) -> Arc<dyn Connector> {
        match &self.preferred {
            Some(preferred) if preferred.is_available() => preferred.clone(),
            _ => self.fallback.clone(),
        }
    }
}

impl Default for ChannelSelector {
    fn default() -> Self {
        Self::websocket()
    }
}

impl std::fmt::Debug for ChannelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSelector")
            .field("preferred", &self.preferred.as_ref().map(|c| c.kind()))
            .field("fallback", &self.fallback.kind())
            .finish()
    }
}
