//! Host sandbox socket binding.
//!
//! The host exposes its own socket API as a capability object. It delivers
//! inbound frames but has no reliable close or error notification, so a
//! channel opened through it never emits [`ChannelEvent::Closed`] or
//! [`ChannelEvent::Error`]; liveness is judged from traffic alone.

use crate::channel::{Channel, ChannelEvent, Connector, EventSender};
use async_trait::async_trait;
use edabridge_core::{CloseReason, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Inbound frame callback registered with the host.
pub type FrameCallback = Box<dyn Fn(String) + Send + Sync>;

/// Socket operations supplied by the embedding host.
pub trait HostSocketApi: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    /// Open a socket under `id` and deliver inbound text frames to `on_message`.
    fn register(&self, id: &str, url: &str, on_message: FrameCallback) -> Result<(), String>;

    fn send(&self, id: &str, data: &str) -> Result<(), String>;

    fn close(&self, id: &str, code: u16, reason: &str);
}

pub struct HostConnector {
    api: Arc<dyn HostSocketApi>,
    next_id: AtomicU64,
}

impl HostConnector {
    pub fn new(api: Arc<dyn HostSocketApi>) -> Self {
        Self {
            api,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Connector for HostConnector {
    fn kind(&self) -> &'static str {
        "host"
    }

    fn is_available(&self) -> bool {
        self.api.is_available()
    }

    async fn open(&self, url: &str, events: EventSender) -> Result<Box<dyn Channel>, TransportError> {
        let id = format!("edabridge-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let on_message: FrameCallback = Box::new(move |text| {
            let _ = events.send(ChannelEvent::Message(text));
        });
        self.api
            .register(&id, url, on_message)
            .map_err(TransportError::ConnectFailed)?;
        Ok(Box::new(HostChannel {
            api: self.api.clone(),
            id,
        }))
    }
}

struct HostChannel {
    api: Arc<dyn HostSocketApi>,
    id: String,
}

#[async_trait]
impl Channel for HostChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.api
            .send(&self.id, &text)
            .map_err(TransportError::SendFailure)
    }

    async fn close(&mut self, reason: CloseReason) {
        self.api.close(&self.id, reason.code(), reason.reason());
    }
}
