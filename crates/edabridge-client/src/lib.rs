//! Peer side of the edabridge loopback bridge.
//!
//! [`TransportClient`] dials the server, announces itself with a hello and
//! then serves the server's requests through a [`RequestHandler`]. Liveness
//! is judged from inbound traffic, never from the channel's own open/close
//! signals alone.
//!
//! [`RequestHandler`]: edabridge_core::RequestHandler

mod backoff;
mod channel;
mod client;
mod config;
mod diagnostics;
mod host;
mod status;
mod ws;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelEvent, ChannelSelector, Connector, EventSender};
pub use client::{TransportClient, TransportClientBuilder};
pub use config::ClientConfig;
pub use diagnostics::{DiagnosticEntry, DiagnosticLog};
pub use host::{FrameCallback, HostConnector, HostSocketApi};
pub use status::ClientStatus;
pub use ws::{WebSocketChannel, WebSocketConnector};
