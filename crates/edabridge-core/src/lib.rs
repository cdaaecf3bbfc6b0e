//! Core types for edabridge.
//!
//! This crate provides the protocol primitives shared by the loopback server
//! and the peer embedded in the host application: the message envelope, peer
//! identity, close reasons, the error taxonomy and request dispatch.

mod app;
mod close;
pub mod error;
pub mod handler;
mod message;
mod snapshot;

pub use app::AppInfo;
pub use close::CloseReason;
pub use error::{ProtocolError, RemoteError, RpcError, TransportError};
pub use handler::{HandlerError, RequestHandler, Router};
pub use message::{ErrorBody, Message};
pub use snapshot::SnapshotWriter;

/// Default loopback port the server listens on.
pub const DEFAULT_PORT: u16 = 9050;

/// Well-known error codes carried in error responses.
pub mod codes {
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const TIMEOUT: &str = "TIMEOUT";
}

/// Methods the server routes to the peer.
pub mod methods {
    pub const PING: &str = "ping";
    pub const GET_STATUS: &str = "getStatus";
    pub const BRIDGE_DISCONNECT: &str = "bridge.disconnect";
    pub const SHOW_MESSAGE: &str = "showMessage";
    pub const SCHEMATIC_GET_NETLIST: &str = "schematic.getNetlist";
    pub const SCHEMATIC_EXPORT_ENET_FILE: &str = "schematic.exportEnetFile";
    pub const LIBRARY_SEARCH_DEVICES: &str = "library.searchDevices";
    pub const LIBRARY_GET_DEVICE: &str = "library.getDevice";
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel open.
    #[default]
    Disconnected,
    /// Channel open, waiting for proof the other half is alive.
    Connecting,
    /// Protocol traffic observed.
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
