//! Error taxonomy.
//!
//! Transport and RPC failures reject a single pending call. None of them is
//! fatal to the process.

use serde_json::Value;
use std::time::Duration;

/// Malformed or absent handshake. The offending socket is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid hello: {0}")]
    InvalidHello(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Channel-layer failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no peer connected")]
    NotConnected,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailure(String),
}

/// A failure reported by the peer in an error response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
    pub data: Option<Value>,
}

/// Why an outbound call did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{method} timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("connection lost before a response arrived")]
    Disconnected,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, RpcError::Transport(TransportError::NotConnected))
    }
}
