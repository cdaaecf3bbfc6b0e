//! WebSocket close codes with structured reasons.

use std::fmt;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Caller-initiated close.
    Normal,
    /// No hello arrived within the handshake window, or the peer never
    /// proved the server half is alive.
    HandshakeTimeout,
    /// The first frame was not a hello.
    InvalidHello,
    /// The channel could not be opened in time.
    ConnectTimeout,
    /// A newer peer completed its handshake and took over.
    Replaced,
}

impl CloseReason {
    pub const ALL: [CloseReason; 5] = [
        CloseReason::Normal,
        CloseReason::HandshakeTimeout,
        CloseReason::InvalidHello,
        CloseReason::ConnectTimeout,
        CloseReason::Replaced,
    ];

    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::HandshakeTimeout => 4000,
            CloseReason::InvalidHello => 4001,
            CloseReason::ConnectTimeout => 4002,
            CloseReason::Replaced => 4003,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::InvalidHello => "invalid hello",
            CloseReason::ConnectTimeout => "connect timeout",
            CloseReason::Replaced => "replaced by new connection",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.code() == code)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
