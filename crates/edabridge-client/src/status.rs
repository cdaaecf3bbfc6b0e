use chrono::{DateTime, Utc};
use edabridge_core::ConnectionState;
use serde::{Deserialize, Serialize};

/// Read-only projection of the client state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub url: String,
    /// Binding used by the current or last channel.
    pub transport: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_traffic_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub auto_reconnect: bool,
    pub next_reconnect_delay_ms: u64,
}
