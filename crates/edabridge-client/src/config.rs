//! Client configuration.

use edabridge_core::{AppInfo, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the loopback server.
    pub url: String,
    /// Identity announced in the hello.
    pub app: AppInfo,
    /// Start the reconnect supervisor on spawn.
    pub auto_reconnect: bool,
    pub connect_timeout_ms: u64,
    /// How long a fresh channel may stay unconfirmed.
    pub handshake_timeout_ms: u64,
    /// Silence after which a connected channel is treated as dead.
    pub staleness_threshold_ms: u64,
    pub staleness_check_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_cap_ms: u64,
    /// Supervisor re-check cadence while connected.
    pub connected_recheck_ms: u64,
    /// Supervisor re-check cadence while a handshake is pending.
    pub connecting_recheck_ms: u64,
    pub diagnostics_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://127.0.0.1:{DEFAULT_PORT}"),
            app: AppInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            auto_reconnect: false,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 8_000,
            staleness_threshold_ms: 60_000,
            staleness_check_interval_ms: 5_000,
            reconnect_base_ms: 1_500,
            reconnect_factor: 1.6,
            reconnect_cap_ms: 30_000,
            connected_recheck_ms: 30_000,
            connecting_recheck_ms: 1_000,
            diagnostics_capacity: 200,
        }
    }
}

impl ClientConfig {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn staleness_check_interval(&self) -> Duration {
        Duration::from_millis(self.staleness_check_interval_ms.max(1))
    }

    pub fn connected_recheck(&self) -> Duration {
        Duration::from_millis(self.connected_recheck_ms)
    }

    pub fn connecting_recheck(&self) -> Duration {
        Duration::from_millis(self.connecting_recheck_ms)
    }
}
