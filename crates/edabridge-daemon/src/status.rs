use chrono::{DateTime, Utc};
use edabridge_core::AppInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Read-only projection of the server's connection, for the CLI and UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub listening_port: u16,
    pub peer_attached: bool,
    pub peer_app: Option<AppInfo>,
    pub peer_addr: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_traffic_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pending_calls: usize,
}

impl ServerStatus {
    /// Read a snapshot persisted by a running daemon.
    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading status file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing status file {}", path.display()))
    }
}
