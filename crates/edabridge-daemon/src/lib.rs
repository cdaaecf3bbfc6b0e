//! Server half of the edabridge loopback bridge.
//!
//! [`TransportServer`] owns the listening socket and the single attached
//! peer; [`RpcCorrelator`] matches responses to outbound calls. The
//! `edabridge-daemon` binary wires these to configuration and the CLI.

pub mod config;
mod correlator;
mod netlist;
mod server;
mod status;

pub use config::{ConfigError, DaemonConfig, ServerConfig};
pub use correlator::{PendingCall, RpcCorrelator};
pub use netlist::fetch_netlist;
pub use server::{ServerError, TransportServer, TransportServerBuilder};
pub use status::ServerStatus;

use edabridge_core::{Router, methods};
use serde_json::json;

/// Requests the daemon answers when the peer calls it.
pub fn bridge_router() -> Router {
    Router::new()
        .route(methods::PING, |_| async {
            Ok(json!({"pong": true, "at": chrono::Utc::now()}))
        })
        .route(methods::GET_STATUS, |_| async {
            Ok(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }))
        })
}
