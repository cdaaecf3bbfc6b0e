//! Netlist retrieval from the attached peer.

use crate::server::TransportServer;
use edabridge_core::{RpcError, methods};
use edabridge_netlist::ParsedNetlist;
use serde_json::Value;
use std::time::Duration;

/// Keys a peer may wrap the netlist payload in.
const PAYLOAD_KEYS: [&str; 3] = ["netlist", "content", "data"];

/// Ask the peer for the schematic netlist and normalize it.
///
/// The peer may answer with netlist text (either dialect) or with the
/// structured document already decoded.
pub async fn fetch_netlist(
    server: &TransportServer,
    timeout: Option<Duration>,
) -> Result<ParsedNetlist, RpcError> {
    let result = server
        .call(methods::SCHEMATIC_GET_NETLIST, None, timeout)
        .await?;
    let payload = unwrap_payload(&result);
    let parsed = edabridge_netlist::parse_value(payload);
    for warning in &parsed.warnings {
        tracing::warn!("{}", warning);
    }
    tracing::info!(
        "Fetched {:?} netlist: {} component(s), {} net(s)",
        parsed.dialect,
        parsed.graph.components.len(),
        parsed.graph.nets.len()
    );
    Ok(parsed)
}

fn unwrap_payload(result: &Value) -> &Value {
    match result.as_object() {
        Some(object) if !object.contains_key("components") => PAYLOAD_KEYS
            .iter()
            .find_map(|k| object.get(*k))
            .unwrap_or(result),
        _ => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_unwrapping() {
        let text = json!("*NET* A\nR1.1\n");
        assert_eq!(unwrap_payload(&text), &text);

        let wrapped = json!({"netlist": "*NET* A\nR1.1\n"});
        assert_eq!(unwrap_payload(&wrapped), &text);

        let structured = json!({"components": {}, "netlist": "ignored"});
        assert_eq!(unwrap_payload(&structured), &structured);
    }
}
