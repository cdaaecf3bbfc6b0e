//! Netlist normalization.
//!
//! Folds several legacy text dialects and one structured JSON dialect into a
//! single [`NetlistGraph`]. Net names and endpoints are de-duplicated on their
//! upper-cased form; the first spelling seen is kept for display.

mod graph;
mod structured;
mod text;

pub use graph::{Component, Dialect, Endpoint, NetlistGraph, ParseWarning, ParsedNetlist, Pin};
pub use structured::NetlistGraphParser;
pub use text::{NetlistTextParser, detect_dialect};

use serde_json::Value;

/// Parse any supported dialect: structured JSON first, text as fallback.
pub fn parse_any(input: &str) -> ParsedNetlist {
    if let Some(parsed) = NetlistGraphParser::new().parse(input) {
        return parsed;
    }
    NetlistTextParser::new().parse(input)
}

/// Parse a netlist that arrived as a JSON value: either a string holding
/// either dialect, or an already decoded structured document.
pub fn parse_value(value: &Value) -> ParsedNetlist {
    match value {
        Value::String(text) => parse_any(text),
        other => NetlistGraphParser::new()
            .parse_value(other)
            .unwrap_or_else(|| NetlistTextParser::new().parse("")),
    }
}
