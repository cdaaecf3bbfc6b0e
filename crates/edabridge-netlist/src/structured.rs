//! Structured (JSON) netlist dialect.
//!
//! ```json
//! { "components": {
//!     "<key>": {
//!       "props": { "Designator": "R1", "Value": "10k", ... },
//!       "pinInfoMap": { "1": { "number": "1", "name": "A", "net": "GND" } }
//!     } },
//!   "nets": ["GND", "NC_1"] }
//! ```
//!
//! The optional `nets` list declares nets that may have no pins.

use crate::graph::{Component, Dialect, GraphBuilder, ParsedNetlist, Pin};
use serde_json::{Map, Value};

const PROPS_KEYS: [&str; 3] = ["props", "properties", "attributes"];
const PINS_KEYS: [&str; 2] = ["pinInfoMap", "pins"];
const DESIGNATOR_KEYS: [&str; 6] = [
    "Designator",
    "designator",
    "Reference",
    "reference",
    "Ref",
    "ref",
];
const VALUE_KEYS: [&str; 2] = ["Value", "value"];
const FOOTPRINT_KEYS: [&str; 3] = ["Footprint", "footprint", "Package"];

/// Parser for the JSON dialect carrying per-component metadata.
#[derive(Debug, Default)]
pub struct NetlistGraphParser;

impl NetlistGraphParser {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` when the text is not this dialect, so the caller can
    /// fall back to the text parser.
    pub fn parse(&self, text: &str) -> Option<ParsedNetlist> {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        self.parse_value(&value)
    }

    /// Same as [`parse`](Self::parse) for an already decoded document.
    pub fn parse_value(&self, value: &Value) -> Option<ParsedNetlist> {
        let components = value.as_object()?.get("components")?.as_object()?;

        let mut builder = GraphBuilder::new();
        let declared = value.get("nets").and_then(Value::as_array);
        for name in declared.into_iter().flatten().filter_map(scalar_string) {
            builder.open_net(&name);
        }
        for (key, record) in components {
            let Some(record) = record.as_object() else {
                tracing::debug!("Skipping non-object component record {}", key);
                continue;
            };
            add_component(&mut builder, key, record);
        }
        Some(builder.finish(Dialect::Structured))
    }
}

fn first_object<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|k| record.get(*k).and_then(Value::as_object))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn take_first(props: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = props.remove(*key)
            && found.is_none()
        {
            found = scalar_string(&value);
        }
    }
    found
}

fn is_manufacturer_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.contains("manufacturer")
        || lower.contains("supplier")
        || lower == "mpn"
        || lower == "lcsc"
        || lower == "lcsc part"
}

fn add_component(builder: &mut GraphBuilder, key: &str, record: &Map<String, Value>) {
    let mut props = first_object(record, &PROPS_KEYS).cloned().unwrap_or_default();
    let reference = take_first(&mut props, &DESIGNATOR_KEYS).unwrap_or_else(|| format!("?{key}"));
    let value = take_first(&mut props, &VALUE_KEYS);
    let footprint = take_first(&mut props, &FOOTPRINT_KEYS);

    let mut component = Component::new(reference.clone());
    component.value = value;
    component.footprint = footprint;

    let manufacturer: Vec<String> = props
        .keys()
        .filter(|k| is_manufacturer_key(k))
        .cloned()
        .collect();
    for k in manufacturer {
        if let Some(v) = props.remove(&k).as_ref().and_then(scalar_string) {
            component.manufacturer_fields.insert(k, v);
        }
    }
    component.properties = props;

    let pins = first_object(record, &PINS_KEYS);
    let mut endpoints = Vec::new();
    for (pin_key, info) in pins.into_iter().flatten() {
        let info = info.as_object();
        let field = |name: &str| info.and_then(|i| i.get(name)).and_then(scalar_string);
        let number = field("number").unwrap_or_else(|| pin_key.clone());
        let net = field("net");
        if let Some(net) = &net {
            endpoints.push((net.clone(), number.clone()));
        }
        component.pins.push(Pin {
            number,
            name: field("name"),
            net,
        });
    }

    let existing = builder.component_mut(&reference);
    if existing.pins.is_empty() && existing.properties.is_empty() {
        *existing = component;
    } else {
        tracing::debug!("Duplicate designator {} in structured netlist", reference);
        existing.pins.extend(component.pins);
    }

    for (net, pin) in endpoints {
        let idx = builder.open_net(&net);
        builder.add_endpoint(idx, &reference, &pin);
    }
}
