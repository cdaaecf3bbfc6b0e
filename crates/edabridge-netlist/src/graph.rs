//! Canonical connectivity graph.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// A component pin attached to a net.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "ref")]
    pub reference: String,
    pub pin: String,
}

impl Endpoint {
    pub fn new(reference: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            pin: pin.into(),
        }
    }

    /// Case-folded `REF.PIN` identity used for de-duplication.
    pub fn key(&self) -> String {
        endpoint_key(&self.reference, &self.pin)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.reference, self.pin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footprint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub manufacturer_fields: BTreeMap<String, String>,
    /// Remaining property-bag entries, kept verbatim.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    pub pins: Vec<Pin>,
}

impl Component {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            value: None,
            footprint: None,
            manufacturer_fields: BTreeMap::new(),
            properties: Map::new(),
            pins: Vec::new(),
        }
    }

    pub fn pin(&self, number: &str) -> Option<&Pin> {
        self.pins
            .iter()
            .find(|p| p.number.eq_ignore_ascii_case(number))
    }
}

/// Components and the nets joining their pins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetlistGraph {
    pub components: Vec<Component>,
    /// Keyed by the first-seen spelling of each net name.
    pub nets: BTreeMap<String, Vec<Endpoint>>,
}

impl NetlistGraph {
    /// Look up a net ignoring case.
    pub fn net(&self, name: &str) -> Option<&[Endpoint]> {
        let key = name.to_uppercase();
        self.nets
            .iter()
            .find(|(n, _)| n.to_uppercase() == key)
            .map(|(_, eps)| eps.as_slice())
    }

    pub fn component(&self, reference: &str) -> Option<&Component> {
        let key = reference.to_uppercase();
        self.components
            .iter()
            .find(|c| c.reference.to_uppercase() == key)
    }

    pub fn endpoint_count(&self) -> usize {
        self.nets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// Net membership as case-folded sets, for comparing graphs that differ
    /// only in casing or ordering.
    pub fn membership(&self) -> BTreeMap<String, Vec<String>> {
        self.nets
            .iter()
            .map(|(name, eps)| {
                let mut keys: Vec<String> = eps.iter().map(Endpoint::key).collect();
                keys.sort();
                (name.to_uppercase(), keys)
            })
            .collect()
    }

    /// Serialize into the structured (JSON) dialect. A pin that sits on
    /// several nets gets one `pinInfoMap` entry per net (`"1"`, `"1#2"`, ...)
    /// and every net name is listed under `nets`, so parsing the result
    /// yields the same membership, empty nets included.
    pub fn to_structured_json(&self) -> Value {
        let mut components = Map::new();
        for component in &self.components {
            let mut props = component.properties.clone();
            props.insert("Designator".into(), json!(component.reference));
            if let Some(value) = &component.value {
                props.insert("Value".into(), json!(value));
            }
            if let Some(footprint) = &component.footprint {
                props.insert("Footprint".into(), json!(footprint));
            }
            for (key, value) in &component.manufacturer_fields {
                props.insert(key.clone(), json!(value));
            }

            let mut pins = Map::new();
            let mut repeats: HashMap<String, usize> = HashMap::new();
            for pin in &component.pins {
                let seen = repeats.entry(pin.number.to_uppercase()).or_default();
                *seen += 1;
                let key = match *seen {
                    1 => pin.number.clone(),
                    n => format!("{}#{}", pin.number, n),
                };
                let entry = json!({
                    "number": pin.number,
                    "name": pin.name.clone().unwrap_or_default(),
                    "net": pin.net.clone().unwrap_or_default(),
                });
                pins.insert(key, entry);
            }

            components.insert(
                component.reference.clone(),
                json!({ "props": props, "pinInfoMap": pins }),
            );
        }
        let nets: Vec<&String> = self.nets.keys().collect();
        json!({ "nets": nets, "components": components })
    }
}

/// Which input format a parse recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// JSON export with a `components` map.
    Structured,
    /// KiCad s-expression export.
    KicadSexpr,
    /// PADS ASCII netlist.
    Pads,
    /// Protel / Tango block netlist.
    Protel,
    /// Bare `NET <name>` blocks.
    Plain,
    Unknown,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Structured => "structured",
            Dialect::KicadSexpr => "kicad",
            Dialect::Pads => "pads",
            Dialect::Protel => "protel",
            Dialect::Plain => "plain",
            Dialect::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-fatal annotation on a parse result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseWarning {
    NoNets,
    NoEndpoints { nets: usize },
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseWarning::NoNets => {
                f.write_str("No nets parsed; input did not match a known netlist dialect")
            }
            ParseWarning::NoEndpoints { nets } => {
                write!(f, "Nets present but no endpoints parsed ({nets} nets)")
            }
        }
    }
}

/// Outcome of a parse: never an error, possibly empty, possibly annotated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedNetlist {
    pub dialect: Dialect,
    pub graph: NetlistGraph,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseWarning>,
}

pub(crate) fn endpoint_key(reference: &str, pin: &str) -> String {
    format!("{}.{}", reference.to_uppercase(), pin.to_uppercase())
}

struct NetEntry {
    name: String,
    endpoints: Vec<Endpoint>,
    seen: HashSet<String>,
}

/// Accumulates nets and components with case-insensitive de-duplication.
#[derive(Default)]
pub(crate) struct GraphBuilder {
    nets: Vec<NetEntry>,
    net_index: HashMap<String, usize>,
    components: Vec<Component>,
    component_index: HashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reopen) a net, returning its handle.
    pub fn open_net(&mut self, name: &str) -> usize {
        let key = name.to_uppercase();
        if let Some(&idx) = self.net_index.get(&key) {
            return idx;
        }
        let idx = self.nets.len();
        self.nets.push(NetEntry {
            name: name.to_string(),
            endpoints: Vec::new(),
            seen: HashSet::new(),
        });
        self.net_index.insert(key, idx);
        idx
    }

    /// Attach `reference.pin` to a net. Returns false for a duplicate.
    pub fn add_endpoint(&mut self, net: usize, reference: &str, pin: &str) -> bool {
        let key = endpoint_key(reference, pin);
        let entry = &mut self.nets[net];
        if !entry.seen.insert(key) {
            return false;
        }
        entry.endpoints.push(Endpoint::new(reference, pin));
        let net_name = entry.name.clone();

        // One pin record per net the pin joins.
        let component = self.component_mut(reference);
        let on_net = component.pins.iter().any(|p| {
            p.number.eq_ignore_ascii_case(pin)
                && p.net.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(&net_name))
        });
        if !on_net {
            let free = component
                .pins
                .iter_mut()
                .find(|p| p.number.eq_ignore_ascii_case(pin) && p.net.is_none());
            match free {
                Some(free) => free.net = Some(net_name),
                None => component.pins.push(Pin {
                    number: pin.to_string(),
                    name: None,
                    net: Some(net_name),
                }),
            }
        }
        true
    }

    /// Get or create a component by case-folded reference.
    pub fn component_mut(&mut self, reference: &str) -> &mut Component {
        let key = reference.to_uppercase();
        let idx = match self.component_index.get(&key) {
            Some(&idx) => idx,
            None => {
                self.components.push(Component::new(reference));
                let idx = self.components.len() - 1;
                self.component_index.insert(key, idx);
                idx
            }
        };
        &mut self.components[idx]
    }

    pub fn finish(self, dialect: Dialect) -> ParsedNetlist {
        let nets: BTreeMap<String, Vec<Endpoint>> = self
            .nets
            .into_iter()
            .map(|entry| (entry.name, entry.endpoints))
            .collect();
        let graph = NetlistGraph {
            components: self.components,
            nets,
        };

        let mut warnings = Vec::new();
        if graph.nets.is_empty() {
            warnings.push(ParseWarning::NoNets);
        } else if graph.endpoint_count() == 0 {
            warnings.push(ParseWarning::NoEndpoints {
                nets: graph.nets.len(),
            });
        }
        for warning in &warnings {
            tracing::debug!("Netlist parse ({}): {}", dialect, warning);
        }

        ParsedNetlist {
            dialect,
            graph,
            warnings,
        }
    }
}
