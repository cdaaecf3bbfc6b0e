//! Line-oriented netlist dialects.
//!
//! Detection only picks a label; the line rules are applied uniformly so a
//! mislabeled or unlabeled input still yields whatever nets it contains.
//! Parsing keeps a cursor on the currently open net. A net opens on a
//! declaration line and closes on an end marker or the next declaration.

use crate::graph::{Dialect, GraphBuilder, ParsedNetlist};
use regex::Regex;
use std::sync::LazyLock;

/// Lines scanned for dialect fingerprints.
const DETECT_LINES: usize = 400;

static SEXPR_NET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\(net\s+\(code\s+"?[^")]*"?\)\s*\(name\s+(?:"((?:[^"\\]|\\.)*)"|([^)\s]+))\)"#)
        .expect("valid regex")
});
static SEXPR_NODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\(node\s+\(ref\s+"?([^")\s]+)"?\)\s*\(pin\s+"?([^")\s]+)"?\)"#).expect("valid regex")
});
static SEXPR_COMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\(comp\s+\(ref\s+"?([^")\s]+)"?\)"#).expect("valid regex"));
static SEXPR_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\((value|footprint)\s+(?:"((?:[^"\\]|\\.)*)"|([^)\s]+))\)"#).expect("valid regex")
});
static PLAIN_NET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^net(?:\s*:\s*|\s+)["']?([^"'\s]+)["']?"#).expect("valid regex")
});
static PLAIN_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:end|endnet|end\s+net)$").expect("valid regex"));
static INLINE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9_+/#-]*)\.([A-Za-z0-9_+/#-]+)$").expect("valid regex")
});
static DASH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_]*)-([A-Za-z0-9_+]+)$").expect("valid regex"));
static REF_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_+/#-]*$").expect("valid regex"));
static PIN_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_+/#-]+$").expect("valid regex"));

/// Guess the dialect from a bounded prefix of the input.
pub fn detect_dialect(text: &str) -> Dialect {
    let mut sexpr_net = false;
    let mut sexpr_node = false;
    let mut pads = false;
    let mut protel = false;
    let mut plain = false;

    for line in text.lines().take(DETECT_LINES) {
        let line = line.trim();
        if line.starts_with("(net ") {
            sexpr_net = true;
        }
        if line.contains("(node ") {
            sexpr_node = true;
        }
        if line.starts_with("*PADS") || line.starts_with("*NET*") || line.starts_with("*SIGNAL*") {
            pads = true;
        }
        if line == "[" || line == "(" {
            protel = true;
        }
        if PLAIN_NET.is_match(line) {
            plain = true;
        }
    }

    if sexpr_net && sexpr_node {
        Dialect::KicadSexpr
    } else if pads {
        Dialect::Pads
    } else if protel {
        Dialect::Protel
    } else if plain {
        Dialect::Plain
    } else {
        Dialect::Unknown
    }
}

/// Heuristic parser for the line-oriented dialects.
#[derive(Debug, Default)]
pub struct NetlistTextParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PadsSection {
    None,
    Parts,
    Nets,
}

struct Cursor {
    dialect: Dialect,
    builder: GraphBuilder,
    net: Option<usize>,
    /// A Protel `(` was seen; the next line names the net.
    protel_name_pending: bool,
    /// Lines of an open Protel `[` component block.
    protel_component: Option<Vec<String>>,
    sexpr_component: Option<String>,
    pads_section: PadsSection,
}

impl NetlistTextParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse free text. Never fails: unrecognized input yields an empty graph
    /// plus warnings.
    pub fn parse(&self, text: &str) -> ParsedNetlist {
        let dialect = detect_dialect(text);
        let mut cursor = Cursor {
            dialect,
            builder: GraphBuilder::new(),
            net: None,
            protel_name_pending: false,
            protel_component: None,
            sexpr_component: None,
            pads_section: PadsSection::None,
        };

        for raw in text.lines() {
            cursor.line(raw.trim());
        }
        cursor.builder.finish(dialect)
    }
}

impl Cursor {
    fn line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }

        if let Some(block) = self.protel_component.as_mut() {
            if line == "]" {
                let block = self.protel_component.take().unwrap_or_default();
                self.finish_protel_component(block);
            } else {
                block.push(line.to_string());
            }
            return;
        }

        if self.protel_name_pending {
            self.protel_name_pending = false;
            self.net = Some(self.builder.open_net(line));
            return;
        }

        match line {
            "[" => {
                self.net = None;
                self.protel_component = Some(Vec::new());
                return;
            }
            "(" => {
                self.net = None;
                self.protel_name_pending = true;
                return;
            }
            ")" => {
                self.net = None;
                return;
            }
            _ => {}
        }

        if line.starts_with('(') {
            self.sexpr_line(line);
        } else if line.starts_with('*') {
            self.pads_marker(line);
        } else if let Some(caps) = PLAIN_NET.captures(line) {
            self.net = Some(self.builder.open_net(&caps[1]));
        } else if PLAIN_END.is_match(line) {
            self.net = None;
        } else if let Some(net) = self.net {
            self.endpoint_line(net, line);
        } else if self.pads_section == PadsSection::Parts {
            self.pads_part(line);
        }
    }

    fn sexpr_line(&mut self, line: &str) {
        if let Some(caps) = SEXPR_NET.captures(line) {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| unescape(m.as_str()))
                .unwrap_or_default();
            self.sexpr_component = None;
            self.net = Some(self.builder.open_net(&name));
        } else if let Some(caps) = SEXPR_COMP.captures(line) {
            self.net = None;
            let reference = caps[1].to_string();
            self.builder.component_mut(&reference);
            self.sexpr_component = Some(reference);
        } else if line.starts_with("(nets") {
            self.sexpr_component = None;
        } else if let (Some(reference), Some(caps)) =
            (self.sexpr_component.as_deref(), SEXPR_FIELD.captures(line))
        {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| unescape(m.as_str()));
            let component = self.builder.component_mut(reference);
            match &caps[1] {
                "value" => component.value = value,
                _ => component.footprint = value,
            }
        }

        if let Some(net) = self.net {
            for caps in SEXPR_NODE.captures_iter(line) {
                self.builder.add_endpoint(net, &caps[1], &caps[2]);
            }
        }
    }

    fn pads_marker(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        let marker = parts.next().unwrap_or_default().to_ascii_uppercase();
        let name = parts.next();
        self.net = None;
        match (marker.as_str(), name) {
            ("*NET*" | "*SIGNAL*", Some(name)) => {
                self.pads_section = PadsSection::Nets;
                self.net = Some(self.builder.open_net(name));
            }
            ("*NET*", None) => self.pads_section = PadsSection::Nets,
            ("*PART*", _) => self.pads_section = PadsSection::Parts,
            _ => self.pads_section = PadsSection::None,
        }
    }

    fn pads_part(&mut self, line: &str) {
        let mut tokens = line.split_whitespace();
        let (Some(reference), Some(decal)) = (tokens.next(), tokens.next()) else {
            return;
        };
        if !REF_TOKEN.is_match(reference) {
            return;
        }
        let component = self.builder.component_mut(reference);
        match decal.split_once('@') {
            Some((value, footprint)) => {
                component.value = Some(value.to_string());
                component.footprint = Some(footprint.to_string());
            }
            None => component.footprint = Some(decal.to_string()),
        }
    }

    fn endpoint_line(&mut self, net: usize, line: &str) {
        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();

        let mut found = false;
        for token in &tokens {
            if let Some(caps) = INLINE_TOKEN.captures(token) {
                self.builder.add_endpoint(net, &caps[1], &caps[2]);
                found = true;
            }
        }
        if found {
            return;
        }

        if self.dialect == Dialect::Protel {
            for token in &tokens {
                if let Some(caps) = DASH_TOKEN.captures(token) {
                    self.builder.add_endpoint(net, &caps[1], &caps[2]);
                    found = true;
                }
            }
            if found {
                return;
            }
        }

        if let [reference, pin] = tokens.as_slice()
            && REF_TOKEN.is_match(reference)
            && PIN_TOKEN.is_match(pin)
        {
            self.builder.add_endpoint(net, reference, pin);
        }
    }

    /// `[ REF / FOOTPRINT / VALUE ]`
    fn finish_protel_component(&mut self, block: Vec<String>) {
        let mut lines = block.into_iter();
        let Some(reference) = lines.next() else {
            return;
        };
        let footprint = lines.next();
        let value = lines.next();
        let component = self.builder.component_mut(&reference);
        component.footprint = footprint;
        component.value = value;
    }
}

fn unescape(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\\\", "\\")
}
