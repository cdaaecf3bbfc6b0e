//! Peer application identity.
//!
//! Carried by the `hello` message. Every field is optional: the host may
//! not expose its own version, and an empty identity is still a valid hello.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The application a peer declares itself to be.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Version of the host EDA application the peer runs inside.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eda_version: Option<String>,
}

impl AppInfo {
    /// Create an identity with a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: Some(version.into()),
            eda_version: None,
        }
    }

    /// Attach the host application version.
    pub fn with_eda_version(mut self, eda_version: impl Into<String>) -> Self {
        self.eda_version = Some(eda_version.into());
        self
    }

    /// True if the peer declared nothing about itself.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_none() && self.version.is_none() && self.eda_version.is_none()
    }
}

impl fmt::Display for AppInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("unknown"))?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        if let Some(eda) = &self.eda_version {
            write!(f, " (EDA {eda})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_full() {
        let app = AppInfo::new("bridge-ext", "1.2.0").with_eda_version("2.2.40");
        assert_eq!(app.to_string(), "bridge-ext 1.2.0 (EDA 2.2.40)");
    }

    #[test]
    fn display_anonymous() {
        let app = AppInfo::default();
        assert!(app.is_anonymous());
        assert_eq!(app.to_string(), "unknown");
    }

    #[test]
    fn camel_case_on_the_wire() {
        let app = AppInfo::new("x", "1").with_eda_version("3");
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json["edaVersion"], "3");
        assert!(json.get("eda_version").is_none());
    }
}
