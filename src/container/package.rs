//! Package manifests

use crate::container::runtime::{RuntimeFormatError, RuntimeVersion, PORTABLE};
use crate::remoting::PluginStrongName;
use serde::{Deserialize, Serialize};

/// One plugin shipped in a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginComponent {
    pub plugin_id: PluginStrongName,
    /// Runtime family the plugin was built for; absent means portable.
    #[serde(default)]
    pub runtime_type: Option<String>,
    #[serde(default)]
    pub runtime_version: Option<String>,
}

/// A package groups plugins that share one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<PluginComponent>,
}

impl PackageManifest {
    pub fn new(name: impl Into<String>, plugins: Vec<PluginComponent>) -> Self {
        Self { name: name.into(), plugins }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn plugin_ids(&self) -> impl Iterator<Item = &PluginStrongName> {
        self.plugins.iter().map(|p| &p.plugin_id)
    }

    pub fn contains(&self, plugin_id: &PluginStrongName) -> bool {
        self.plugin_ids().any(|p| p == plugin_id)
    }

    /// First non-portable family named by a component, else portable.
    pub fn requested_runtime(&self) -> String {
        self.plugins
            .iter()
            .filter_map(|p| p.runtime_type.as_deref())
            .find(|t| !t.eq_ignore_ascii_case(PORTABLE))
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| PORTABLE.to_string())
    }

    /// Highest minimum version any component asks for.
    pub fn min_runtime_version(&self) -> Result<Option<RuntimeVersion>, RuntimeFormatError> {
        let mut highest: Option<RuntimeVersion> = None;
        for version in self.plugins.iter().filter_map(|p| p.runtime_version.as_deref()) {
            let version: RuntimeVersion = version.parse()?;
            if highest.as_ref().map_or(true, |h| version > *h) {
                highest = Some(version);
            }
        }
        Ok(highest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // TEST160: Manifest JSON with optional runtime fields
    #[test]
    fn test_from_json() {
        let manifest = PackageManifest::from_json(
            r#"{
                "name": "weather",
                "plugins": [
                    {"plugin_id": {"plugin_id": "forecast", "major_version": 1, "minor_version": 2}},
                    {"plugin_id": {"plugin_id": "radar", "major_version": 2, "minor_version": 0},
                     "runtime_type": "Native", "runtime_version": "1.4"},
                    {"plugin_id": {"plugin_id": "alerts", "major_version": 1, "minor_version": 0},
                     "runtime_type": "portable", "runtime_version": "1.10"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.plugins.len(), 3);
        assert!(manifest.contains(&PluginStrongName::new("radar", 2, 0)));
        assert_eq!(manifest.requested_runtime(), "native");
        assert_eq!(manifest.min_runtime_version().unwrap().unwrap().to_string(), "1.10");
    }

    // TEST161: No runtime hints means portable with no minimum
    #[test]
    fn test_portable_default() {
        let manifest = PackageManifest::new(
            "plain",
            vec![PluginComponent { plugin_id: PluginStrongName::new("p", 1, 0), runtime_type: None, runtime_version: None }],
        );
        assert_eq!(manifest.requested_runtime(), PORTABLE);
        assert!(manifest.min_runtime_version().unwrap().is_none());
    }

    // TEST162: A bad version string is a format error
    #[test]
    fn test_bad_version() {
        let manifest = PackageManifest::new(
            "bad",
            vec![PluginComponent {
                plugin_id: PluginStrongName::new("p", 1, 0),
                runtime_type: None,
                runtime_version: Some("one.two".into()),
            }],
        );
        assert!(manifest.min_runtime_version().is_err());
    }
}
