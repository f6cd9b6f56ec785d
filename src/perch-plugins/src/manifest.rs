//! Plugin manifest definitions.
//!
//! The manifest file (`plugin.toml`) carries the metadata of a plugin, the
//! shape of its settings and, for WASM plugins, the declarations binding
//! exported functions to hooks, tools, forms, endpoints and overrides.
//!
//! A missing or broken manifest never prevents a plugin from loading: the
//! loader falls back to generated defaults. The plugin id always comes from
//! the folder name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::settings::SettingsShape;
use crate::{PluginError, Result};

/// Plugin manifest - the main metadata file of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin metadata
    #[serde(default)]
    pub plugin: PluginMetadata,

    /// Settings model
    #[serde(default)]
    pub settings: SettingsShape,

    /// Exported functions of WASM code units
    #[serde(default)]
    pub exports: Vec<ExportManifest>,

    /// Runtime-only information (active flag, available upgrade, ...)
    #[serde(default, skip_deserializing)]
    pub local_info: HashMap<String, serde_json::Value>,
}

impl PluginManifest {
    /// Generated manifest for a plugin without (usable) metadata.
    pub fn with_defaults(id: impl Into<String>) -> Self {
        Self {
            plugin: PluginMetadata {
                id: id.into(),
                ..Default::default()
            },
            settings: SettingsShape::empty(),
            exports: Vec::new(),
            local_info: HashMap::new(),
        }
    }

    /// Parse manifest from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            PluginError::invalid_manifest("unknown", format!("Failed to parse TOML: {}", e))
        })
    }

    /// Load the manifest of the plugin folder `plugin_dir`.
    ///
    /// Absent or unparseable files yield defaults; the id is always the
    /// folder name.
    pub async fn load(plugin_dir: &Path) -> Self {
        let id = plugin_id_from_path(plugin_dir);
        let manifest_path = plugin_dir.join(crate::MANIFEST_FILE);

        let mut manifest = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => match Self::parse(&content) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::error!(
                        "Loading plugin {} metadata, defaulting to generated values: {}",
                        plugin_dir.display(),
                        e
                    );
                    Self::with_defaults(&id)
                }
            },
            Err(_) => {
                tracing::debug!("Plugin {} has no manifest, using defaults", id);
                Self::with_defaults(&id)
            }
        };

        manifest.plugin.id = id;
        manifest
    }

    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.plugin.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    /// Check the host version against the declared compatibility range.
    pub fn check_compatibility(&self, host_version: &str) -> Compatibility {
        let Ok(host) = semver::Version::parse(host_version) else {
            return Compatibility::Unknown;
        };

        if let Some(min) = self.plugin.min_host_version.as_deref() {
            match semver::Version::parse(min) {
                Ok(min_version) if host < min_version => {
                    return Compatibility::TooOld {
                        min: min.to_string(),
                    };
                }
                Ok(_) => {}
                Err(_) => return Compatibility::Unknown,
            }
        }

        if let Some(max) = self.plugin.max_host_version.as_deref() {
            match semver::Version::parse(max) {
                Ok(max_version) if host > max_version => {
                    return Compatibility::TooNew {
                        max: max.to_string(),
                    };
                }
                Ok(_) => {}
                Err(_) => return Compatibility::Unknown,
            }
        }

        Compatibility::Compatible
    }
}

/// Derive a plugin id from its folder path.
pub fn plugin_id_from_path(path: &Path) -> String {
    path.components()
        .next_back()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Plugin metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Plugin ID (always replaced by the folder name)
    #[serde(default)]
    pub id: String,

    /// Display name
    #[serde(default = "default_unknown")]
    pub name: String,

    /// Plugin version
    #[serde(default = "default_version")]
    pub version: String,

    /// Plugin description
    #[serde(default = "default_description")]
    pub description: String,

    /// Author name
    #[serde(default = "default_unknown")]
    pub author_name: String,

    /// Author URL
    #[serde(default = "default_unknown")]
    pub author_url: String,

    /// Plugin homepage / repository URL
    #[serde(default = "default_unknown")]
    pub plugin_url: String,

    /// Thumbnail URL
    #[serde(default)]
    pub thumb: Option<String>,

    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Minimum compatible host version
    #[serde(default)]
    pub min_host_version: Option<String>,

    /// Maximum compatible host version
    #[serde(default)]
    pub max_host_version: Option<String>,
}

impl Default for PluginMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_unknown(),
            version: default_version(),
            description: default_description(),
            author_name: default_unknown(),
            author_url: default_unknown(),
            plugin_url: default_unknown(),
            thumb: None,
            tags: Vec::new(),
            min_host_version: None,
            max_host_version: None,
        }
    }
}

fn default_unknown() -> String {
    "Unknown".to_string()
}

fn default_version() -> String {
    "0.0.0".to_string()
}

fn default_description() -> String {
    "Description not found for this plugin. Please create a plugin.toml manifest in the plugin folder."
        .to_string()
}

/// Declaration binding a WASM export to a plugin artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Artifact kind (`hook`, `tool`, `form`, `endpoint`, `override`)
    pub kind: String,

    /// Exported function to call
    pub function: String,

    /// Artifact name (defaults to the function name)
    #[serde(default)]
    pub name: Option<String>,

    /// Code unit path stem, relative to the plugin folder (defaults to `plugin`)
    #[serde(default)]
    pub module: Option<String>,

    /// Hook priority (higher runs first)
    #[serde(default)]
    pub priority: Option<i32>,

    /// Tool / form description
    #[serde(default)]
    pub description: String,

    /// Tool output goes straight to the user
    #[serde(default)]
    pub return_direct: bool,

    /// Tool / form trigger examples
    #[serde(default)]
    pub examples: Vec<String>,

    /// Endpoint path
    #[serde(default)]
    pub path: Option<String>,

    /// Endpoint prefix
    #[serde(default)]
    pub prefix: Option<String>,

    /// Endpoint HTTP methods
    #[serde(default)]
    pub methods: Vec<String>,

    /// Endpoint tags
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ExportManifest {
    /// Artifact name.
    pub fn artifact_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.function)
    }

    /// Code unit this export belongs to.
    pub fn module_name(&self) -> &str {
        self.module.as_deref().unwrap_or(crate::MAIN_UNIT)
    }
}

/// Result of a host compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Compatibility {
    Compatible,
    TooOld { min: String },
    TooNew { max: String },
    Unknown,
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        !matches!(self, Self::TooOld { .. } | Self::TooNew { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const EXAMPLE_MANIFEST: &str = r#"
[plugin]
id = "ignored"
name = "Weather"
version = "1.2.0"
plugin_url = "https://github.com/acme/weather"
tags = ["weather", "tools"]
min_host_version = "0.1.0"

[settings]
city = { description = "Default city", type = "string", default = "Rome" }
units = { type = "string", required = true, validation = { enum_values = ["metric", "imperial"] } }

[[exports]]
kind = "hook"
name = "before_reply"
function = "add_forecast"
priority = 5

[[exports]]
kind = "endpoint"
function = "forecast"
path = "/forecast"
methods = ["GET"]
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::parse(EXAMPLE_MANIFEST).unwrap();

        assert_eq!(manifest.name(), "Weather");
        assert_eq!(manifest.plugin.version, "1.2.0");
        assert_eq!(manifest.plugin.author_name, "Unknown");
        assert_eq!(manifest.settings.fields().count(), 2);
        assert_eq!(manifest.exports.len(), 2);
        assert_eq!(manifest.exports[0].artifact_name(), "before_reply");
        assert_eq!(manifest.exports[1].artifact_name(), "forecast");
        assert_eq!(manifest.exports[1].module_name(), "plugin");
    }

    #[tokio::test]
    async fn test_load_uses_folder_name_as_id() {
        let dir = TempDir::new().unwrap();
        let plugin_dir = dir.path().join("weather");
        std::fs::create_dir(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("plugin.toml"), EXAMPLE_MANIFEST).unwrap();

        let manifest = PluginManifest::load(&plugin_dir).await;
        assert_eq!(manifest.id(), "weather");
        assert_eq!(manifest.name(), "Weather");
    }

    #[tokio::test]
    async fn test_load_defaults_when_missing_or_broken() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("bare");
        std::fs::create_dir(&missing).unwrap();

        let manifest = PluginManifest::load(&missing).await;
        assert_eq!(manifest.id(), "bare");
        assert_eq!(manifest.name(), "Unknown");
        assert_eq!(manifest.plugin.version, "0.0.0");

        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).unwrap();
        std::fs::write(broken.join("plugin.toml"), "[plugin\nname = ").unwrap();

        let manifest = PluginManifest::load(&broken).await;
        assert_eq!(manifest.id(), "broken");
        assert_eq!(manifest.name(), "Unknown");
    }

    #[test]
    fn test_local_info_is_not_read_from_file() {
        let manifest = PluginManifest::parse(
            r#"
[plugin]
name = "x"

[local_info]
active = true
"#,
        )
        .unwrap();
        assert!(manifest.local_info.is_empty());
    }

    #[test]
    fn test_compatibility() {
        let mut manifest = PluginManifest::with_defaults("p");
        assert_eq!(manifest.check_compatibility("1.0.0"), Compatibility::Compatible);

        manifest.plugin.min_host_version = Some("2.0.0".into());
        assert!(!manifest.check_compatibility("1.5.0").is_compatible());

        manifest.plugin.min_host_version = None;
        manifest.plugin.max_host_version = Some("1.0.0".into());
        assert_eq!(
            manifest.check_compatibility("1.0.1"),
            Compatibility::TooNew {
                max: "1.0.0".into()
            }
        );

        manifest.plugin.max_host_version = Some("latest".into());
        assert_eq!(manifest.check_compatibility("1.0.0"), Compatibility::Unknown);
    }
}
