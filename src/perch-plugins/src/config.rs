//! Plugin engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{PluginError, Result};

/// Plugin engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Root folder holding one sub-folder per plugin
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: PathBuf,

    /// JSON file persisting the active plugin ids
    #[serde(default = "default_active_set_path")]
    pub active_set_path: PathBuf,

    /// Plugins active on a fresh install (when no active set is persisted yet)
    #[serde(default)]
    pub default_active: Vec<String>,

    /// Core plugins that can be deactivated but never uninstalled
    #[serde(default)]
    pub protected_plugins: Vec<String>,

    /// Host version used for manifest compatibility checks
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Route prefix for endpoints that do not declare one
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,

    /// Tags for endpoints that do not declare any
    #[serde(default = "default_endpoint_tags")]
    pub endpoint_tags: Vec<String>,

    /// External package manager invocation
    #[serde(default)]
    pub package_manager: PackageManagerConfig,

    /// WASM sandbox limits
    #[serde(default)]
    pub wasm: WasmLimits,

    /// Remote plugin registry base URL
    #[serde(default = "default_marketplace_url")]
    pub marketplace_url: String,

    /// Remote plugin registry request timeout (in seconds)
    #[serde(default = "default_marketplace_timeout_secs")]
    pub marketplace_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            active_set_path: default_active_set_path(),
            default_active: Vec::new(),
            protected_plugins: Vec::new(),
            host_version: default_host_version(),
            endpoint_prefix: default_endpoint_prefix(),
            endpoint_tags: default_endpoint_tags(),
            package_manager: PackageManagerConfig::default(),
            wasm: WasmLimits::default(),
            marketplace_url: default_marketplace_url(),
            marketplace_timeout_secs: default_marketplace_timeout_secs(),
        }
    }
}

impl PluginConfig {
    /// Create a configuration rooted at a plugins folder.
    ///
    /// The active set file is placed next to the plugins folder.
    pub fn with_plugins_dir(plugins_dir: impl Into<PathBuf>) -> Self {
        let plugins_dir = plugins_dir.into();
        let active_set_path = plugins_dir
            .parent()
            .map(|p| p.join("active_plugins.json"))
            .unwrap_or_else(|| PathBuf::from("active_plugins.json"));

        Self {
            plugins_dir,
            active_set_path,
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PluginError::ConfigError(format!("Failed to parse TOML: {}", e)))
    }

    /// Mark a plugin as protected (core).
    pub fn protect(mut self, plugin_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        if !self.protected_plugins.contains(&plugin_id) {
            self.protected_plugins.push(plugin_id);
        }
        self
    }

    /// Check if a plugin is protected against uninstall.
    pub fn is_protected(&self, plugin_id: &str) -> bool {
        self.protected_plugins.iter().any(|id| id == plugin_id)
    }

    /// Ids active when nothing has been persisted yet.
    ///
    /// Protected plugins are always part of the initial set.
    pub fn initial_active_set(&self) -> Vec<String> {
        let mut ids = self.protected_plugins.clone();
        for id in &self.default_active {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// Command lines used to query and modify the package environment.
///
/// Each command is an argv prefix; install and uninstall get the path of a
/// temporary requirements file appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageManagerConfig {
    /// Lists installed packages (freeze format)
    #[serde(default = "default_list_command")]
    pub list: Vec<String>,

    /// Installs packages from a requirements file
    #[serde(default = "default_install_command")]
    pub install: Vec<String>,

    /// Uninstalls packages listed in a requirements file
    #[serde(default = "default_uninstall_command")]
    pub uninstall: Vec<String>,

    /// Timeout for a single package manager invocation (in seconds)
    #[serde(default = "default_package_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PackageManagerConfig {
    fn default() -> Self {
        Self {
            list: default_list_command(),
            install: default_install_command(),
            uninstall: default_uninstall_command(),
            timeout_secs: default_package_timeout_secs(),
        }
    }
}

/// Resource limits applied to every WASM invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WasmLimits {
    /// Fuel granted per call
    #[serde(default = "default_fuel")]
    pub fuel: u64,

    /// Maximum linear memory per instance (in bytes)
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            fuel: default_fuel(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

fn default_plugins_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("perch").join("plugins"))
        .unwrap_or_else(|| PathBuf::from(".perch").join("plugins"))
}

fn default_active_set_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("perch").join("active_plugins.json"))
        .unwrap_or_else(|| PathBuf::from(".perch").join("active_plugins.json"))
}

fn default_host_version() -> String {
    crate::VERSION.to_string()
}

fn default_endpoint_prefix() -> String {
    "/custom".to_string()
}

fn default_endpoint_tags() -> Vec<String> {
    vec!["Custom Endpoints".to_string()]
}

fn default_marketplace_url() -> String {
    "https://registry.cheshirecat.ai".to_string()
}

fn default_marketplace_timeout_secs() -> u64 {
    30
}

fn default_list_command() -> Vec<String> {
    ["uv", "pip", "freeze"].map(String::from).to_vec()
}

fn default_install_command() -> Vec<String> {
    ["uv", "pip", "install", "--no-cache-dir", "-r"]
        .map(String::from)
        .to_vec()
}

fn default_uninstall_command() -> Vec<String> {
    ["uv", "pip", "uninstall", "-r"].map(String::from).to_vec()
}

fn default_package_timeout_secs() -> u64 {
    600 // 10 minutes
}

fn default_fuel() -> u64 {
    10_000_000
}

fn default_max_memory_bytes() -> usize {
    16 * 1024 * 1024 // 16 MB
}
