//! Plugin engine error types.

use thiserror::Error;

/// Plugin engine errors.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Plugin not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Plugin already exists.
    #[error("Plugin already exists: {0}")]
    AlreadyExists(String),

    /// No active plugin provides the tool.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Core plugins can be deactivated but never removed.
    #[error("Plugin '{0}' is a core plugin and cannot be uninstalled")]
    CoreProtected(String),

    /// Requirement provisioning failed.
    #[error("Failed to install dependencies for plugin '{plugin}': {message}")]
    DependencyInstall { plugin: String, message: String },

    /// Plugin load error.
    #[error("Failed to load plugin '{plugin}': {message}")]
    LoadError { plugin: String, message: String },

    /// A hook raised an error or panicked.
    #[error("Hook '{hook}' from plugin '{plugin}' failed: {message}")]
    HookExecution {
        plugin: String,
        hook: String,
        message: String,
    },

    /// Tool, endpoint or override execution error.
    #[error("Plugin execution error in '{plugin}': {message}")]
    ExecutionError { plugin: String, message: String },

    /// Settings rejected by the plugin settings model.
    #[error("Invalid settings for plugin '{plugin}': {message}")]
    SettingsValidation { plugin: String, message: String },

    /// Invalid plugin manifest.
    #[error("Invalid manifest for plugin '{plugin}': {message}")]
    InvalidManifest { plugin: String, message: String },

    /// Archive extraction error.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Remote plugin registry error.
    #[error("Marketplace error: {0}")]
    Marketplace(String),

    /// WASM runtime error.
    #[error("WASM runtime error: {0}")]
    WasmError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl PluginError {
    /// Create a load error.
    pub fn load_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a dependency installation error.
    pub fn dependency_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DependencyInstall {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a hook execution error.
    pub fn hook_error(
        plugin: impl Into<String>,
        hook: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HookExecution {
            plugin: plugin.into(),
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutionError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a settings validation error.
    pub fn settings_validation(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SettingsValidation {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create an invalid manifest error.
    pub fn invalid_manifest(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Id of the plugin this error is attributed to, if any.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::NotFound(id) | Self::AlreadyExists(id) | Self::CoreProtected(id) => Some(id),
            Self::DependencyInstall { plugin, .. }
            | Self::LoadError { plugin, .. }
            | Self::HookExecution { plugin, .. }
            | Self::ExecutionError { plugin, .. }
            | Self::SettingsValidation { plugin, .. }
            | Self::InvalidManifest { plugin, .. } => Some(plugin),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for PluginError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<wasmtime::Error> for PluginError {
    fn from(err: wasmtime::Error) -> Self {
        Self::WasmError(err.to_string())
    }
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        Self::Marketplace(err.to_string())
    }
}

impl From<zip::result::ZipError> for PluginError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;
