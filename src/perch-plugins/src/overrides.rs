//! Plugin overrides: optional replacements for engine-provided behavior.
//!
//! A plugin may run code when it is activated or deactivated and may take
//! over the way its settings are described, loaded and saved.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::plugin::PluginInfo;
use crate::settings::SettingsShape;

/// Runs with the plugin record on activation / deactivation.
pub type LifecycleFn = Arc<dyn Fn(&PluginInfo) -> Result<()> + Send + Sync>;
/// Produces a JSON value (settings schema, stored settings).
pub type ValueFn = Arc<dyn Fn() -> Result<Value> + Send + Sync>;
/// Produces the settings model.
pub type ModelFn = Arc<dyn Fn() -> Result<SettingsShape> + Send + Sync>;
/// Persists settings and returns what was stored.
pub type SaveFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Override names recognized by the engine.
pub const OVERRIDE_NAMES: [&str; 6] = [
    "activated",
    "deactivated",
    "settings_schema",
    "settings_model",
    "load_settings",
    "save_settings",
];

/// A single override declared by a plugin.
#[derive(Clone)]
pub enum PluginOverride {
    Activated(LifecycleFn),
    Deactivated(LifecycleFn),
    SettingsSchema(ValueFn),
    SettingsModel(ModelFn),
    LoadSettings(ValueFn),
    SaveSettings(SaveFn),
}

impl PluginOverride {
    pub fn activated<F>(f: F) -> Self
    where
        F: Fn(&PluginInfo) -> Result<()> + Send + Sync + 'static,
    {
        Self::Activated(Arc::new(f))
    }

    pub fn deactivated<F>(f: F) -> Self
    where
        F: Fn(&PluginInfo) -> Result<()> + Send + Sync + 'static,
    {
        Self::Deactivated(Arc::new(f))
    }

    pub fn settings_schema<F>(f: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self::SettingsSchema(Arc::new(f))
    }

    pub fn settings_model<F>(f: F) -> Self
    where
        F: Fn() -> Result<SettingsShape> + Send + Sync + 'static,
    {
        Self::SettingsModel(Arc::new(f))
    }

    pub fn load_settings<F>(f: F) -> Self
    where
        F: Fn() -> Result<Value> + Send + Sync + 'static,
    {
        Self::LoadSettings(Arc::new(f))
    }

    pub fn save_settings<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self::SaveSettings(Arc::new(f))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Activated(_) => "activated",
            Self::Deactivated(_) => "deactivated",
            Self::SettingsSchema(_) => "settings_schema",
            Self::SettingsModel(_) => "settings_model",
            Self::LoadSettings(_) => "load_settings",
            Self::SaveSettings(_) => "save_settings",
        }
    }
}

impl fmt::Debug for PluginOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginOverride({})", self.name())
    }
}

/// Overrides of one plugin, at most one per name.
///
/// When several units declare the same override, the last one registered wins.
#[derive(Clone, Default)]
pub struct PluginOverrides {
    pub activated: Option<LifecycleFn>,
    pub deactivated: Option<LifecycleFn>,
    pub settings_schema: Option<ValueFn>,
    pub settings_model: Option<ModelFn>,
    pub load_settings: Option<ValueFn>,
    pub save_settings: Option<SaveFn>,
}

impl PluginOverrides {
    pub fn set(&mut self, item: PluginOverride) {
        match item {
            PluginOverride::Activated(f) => self.activated = Some(f),
            PluginOverride::Deactivated(f) => self.deactivated = Some(f),
            PluginOverride::SettingsSchema(f) => self.settings_schema = Some(f),
            PluginOverride::SettingsModel(f) => self.settings_model = Some(f),
            PluginOverride::LoadSettings(f) => self.load_settings = Some(f),
            PluginOverride::SaveSettings(f) => self.save_settings = Some(f),
        }
    }

    /// Names of the overrides present.
    pub fn names(&self) -> Vec<&'static str> {
        let present = [
            self.activated.is_some(),
            self.deactivated.is_some(),
            self.settings_schema.is_some(),
            self.settings_model.is_some(),
            self.load_settings.is_some(),
            self.save_settings.is_some(),
        ];
        OVERRIDE_NAMES
            .iter()
            .zip(present)
            .filter_map(|(name, set)| set.then_some(*name))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }
}

impl fmt::Debug for PluginOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
