//! Plugin record: the in-memory state of one installed plugin.
//!
//! A record is created inactive from its folder and manifest. Activation
//! provisions dependencies, loads the code units and extracts their
//! artifacts; deactivation reverses all of it. Artifact lists are only ever
//! non-empty while the record is active.

use serde::Serialize;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::sync_scope_plugin;
use crate::dependencies::DependencyInstaller;
use crate::endpoints::{EndpointDecl, RouteMount};
use crate::error::panic_message;
use crate::extractor::ArtifactExtractor;
use crate::hooks::HookDecl;
use crate::manifest::PluginManifest;
use crate::overrides::PluginOverrides;
use crate::settings::{SettingsFile, SettingsShape};
use crate::tools::{FormDecl, ToolDecl};
use crate::units::{CodeUnit, UnitLoader};
use crate::{PluginError, Result};

/// Serializable view of a plugin record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub path: PathBuf,
    pub manifest: PluginManifest,
    pub active: bool,
}

/// Collaborators needed to activate a plugin.
pub struct ActivationEnv<'a> {
    pub installer: &'a DependencyInstaller,
    pub loader: &'a UnitLoader,
    pub endpoint_prefix: &'a str,
    pub endpoint_tags: &'a [String],
}

/// An installed plugin.
pub struct Plugin {
    id: String,
    path: PathBuf,
    manifest: PluginManifest,
    active: bool,
    units: Vec<Arc<dyn CodeUnit>>,
    hooks: Vec<HookDecl>,
    tools: Vec<ToolDecl>,
    forms: Vec<FormDecl>,
    endpoints: Vec<EndpointDecl>,
    overrides: PluginOverrides,
    settings_file: SettingsFile,
}

impl Plugin {
    /// Build an inactive record for the plugin folder at `path`.
    pub async fn load(path: PathBuf, host_version: &str) -> Result<Self> {
        if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(PluginError::load_error(
                crate::manifest::plugin_id_from_path(&path),
                format!("{} is not a plugin folder", path.display()),
            ));
        }

        let mut manifest = PluginManifest::load(&path).await;
        let compatibility = manifest.check_compatibility(host_version);
        if !compatibility.is_compatible() {
            tracing::warn!(
                "Plugin {} may not be compatible with host version {}: {:?}",
                manifest.id(),
                host_version,
                compatibility
            );
        }
        manifest.local_info.insert(
            "compatible".to_string(),
            serde_json::to_value(&compatibility)?,
        );
        manifest
            .local_info
            .insert("active".to_string(), Value::Bool(false));

        Ok(Self {
            id: manifest.id().to_string(),
            settings_file: SettingsFile::new(&path),
            path,
            manifest,
            active: false,
            units: Vec::new(),
            hooks: Vec::new(),
            tools: Vec::new(),
            forms: Vec::new(),
            endpoints: Vec::new(),
            overrides: PluginOverrides::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn hooks(&self) -> &[HookDecl] {
        &self.hooks
    }

    pub fn tools(&self) -> &[ToolDecl] {
        &self.tools
    }

    pub fn forms(&self) -> &[FormDecl] {
        &self.forms
    }

    pub fn endpoints(&self) -> &[EndpointDecl] {
        &self.endpoints
    }

    pub fn overrides(&self) -> &PluginOverrides {
        &self.overrides
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.id.clone(),
            path: self.path.clone(),
            manifest: self.manifest.clone(),
            active: self.active,
        }
    }

    /// Activate the plugin.
    ///
    /// On failure the record is left inactive with no artifacts.
    pub async fn activate(&mut self, env: &ActivationEnv<'_>) -> Result<()> {
        if self.active {
            return Ok(());
        }
        tracing::info!("Activating plugin {}", self.id);

        env.installer.ensure(&self.id, &self.path).await?;

        let units = env.loader.load(&self.id, &self.path, &self.manifest)?;
        let diagnostic = self.plugin_specific_error_message();
        let extracted = ArtifactExtractor::new(
            &self.id,
            env.endpoint_prefix,
            env.endpoint_tags,
            &diagnostic,
        )
        .extract(&units);

        let artifacts = match extracted {
            Ok(artifacts) => artifacts,
            Err(e) => {
                units.iter().for_each(|unit| unit.unload());
                return Err(e);
            }
        };

        self.units = units;
        self.hooks = artifacts.hooks;
        self.tools = artifacts.tools;
        self.forms = artifacts.forms;
        self.endpoints = artifacts.endpoints;
        for item in artifacts.overrides {
            self.overrides.set(item);
        }

        if let Err(e) = self.materialize_settings().await {
            tracing::warn!("Could not create settings for plugin {}: {}", self.id, e);
        }

        if let Some(activated) = self.overrides.activated.clone() {
            let info = self.info();
            if let Err(e) = self.guarded("activated", || activated(&info)) {
                self.clear_artifacts();
                return Err(e);
            }
        }

        self.set_active(true);
        Ok(())
    }

    /// Deactivate the plugin: unmount its endpoints, run the `deactivated`
    /// override, unload its units and drop every artifact.
    pub fn deactivate(&mut self, server: &dyn RouteMount) {
        if !self.active {
            return;
        }
        tracing::info!("Deactivating plugin {}", self.id);

        for endpoint in &self.endpoints {
            endpoint.deactivate(server);
        }

        if let Some(deactivated) = self.overrides.deactivated.clone() {
            let info = self.info();
            if let Err(e) = self.guarded("deactivated", || deactivated(&info)) {
                tracing::error!("Error in {}::deactivated: {}", self.id, e);
                tracing::warn!("{}", self.plugin_specific_error_message());
            }
        }

        self.clear_artifacts();
        self.set_active(false);
    }

    fn clear_artifacts(&mut self) {
        for unit in self.units.drain(..) {
            unit.unload();
        }
        self.hooks.clear();
        self.tools.clear();
        self.forms.clear();
        self.endpoints.clear();
        self.overrides = PluginOverrides::default();
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
        self.manifest
            .local_info
            .insert("active".to_string(), Value::Bool(active));
    }

    async fn materialize_settings(&self) -> Result<()> {
        if self.overrides.load_settings.is_some() || self.settings_file.exists().await {
            return Ok(());
        }
        let model = self.settings_model()?;
        if !self.settings_file.materialize(&model).await? {
            tracing::debug!(
                "Plugin {} has no complete default settings, skipping settings file",
                self.id
            );
        }
        Ok(())
    }

    /// Settings model: `settings_model` override, then the manifest shape.
    pub fn settings_model(&self) -> Result<SettingsShape> {
        match &self.overrides.settings_model {
            Some(model) => self.guarded("settings_model", || model()),
            None => Ok(self.manifest.settings.clone()),
        }
    }

    /// JSON schema of the settings.
    pub fn settings_schema(&self) -> Result<Value> {
        match &self.overrides.settings_schema {
            Some(schema) => self.guarded("settings_schema", || schema()),
            None => Ok(self.settings_model()?.json_schema()),
        }
    }

    /// Current settings.
    pub async fn load_settings(&self) -> Result<Value> {
        match &self.overrides.load_settings {
            Some(load) => self.guarded("load_settings", || load()),
            None => self.settings_file.load(&self.settings_model()?).await,
        }
    }

    /// Validate and persist settings. Invalid settings leave storage untouched.
    pub async fn save_settings(&self, settings: Value) -> Result<Value> {
        let model = self.settings_model()?;
        if let Err(violations) = model.validate(&settings) {
            return Err(PluginError::settings_validation(
                &self.id,
                violations.join("; "),
            ));
        }

        match &self.overrides.save_settings {
            Some(save) => self.guarded("save_settings", || save(settings)),
            None => self.settings_file.save(&model, &settings).await,
        }
    }

    /// Message pointing users at the plugin author, logged next to any error
    /// raised by the plugin's code.
    pub fn plugin_specific_error_message(&self) -> String {
        let name = &self.manifest.plugin.name;
        let url = self.manifest.plugin.plugin_url.trim();
        if url.is_empty() || url == "Unknown" {
            format!("Error in {} plugin, contact the creator", name)
        } else {
            format!(
                "To resolve any problem related to {} plugin, contact the creator using github issue at the link {}",
                name, url
            )
        }
    }

    /// Run plugin code in the plugin's scope, turning panics into errors.
    fn guarded<R>(&self, what: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        match catch_unwind(AssertUnwindSafe(|| sync_scope_plugin(&self.id, f))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PluginError::execution_error(
                &self.id,
                format!("{} failed: {}", what, e),
            )),
            Err(payload) => Err(PluginError::execution_error(
                &self.id,
                format!("{} {}", what, panic_message(payload.as_ref())),
            )),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("active", &self.active)
            .field("hooks", &self.hooks.len())
            .field("tools", &self.tools.len())
            .field("endpoints", &self.endpoints.len())
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}
