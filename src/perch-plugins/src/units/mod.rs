//! Code units: the loadable pieces of a plugin.
//!
//! A plugin's behavior comes from one or more code units. Each unit declares
//! its artifacts explicitly through a [`Registrar`] handed to
//! [`CodeUnit::register`]; nothing is probed by introspection.
//!
//! Two kinds of units exist:
//! - native units, registered by the host in a [`NativeUnitTable`] under a
//!   plugin id,
//! - WASM units, one per `*.wasm` file found in the plugin folder, whose
//!   exports are bound through the `[[exports]]` table of the manifest.

mod native;
mod wasm;

pub use native::{FnUnit, NativeUnitTable, UnitFactory};
pub use wasm::{WasmModule, WasmRuntime, WasmUnit};

use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::endpoints::EndpointDecl;
use crate::hooks::{HookCall, HookDecl, HookPriority};
use crate::manifest::PluginManifest;
use crate::overrides::PluginOverride;
use crate::tools::{FormDecl, ToolDecl};
use crate::{PluginError, Result};

/// A loadable unit of plugin code.
pub trait CodeUnit: Send + Sync {
    /// Unit name, unique within its plugin.
    fn name(&self) -> &str;

    /// Declare the unit's artifacts.
    fn register(&self, registrar: &mut Registrar) -> Result<()>;

    /// Release whatever the unit holds. Called once on deactivation; must be
    /// safe to call again.
    fn unload(&self) {}
}

/// Artifacts collected from the units of one plugin.
#[derive(Debug, Default, Clone)]
pub struct Artifacts {
    pub hooks: Vec<HookDecl>,
    pub tools: Vec<ToolDecl>,
    pub forms: Vec<FormDecl>,
    pub endpoints: Vec<EndpointDecl>,
    pub overrides: Vec<PluginOverride>,
}

impl Artifacts {
    pub fn extend(&mut self, other: Artifacts) {
        self.hooks.extend(other.hooks);
        self.tools.extend(other.tools);
        self.forms.extend(other.forms);
        self.endpoints.extend(other.endpoints);
        self.overrides.extend(other.overrides);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
            && self.tools.is_empty()
            && self.forms.is_empty()
            && self.endpoints.is_empty()
            && self.overrides.is_empty()
    }
}

/// Collects the declarations of a code unit, stamping each with the owning
/// plugin id.
pub struct Registrar {
    plugin_id: String,
    endpoint_prefix: String,
    endpoint_tags: Vec<String>,
    artifacts: Artifacts,
}

impl Registrar {
    pub fn new(
        plugin_id: impl Into<String>,
        endpoint_prefix: impl Into<String>,
        endpoint_tags: Vec<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            endpoint_prefix: endpoint_prefix.into(),
            endpoint_tags,
            artifacts: Artifacts::default(),
        }
    }

    /// Id of the plugin being registered.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn hook(&mut self, mut decl: HookDecl) -> &mut Self {
        decl.plugin_id = self.plugin_id.clone();
        self.artifacts.hooks.push(decl);
        self
    }

    /// Register a hook from a synchronous closure.
    pub fn hook_fn<F>(&mut self, name: &str, priority: impl Into<HookPriority>, f: F) -> &mut Self
    where
        F: Fn(HookCall) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.hook(HookDecl::from_fn(name, priority, f))
    }

    pub fn tool(&mut self, mut decl: ToolDecl) -> &mut Self {
        decl.plugin_id = self.plugin_id.clone();
        self.artifacts.tools.push(decl);
        self
    }

    /// Register a form. Forms without `autopilot` are not collected.
    pub fn form(&mut self, mut decl: FormDecl) -> &mut Self {
        if !decl.autopilot {
            tracing::debug!(
                "Skipping form {} of plugin {}: autopilot is off",
                decl.name,
                self.plugin_id
            );
            return self;
        }
        decl.plugin_id = self.plugin_id.clone();
        self.artifacts.forms.push(decl);
        self
    }

    pub fn endpoint(&mut self, mut decl: EndpointDecl) -> &mut Self {
        decl.plugin_id = self.plugin_id.clone();
        if decl.prefix.is_none() {
            decl.prefix = Some(self.endpoint_prefix.clone());
        }
        if decl.tags.is_empty() {
            decl.tags = self.endpoint_tags.clone();
        }
        self.artifacts.endpoints.push(decl);
        self
    }

    pub fn plugin_override(&mut self, item: PluginOverride) -> &mut Self {
        self.artifacts.overrides.push(item);
        self
    }

    pub fn into_artifacts(self) -> Artifacts {
        self.artifacts
    }
}

/// Locates and instantiates the code units of a plugin folder.
#[derive(Clone)]
pub struct UnitLoader {
    native: NativeUnitTable,
    wasm: Arc<WasmRuntime>,
}

impl UnitLoader {
    pub fn new(native: NativeUnitTable, wasm: Arc<WasmRuntime>) -> Self {
        Self { native, wasm }
    }

    pub fn native(&self) -> &NativeUnitTable {
        &self.native
    }

    /// Fresh units for a plugin: native units first, then WASM units in path
    /// order. A plugin without any unit cannot be loaded.
    pub fn load(
        &self,
        plugin_id: &str,
        plugin_dir: &Path,
        manifest: &PluginManifest,
    ) -> Result<Vec<Arc<dyn CodeUnit>>> {
        let mut units = self.native.instantiate(plugin_id);

        for (name, path) in wasm_files(plugin_dir) {
            tracing::debug!("Found WASM unit {} in plugin {}", name, plugin_id);
            units.push(Arc::new(WasmUnit::new(
                name,
                path,
                self.wasm.clone(),
                manifest.exports.clone(),
            )));
        }

        if units.is_empty() {
            return Err(PluginError::load_error(
                plugin_id,
                format!("No code units found in {}", plugin_dir.display()),
            ));
        }
        Ok(units)
    }
}

/// `*.wasm` files of a plugin folder, outside any `tests` folder, named by
/// their relative path without extension.
fn wasm_files(plugin_dir: &Path) -> Vec<(String, std::path::PathBuf)> {
    WalkDir::new(plugin_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != "tests")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "wasm"))
        .filter_map(|e| {
            let relative = e.path().strip_prefix(plugin_dir).ok()?.with_extension("");
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            Some((name, e.path().to_path_buf()))
        })
        .collect()
}
