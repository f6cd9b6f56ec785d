//! Flat caches of the artifacts of active plugins.
//!
//! The caches are derived data: they are rebuilt from the whole record table
//! after every mutation and published as a new immutable generation. Readers
//! keep the generation they started with.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::context::PluginContext;
use crate::endpoints::EndpointDecl;
use crate::hooks::{HookDecl, HookPipeline, sort_hooks};
use crate::plugin::Plugin;
use crate::tools::{FormDecl, ToolDecl};

/// One generation of the artifact caches.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    /// Hooks by name, in execution order
    pub hooks_by_name: HashMap<String, Vec<HookDecl>>,
    pub tools: Vec<ToolDecl>,
    pub forms: Vec<FormDecl>,
    pub endpoints: Vec<EndpointDecl>,
    /// Error message of each active plugin
    pub diagnostics: HashMap<String, String>,
    pub active_ids: HashSet<String>,
}

impl ArtifactCache {
    /// Build the caches from the active records among `plugins`.
    ///
    /// Records must be given in plugin id order so that hooks of equal
    /// priority keep a deterministic order.
    pub fn build<'a>(plugins: impl IntoIterator<Item = &'a Plugin>) -> Self {
        let mut cache = Self::default();

        for plugin in plugins.into_iter().filter(|p| p.is_active()) {
            cache.active_ids.insert(plugin.id().to_string());
            cache.diagnostics.insert(
                plugin.id().to_string(),
                plugin.plugin_specific_error_message(),
            );

            for hook in plugin.hooks() {
                cache
                    .hooks_by_name
                    .entry(hook.name.clone())
                    .or_default()
                    .push(hook.clone());
            }
            cache.tools.extend(plugin.tools().iter().cloned());
            cache.forms.extend(plugin.forms().iter().cloned());
            cache.endpoints.extend(plugin.endpoints().iter().cloned());
        }

        for hooks in cache.hooks_by_name.values_mut() {
            sort_hooks(hooks);
        }

        cache
    }

    /// Hooks registered under `name`, in execution order.
    pub fn hooks(&self, name: &str) -> &[HookDecl] {
        self.hooks_by_name
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Run the pipeline of `name` against this generation.
    pub async fn execute_hook(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &PluginContext,
    ) -> Option<Value> {
        HookPipeline::new(self.hooks(name), &self.diagnostics)
            .run(args, context)
            .await
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDecl> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn hook_count(&self) -> usize {
        self.hooks_by_name.values().map(Vec::len).sum()
    }
}
