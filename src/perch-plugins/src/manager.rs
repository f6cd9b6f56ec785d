//! Plugin manager: the engine owning every plugin record.
//!
//! Mutations (`discover`, `install`, `uninstall`, `toggle`) are serialized
//! behind one async mutex guarding the record table; each ends by rebuilding
//! the artifact caches and publishing them as a new generation. Readers
//! (`execute_hook`, `tools`, `endpoints`, plugin lookups) only clone the
//! current generation and never wait for a mutation.

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::active_set::{ActiveSetStore, FileActiveSetStore};
use crate::archive;
use crate::config::PluginConfig;
use crate::context::{PluginContext, current_plugin_id, scope_plugin};
use crate::dependencies::{CommandPackageManager, DependencyInstaller, PackageManager};
use crate::endpoints::{EndpointDecl, RouteMount};
use crate::error::panic_message;
use crate::events::{Event, EventBus};
use crate::manifest::PluginManifest;
use crate::marketplace::{MarketplaceClient, MarketplacePlugin};
use crate::plugin::{ActivationEnv, Plugin, PluginInfo};
use crate::registry::ArtifactCache;
use crate::server::DynamicRouter;
use crate::tools::{FormDecl, ProcedureSummary, ToolDecl};
use crate::units::{NativeUnitTable, UnitLoader, WasmRuntime};
use crate::{PluginError, Result};

/// Outcome of a full scan of the plugins folder.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Ids activated by the scan
    pub active: Vec<String>,
    /// Ids whose activation failed; they were removed from the active set
    pub failed: Vec<(String, PluginError)>,
}

/// An entry of [`PluginManager::list_available`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ListedPlugin {
    Installed(PluginManifest),
    Marketplace(MarketplacePlugin),
}

/// Builder for [`PluginManager`].
pub struct PluginManagerBuilder {
    config: PluginConfig,
    active_set: Option<Arc<dyn ActiveSetStore>>,
    package_manager: Option<Arc<dyn PackageManager>>,
    server: Option<Arc<dyn RouteMount>>,
    native_units: NativeUnitTable,
    events: Option<Arc<EventBus>>,
    marketplace: Option<MarketplaceClient>,
}

impl PluginManagerBuilder {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            active_set: None,
            package_manager: None,
            server: None,
            native_units: NativeUnitTable::new(),
            events: None,
            marketplace: None,
        }
    }

    pub fn active_set(mut self, store: Arc<dyn ActiveSetStore>) -> Self {
        self.active_set = Some(store);
        self
    }

    pub fn package_manager(mut self, manager: Arc<dyn PackageManager>) -> Self {
        self.package_manager = Some(manager);
        self
    }

    /// Mount capability of the host server. Without one, the manager owns a
    /// [`DynamicRouter`] reachable through [`PluginManager::dynamic_router`].
    pub fn route_mount(mut self, server: Arc<dyn RouteMount>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn native_units(mut self, table: NativeUnitTable) -> Self {
        self.native_units = table;
        self
    }

    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn marketplace(mut self, client: MarketplaceClient) -> Self {
        self.marketplace = Some(client);
        self
    }

    pub fn build(self) -> Result<PluginManager> {
        let config = self.config;

        let active_set = self.active_set.unwrap_or_else(|| {
            Arc::new(FileActiveSetStore::new(
                config.active_set_path.clone(),
                config.initial_active_set(),
            ))
        });
        let package_manager = self.package_manager.unwrap_or_else(|| {
            Arc::new(CommandPackageManager::new(config.package_manager.clone()))
        });
        let (server, dynamic_router) = match self.server {
            Some(server) => (server, None),
            None => {
                let router = DynamicRouter::new();
                (Arc::new(router.clone()) as Arc<dyn RouteMount>, Some(router))
            }
        };
        let marketplace = self.marketplace.unwrap_or_else(|| {
            MarketplaceClient::new(
                config.marketplace_url.clone(),
                Duration::from_secs(config.marketplace_timeout_secs),
            )
        });
        let runtime = Arc::new(WasmRuntime::new(config.wasm)?);

        Ok(PluginManager {
            installer: DependencyInstaller::new(package_manager),
            loader: UnitLoader::new(self.native_units, runtime),
            events: self.events.unwrap_or_default(),
            active_set,
            server,
            dynamic_router,
            marketplace,
            plugins: Mutex::new(BTreeMap::new()),
            cache: RwLock::new(Arc::new(ArtifactCache::default())),
            infos: RwLock::new(Arc::new(BTreeMap::new())),
            config,
        })
    }
}

/// The plugin engine.
pub struct PluginManager {
    config: PluginConfig,
    active_set: Arc<dyn ActiveSetStore>,
    installer: DependencyInstaller,
    loader: UnitLoader,
    server: Arc<dyn RouteMount>,
    dynamic_router: Option<DynamicRouter>,
    events: Arc<EventBus>,
    marketplace: MarketplaceClient,

    /// Record table; held for the whole of every mutation
    plugins: Mutex<BTreeMap<String, Plugin>>,
    /// Current cache generation
    cache: RwLock<Arc<ArtifactCache>>,
    /// Current view of the records
    infos: RwLock<Arc<BTreeMap<String, PluginInfo>>>,
}

impl PluginManager {
    /// Manager with default collaborators built from `config`.
    pub fn new(config: PluginConfig) -> Result<Self> {
        PluginManagerBuilder::new(config).build()
    }

    pub fn builder(config: PluginConfig) -> PluginManagerBuilder {
        PluginManagerBuilder::new(config)
    }

    // ========== Discovery and lifecycle ==========

    /// Rescan the plugins folder, replacing every record.
    ///
    /// Plugins in the active set are activated; one that fails is logged,
    /// demoted from the active set and reported, and the scan goes on.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let mut plugins = self.plugins.lock().await;

        // Read everything fallible before the old records are dropped
        let mut active_ids = self.active_set.get_active_plugin_ids().await?;
        tracing::info!("ACTIVE PLUGINS: {:?}", active_ids);
        let folders = self.plugin_folders().await?;

        for plugin in plugins.values_mut() {
            plugin.deactivate(self.server.as_ref());
        }
        plugins.clear();

        for folder in folders {
            match Plugin::load(folder, &self.config.host_version).await {
                Ok(plugin) => {
                    plugins.insert(plugin.id().to_string(), plugin);
                }
                Err(e) => tracing::error!("Skipping plugin folder: {}", e),
            }
        }

        let mut report = DiscoveryReport::default();
        let env = self.activation_env();
        for (id, plugin) in plugins.iter_mut() {
            if !active_ids.contains(id) {
                continue;
            }
            match plugin.activate(&env).await {
                Ok(()) => report.active.push(id.clone()),
                Err(e) => {
                    tracing::error!("Could not activate plugin {}: {}", id, e);
                    tracing::warn!("{}", plugin.plugin_specific_error_message());
                    report.failed.push((id.clone(), e));
                }
            }
        }

        self.rebuild(&plugins);
        drop(plugins);

        if !report.failed.is_empty() {
            active_ids.retain(|id| !report.failed.iter().any(|(failed, _)| failed == id));
            self.active_set.set_active_plugin_ids(&active_ids).await?;
        }

        for id in &report.active {
            if let Some(event) = self.activated_event(id) {
                self.events.publish(event).await;
            }
        }
        for (id, e) in &report.failed {
            self.events
                .publish(Event::PluginError {
                    plugin_id: id.clone(),
                    error: e.to_string(),
                })
                .await;
        }
        self.events
            .publish(Event::PluginsDiscovered {
                active: report.active.clone(),
                failed: report.failed.iter().map(|(id, _)| id.clone()).collect(),
            })
            .await;

        Ok(report)
    }

    /// Flip the active state of a plugin. Returns the new state.
    pub async fn toggle(&self, id: &str) -> Result<bool> {
        let mut plugins = self.plugins.lock().await;
        self.toggle_locked(&mut plugins, id).await
    }

    async fn toggle_locked(&self, plugins: &mut BTreeMap<String, Plugin>, id: &str) -> Result<bool> {
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let mut active_ids = self.active_set.get_active_plugin_ids().await?;

        let now_active = if plugin.is_active() {
            tracing::warn!("Toggle plugin {}: Deactivate", id);
            // Persisted before the record changes
            active_ids.retain(|a| a != id);
            self.active_set.set_active_plugin_ids(&active_ids).await?;
            plugin.deactivate(self.server.as_ref());
            false
        } else {
            tracing::warn!("Toggle plugin {}: Activate", id);
            if let Err(e) = plugin.activate(&self.activation_env()).await {
                self.events
                    .publish(Event::PluginError {
                        plugin_id: id.to_string(),
                        error: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
            active_ids.push(id.to_string());
            if let Err(e) = self.active_set.set_active_plugin_ids(&active_ids).await {
                tracing::error!("Could not store the active set, deactivating {}: {}", id, e);
                plugin.deactivate(self.server.as_ref());
                return Err(e);
            }
            true
        };

        self.rebuild(plugins);

        let event = if now_active {
            self.activated_event(id)
        } else {
            Some(Event::PluginDeactivated {
                plugin_id: id.to_string(),
            })
        };
        if let Some(event) = event {
            self.events.publish(event).await;
        }
        Ok(now_active)
    }

    /// Install a plugin archive and activate it.
    ///
    /// An archive whose plugin id is already installed replaces it: the old
    /// plugin is deactivated and its folder removed first.
    pub async fn install(&self, archive_path: &Path) -> Result<PluginInfo> {
        let mut plugins = self.plugins.lock().await;

        let staged = archive::stage(archive_path, &self.config.plugins_dir).await?;
        let id = staged.id.clone();
        let dest = self.config.plugins_dir.join(&id);
        tracing::info!("Installing plugin {} from {}", id, archive_path.display());

        let mut upgrade = false;
        if let Some(mut old) = plugins.remove(&id) {
            upgrade = true;
            old.deactivate(self.server.as_ref());
            self.rebuild(&plugins);
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            upgrade = true;
            tokio::fs::remove_dir_all(&dest).await?;
        }

        staged.commit(&dest).await?;
        let plugin = Plugin::load(dest, &self.config.host_version).await?;
        let version = plugin.manifest().plugin.version.clone();
        plugins.insert(id.clone(), plugin);

        self.events
            .publish(Event::PluginInstalled {
                plugin_id: id.clone(),
                version,
                upgrade,
                at: chrono::Utc::now(),
            })
            .await;

        if let Err(e) = self.toggle_locked(&mut plugins, &id).await {
            // Installed but inactive
            self.rebuild(&plugins);
            return Err(e);
        }

        plugins
            .get(&id)
            .map(Plugin::info)
            .ok_or_else(|| PluginError::NotFound(id))
    }

    /// Download a plugin from the marketplace and install it.
    pub async fn install_from_marketplace(&self, url: &str) -> Result<PluginInfo> {
        let download_dir = tempfile::TempDir::new()?;
        let archive_path = self.marketplace.download(url, download_dir.path()).await?;
        self.install(&archive_path).await
    }

    /// Deactivate (if needed) and delete a plugin.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let mut plugins = self.plugins.lock().await;

        if !plugins.contains_key(id) {
            return Err(PluginError::NotFound(id.to_string()));
        }
        if self.config.is_protected(id) {
            return Err(PluginError::CoreProtected(id.to_string()));
        }

        if plugins.get(id).is_some_and(Plugin::is_active) {
            self.toggle_locked(&mut plugins, id).await?;
        }

        let removed = match plugins.remove(id) {
            Some(plugin) => {
                tracing::info!("Removing plugin {} at {}", id, plugin.path().display());
                tokio::fs::remove_dir_all(plugin.path()).await
            }
            None => Ok(()),
        };
        self.rebuild(&plugins);
        drop(plugins);
        removed?;

        self.events
            .publish(Event::PluginUninstalled {
                plugin_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Deactivate every plugin without touching the active set, so the next
    /// discovery restores the same state.
    pub async fn shutdown(&self) {
        let mut plugins = self.plugins.lock().await;
        for plugin in plugins.values_mut() {
            plugin.deactivate(self.server.as_ref());
        }
        self.rebuild(&plugins);
    }

    fn activation_env(&self) -> ActivationEnv<'_> {
        ActivationEnv {
            installer: &self.installer,
            loader: &self.loader,
            endpoint_prefix: &self.config.endpoint_prefix,
            endpoint_tags: &self.config.endpoint_tags,
        }
    }

    /// Plugin folders in name order. Hidden folders (including archive
    /// staging folders) are skipped.
    async fn plugin_folders(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.config.plugins_dir;
        tokio::fs::create_dir_all(dir).await?;

        let mut folders = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with("__") {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                folders.push(entry.path());
            }
        }
        folders.sort();
        Ok(folders)
    }

    /// Publish a new cache generation and mount the endpoints of active
    /// plugins.
    fn rebuild(&self, plugins: &BTreeMap<String, Plugin>) {
        let cache = ArtifactCache::build(plugins.values());
        for endpoint in &cache.endpoints {
            if let Err(e) = endpoint.activate(self.server.as_ref(), &cache.active_ids) {
                tracing::error!(
                    "Could not mount endpoint {} of plugin {}: {}",
                    endpoint.full_path(),
                    endpoint.plugin_id,
                    e
                );
            }
        }
        tracing::debug!(
            "Rebuilt caches: {} hooks, {} tools, {} forms, {} endpoints",
            cache.hook_count(),
            cache.tools.len(),
            cache.forms.len(),
            cache.endpoints.len()
        );

        let infos = plugins
            .iter()
            .map(|(id, plugin)| (id.clone(), plugin.info()))
            .collect();
        *self.cache.write() = Arc::new(cache);
        *self.infos.write() = Arc::new(infos);
    }

    fn activated_event(&self, id: &str) -> Option<Event> {
        let cache = self.snapshot();
        if !cache.active_ids.contains(id) {
            return None;
        }
        Some(Event::PluginActivated {
            plugin_id: id.to_string(),
            hooks: cache
                .hooks_by_name
                .values()
                .flatten()
                .filter(|h| h.plugin_id == id)
                .count(),
            tools: cache.tools.iter().filter(|t| t.plugin_id == id).count(),
            endpoints: cache.endpoints.iter().filter(|e| e.plugin_id == id).count(),
        })
    }

    // ========== Hooks, tools and endpoints ==========

    /// Current cache generation.
    pub fn snapshot(&self) -> Arc<ArtifactCache> {
        self.cache.read().clone()
    }

    /// Run the hook pipeline `name`.
    ///
    /// With no `args` every hook runs for its side effects and `None` is
    /// returned; otherwise `args[0]` is piped through the hooks and the final
    /// value returned.
    pub async fn execute_hook(
        &self,
        name: &str,
        args: Vec<Value>,
        context: &PluginContext,
    ) -> Option<Value> {
        let cache = self.snapshot();
        cache.execute_hook(name, args, context).await
    }

    /// Typed [`execute_hook`](Self::execute_hook): `value` is piped through
    /// the hooks and read back as `T`.
    pub async fn execute_hook_as<T>(
        &self,
        name: &str,
        value: T,
        extra_args: Vec<Value>,
        context: &PluginContext,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut args = vec![serde_json::to_value(value)?];
        args.extend(extra_args);
        let piped = self
            .execute_hook(name, args, context)
            .await
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(piped)?)
    }

    pub fn tools(&self) -> Vec<ToolDecl> {
        self.snapshot().tools.clone()
    }

    pub fn forms(&self) -> Vec<FormDecl> {
        self.snapshot().forms.clone()
    }

    /// Tools and forms of active plugins.
    pub fn procedures(&self) -> Vec<ProcedureSummary> {
        let cache = self.snapshot();
        cache
            .tools
            .iter()
            .map(ToolDecl::summary)
            .chain(cache.forms.iter().map(FormDecl::summary))
            .collect()
    }

    pub fn endpoints(&self) -> Vec<EndpointDecl> {
        self.snapshot().endpoints.clone()
    }

    /// Run a tool of an active plugin.
    pub async fn run_tool(&self, name: &str, input: &str, context: &PluginContext) -> Result<String> {
        let tool = self
            .snapshot()
            .tool(name)
            .cloned()
            .ok_or_else(|| PluginError::ToolNotFound(name.to_string()))?;
        let plugin_id = tool.plugin_id.clone();
        let input = input.to_string();
        let context = context.clone();

        let call = scope_plugin(plugin_id.clone(), async move { tool.run(input, context).await });
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(PluginError::execution_error(
                &plugin_id,
                format!("tool {} failed: {}", name, e),
            )),
            Err(payload) => Err(PluginError::execution_error(
                &plugin_id,
                format!("tool {} {}", name, panic_message(payload.as_ref())),
            )),
        }
    }

    /// Router owned by the manager when no mount capability was injected.
    pub fn dynamic_router(&self) -> Option<&DynamicRouter> {
        self.dynamic_router.as_ref()
    }

    // ========== Plugin lookup ==========

    /// The plugin whose code is currently executing.
    pub fn get_plugin(&self) -> Option<PluginInfo> {
        current_plugin_id().and_then(|id| self.plugin(&id))
    }

    /// The plugin whose folder contains `path`.
    pub fn plugin_for_path(&self, path: &Path) -> Option<PluginInfo> {
        let infos = self.infos.read().clone();
        infos
            .values()
            .filter(|info| path.starts_with(&info.path))
            .max_by_key(|info| info.path.components().count())
            .cloned()
    }

    pub fn plugin(&self, id: &str) -> Option<PluginInfo> {
        self.infos.read().get(id).cloned()
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.infos.read().values().cloned().collect()
    }

    pub fn plugin_exists(&self, id: &str) -> bool {
        self.infos.read().contains_key(id)
    }

    pub async fn active_plugin_ids(&self) -> Result<Vec<String>> {
        self.active_set.get_active_plugin_ids().await
    }

    /// Installed plugins merged with the marketplace listing.
    ///
    /// Installed plugins come first, flagged with `local_info.active` and
    /// `local_info.upgrade` (the marketplace version when it differs). Market
    /// entries of installed plugins are not repeated. `query` filters the
    /// installed plugins case-insensitively and is forwarded to the
    /// marketplace search.
    pub async fn list_available(&self, query: Option<&str>) -> Vec<ListedPlugin> {
        let query = query.map(str::trim).filter(|q| !q.is_empty());
        let mut remote = self.marketplace.search(query).await;
        let needle = query.map(str::to_lowercase);

        let mut listed = Vec::new();
        for info in self.list_plugins() {
            let mut manifest = info.manifest;
            manifest
                .local_info
                .insert("active".to_string(), Value::Bool(info.active));
            manifest.local_info.insert("upgrade".to_string(), Value::Null);

            let market = remote
                .iter()
                .position(|p| p.id == manifest.plugin.plugin_url)
                .map(|index| remote.remove(index));

            let text = serde_json::to_string(&manifest)
                .unwrap_or_default()
                .to_lowercase();
            if needle.as_ref().is_some_and(|n| !text.contains(n.as_str())) {
                continue;
            }

            if let Some(version) = market.and_then(|p| p.version) {
                if version != manifest.plugin.version {
                    manifest
                        .local_info
                        .insert("upgrade".to_string(), Value::String(version));
                }
            }
            listed.push(ListedPlugin::Installed(manifest));
        }

        listed.extend(remote.into_iter().map(ListedPlugin::Marketplace));
        listed
    }

    // ========== Settings ==========

    pub async fn plugin_settings(&self, id: &str) -> Result<Value> {
        let plugins = self.plugins.lock().await;
        Self::record(&plugins, id)?.load_settings().await
    }

    pub async fn plugin_settings_schema(&self, id: &str) -> Result<Value> {
        let plugins = self.plugins.lock().await;
        Self::record(&plugins, id)?.settings_schema()
    }

    /// Validate and store the settings of a plugin. Returns what was stored.
    pub async fn save_plugin_settings(&self, id: &str, settings: Value) -> Result<Value> {
        let plugins = self.plugins.lock().await;
        Self::record(&plugins, id)?.save_settings(settings).await
    }

    fn record<'a>(plugins: &'a BTreeMap<String, Plugin>, id: &str) -> Result<&'a Plugin> {
        plugins
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    // ========== Accessors ==========

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Table of native code units, keyed by plugin id.
    pub fn native_units(&self) -> &NativeUnitTable {
        self.loader.native()
    }

    pub fn marketplace(&self) -> &MarketplaceClient {
        &self.marketplace
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.config.plugins_dir)
            .field("plugins", &self.infos.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
