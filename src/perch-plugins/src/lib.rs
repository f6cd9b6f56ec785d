//! # Perch Plugin Engine
//!
//! Lets third-party plugins change the behavior of a running Perch assistant
//! without recompiling it. Plugins can:
//!
//! - **Hooks**: transform values flowing through the conversation pipeline,
//!   cooperatively and in priority order
//! - **Tools and forms**: expose procedures the agent can call
//! - **Endpoints**: add HTTP routes to the live server
//! - **Overrides**: run code on activation/deactivation and own their settings
//!
//! ## Plugin Structure
//!
//! ```text
//! plugins/
//! └── weather/
//!     ├── plugin.toml        # Optional manifest
//!     ├── requirements.txt   # Optional package requirements
//!     ├── plugin.wasm        # WASM code units (any number, any depth)
//!     └── settings.json      # Written on first activation
//! ```
//!
//! Code can also be compiled into the host and registered as native units
//! under the plugin id; the folder then only carries metadata.
//!
//! ## Example
//!
//! ```rust,ignore
//! use perch_plugins::{PluginConfig, PluginContext, PluginManager};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> perch_plugins::Result<()> {
//!     let manager = PluginManager::new(PluginConfig::default())?;
//!
//!     manager.native_units().register_fn("shouter", "main", |r| {
//!         r.hook_fn("before_agent_reply", 5, |call| {
//!             Ok(call.value.map(|v| json!(v.as_str().unwrap_or_default().to_uppercase())))
//!         });
//!         Ok(())
//!     });
//!
//!     let report = manager.discover().await?;
//!     println!("active plugins: {:?}", report.active);
//!
//!     let reply = manager
//!         .execute_hook("before_agent_reply", vec![json!("hello")], &PluginContext::new())
//!         .await;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod active_set;
pub mod admin;
pub mod archive;
pub mod config;
pub mod context;
pub mod dependencies;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod extractor;
pub mod hooks;
pub mod manager;
pub mod manifest;
pub mod marketplace;
pub mod overrides;
pub mod plugin;
pub mod registry;
pub mod server;
pub mod settings;
pub mod tools;
pub mod units;

// Re-exports for convenience
pub use active_set::{ActiveSetStore, FileActiveSetStore, MemoryActiveSetStore};
pub use config::{PackageManagerConfig, PluginConfig, WasmLimits};
pub use context::{PluginContext, current_plugin_id};
pub use dependencies::{
    CommandPackageManager, DependencyInstaller, PackageManager, Provisioned, Requirement,
};
pub use endpoints::{
    EndpointDecl, EndpointRequest, EndpointResponse, RouteKey, RouteMount, RouteSpec,
};
pub use error::{PluginError, Result};
pub use events::{Event, EventBus, EventHandler, EventSubscription, EventType};
pub use hooks::{HookCall, HookDecl, HookPriority};
pub use manager::{DiscoveryReport, ListedPlugin, PluginManager, PluginManagerBuilder};
pub use manifest::{Compatibility, ExportManifest, PluginManifest, PluginMetadata};
pub use marketplace::{MarketplaceClient, MarketplacePlugin};
pub use overrides::{PluginOverride, PluginOverrides};
pub use plugin::{Plugin, PluginInfo};
pub use registry::ArtifactCache;
pub use server::DynamicRouter;
pub use settings::{SettingsField, SettingsFieldType, SettingsShape};
pub use tools::{FormDecl, ProcedureSummary, ToolDecl};
pub use units::{CodeUnit, NativeUnitTable, Registrar, WasmRuntime};

/// Plugin engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin manifest filename
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Unit that `[[exports]]` entries without a `module` bind to
pub const MAIN_UNIT: &str = "plugin";
