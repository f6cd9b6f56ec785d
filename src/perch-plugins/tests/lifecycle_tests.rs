//! Integration tests for the plugin lifecycle: discover → activate → toggle →
//! install → uninstall.
//!
//! Plugins are real folders in a temporary plugins root; their code is
//! registered as native units. A recording package manager and the dynamic
//! router stand in for the environment and the host server.

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use perch_plugins::{
    ActiveSetStore, DynamicRouter, EndpointDecl, Event, EventHandler, EventType,
    MarketplaceClient, MemoryActiveSetStore, PackageManager, PluginConfig, PluginContext,
    PluginError, PluginManager, PluginOverride, Requirement, Result, ToolDecl,
};

// =============================================================================
// Fixtures
// =============================================================================

/// Package manager recording every call.
#[derive(Default)]
struct RecordingPackages {
    installed: Mutex<HashSet<String>>,
    install_calls: Mutex<Vec<Vec<String>>>,
    uninstall_calls: Mutex<Vec<Vec<String>>>,
    fail_install: AtomicBool,
}

impl RecordingPackages {
    fn with_installed(names: &[&str]) -> Self {
        let packages = Self::default();
        packages
            .installed
            .lock()
            .extend(names.iter().map(|s| s.to_string()));
        packages
    }
}

fn names(requirements: &[Requirement]) -> Vec<String> {
    requirements.iter().map(|r| r.name.clone()).collect()
}

#[async_trait]
impl PackageManager for RecordingPackages {
    async fn installed_packages(&self) -> Result<HashSet<String>> {
        Ok(self.installed.lock().clone())
    }

    async fn install(&self, requirements: &[Requirement]) -> Result<()> {
        self.install_calls.lock().push(names(requirements));
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(PluginError::dependency_error("env", "exit status 1"));
        }
        self.installed.lock().extend(names(requirements));
        Ok(())
    }

    async fn uninstall(&self, requirements: &[Requirement]) -> Result<()> {
        self.uninstall_calls.lock().push(names(requirements));
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    manager: Arc<PluginManager>,
    store: Arc<dyn ActiveSetStore>,
    packages: Arc<RecordingPackages>,
    router: DynamicRouter,
}

impl Harness {
    fn new(active: &[&str]) -> Self {
        Self::with_packages(active, RecordingPackages::default())
    }

    fn with_packages(active: &[&str], packages: RecordingPackages) -> Self {
        let store = Arc::new(MemoryActiveSetStore::new(
            active.iter().map(|s| s.to_string()).collect(),
        ));
        Self::build(store, packages)
    }

    fn with_store(store: Arc<dyn ActiveSetStore>) -> Self {
        Self::build(store, RecordingPackages::default())
    }

    fn build(store: Arc<dyn ActiveSetStore>, packages: RecordingPackages) -> Self {
        let dir = TempDir::new().unwrap();
        let packages = Arc::new(packages);
        let router = DynamicRouter::new();

        let config = PluginConfig::with_plugins_dir(dir.path().join("plugins")).protect("core");
        let manager = PluginManager::builder(config)
            .active_set(store.clone())
            .package_manager(packages.clone())
            .route_mount(Arc::new(router.clone()))
            .marketplace(MarketplaceClient::new(
                "http://127.0.0.1:9",
                Duration::from_millis(200),
            ))
            .build()
            .unwrap();

        Self {
            dir,
            manager: Arc::new(manager),
            store,
            packages,
            router,
        }
    }

    fn plugins_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("plugins")
    }

    fn add_folder(&self, id: &str, manifest: &str) -> std::path::PathBuf {
        let path = self.plugins_dir().join(id);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("plugin.toml"), manifest).unwrap();
        path
    }

    /// Folder plus a native unit declaring one hook, one tool and one endpoint.
    fn add_full_plugin(&self, id: &str) {
        self.add_folder(id, &format!("[plugin]\nname = \"{}\"\n", id));
        let owner = id.to_string();
        self.manager.native_units().register_fn(id, "main", move |r| {
            let tag = owner.clone();
            r.hook_fn("before_reply", 1, move |call| {
                let text = call.value.and_then(|v| v.as_str().map(String::from));
                Ok(text.map(|t| json!(format!("{}[{}]", t, tag))))
            });
            r.tool(ToolDecl::from_fn(
                format!("{}_tool", owner),
                "Echo",
                |input, _| Ok(input),
            ));
            let endpoint_owner = owner.clone();
            r.endpoint(EndpointDecl::get(format!("/{}", owner), move |_, _| {
                Ok(json!({ "plugin": endpoint_owner }))
            }));
            Ok(())
        });
    }

    async fn active_set(&self) -> Vec<String> {
        self.store.get_active_plugin_ids().await.unwrap()
    }

    async fn get(&self, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.router.router().oneshot(request).await.unwrap().status()
    }
}

/// Active set whose reads or writes can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryActiveSetStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    fn new(ids: &[&str]) -> Self {
        Self {
            inner: MemoryActiveSetStore::new(ids.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ActiveSetStore for FlakyStore {
    async fn get_active_plugin_ids(&self) -> Result<Vec<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PluginError::ConfigError("active set unreadable".into()));
        }
        self.inner.get_active_plugin_ids().await
    }

    async fn set_active_plugin_ids(&self, ids: &[String]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PluginError::ConfigError("active set read-only".into()));
        }
        self.inner.set_active_plugin_ids(ids).await
    }
}

fn artifact_names(manager: &PluginManager) -> (Vec<String>, Vec<String>, Vec<String>) {
    let cache = manager.snapshot();
    let mut hooks: Vec<String> = cache
        .hooks_by_name
        .values()
        .flatten()
        .map(|h| h.label())
        .collect();
    hooks.sort();
    let tools = cache.tools.iter().map(|t| t.name.clone()).collect();
    let endpoints = cache.endpoints.iter().map(|e| e.full_path()).collect();
    (hooks, tools, endpoints)
}

fn write_zip(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_discover_isolates_failing_plugins() {
    let h = Harness::new(&["broken", "good"]);
    h.add_full_plugin("good");
    // No code units at all
    h.add_folder("broken", "[plugin]\nname = \"Broken\"\n");

    let report = h.manager.discover().await.unwrap();
    assert_eq!(report.active, vec!["good"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken");
    assert!(matches!(report.failed[0].1, PluginError::LoadError { .. }));

    // Demoted from the active set, still installed
    assert_eq!(h.active_set().await, vec!["good"]);
    assert!(h.manager.plugin_exists("broken"));
    assert!(!h.manager.plugin("broken").unwrap().active);
}

#[tokio::test]
async fn test_rediscovery_rederives_active_state() {
    let h = Harness::new(&["alpha"]);
    h.add_full_plugin("alpha");
    h.add_full_plugin("beta");
    h.manager.discover().await.unwrap();

    h.store
        .set_active_plugin_ids(&["beta".to_string()])
        .await
        .unwrap();
    h.manager.discover().await.unwrap();

    assert!(!h.manager.plugin("alpha").unwrap().active);
    assert!(h.manager.plugin("beta").unwrap().active);
    assert_eq!(h.get("/custom/alpha").await, StatusCode::NOT_FOUND);
    assert_eq!(h.get("/custom/beta").await, StatusCode::OK);
}

#[tokio::test]
async fn test_hidden_folders_are_not_plugins() {
    let h = Harness::new(&[]);
    h.add_folder(".staging-leftover", "");
    h.add_folder("__pycache__", "");
    h.add_folder("real", "");

    h.manager.discover().await.unwrap();
    let ids: Vec<String> = h.manager.list_plugins().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["real"]);
}

#[tokio::test]
async fn test_failed_rediscovery_keeps_previous_state() {
    let store = Arc::new(FlakyStore::new(&["weather"]));
    let h = Harness::with_store(store.clone());
    h.add_full_plugin("weather");
    h.manager.discover().await.unwrap();

    store.fail_reads.store(true, Ordering::SeqCst);
    assert!(h.manager.discover().await.is_err());

    // Records, caches and routes still agree
    assert!(h.manager.plugin("weather").unwrap().active);
    assert_eq!(
        h.manager
            .execute_hook("before_reply", vec![json!("hi")], &PluginContext::new())
            .await,
        Some(json!("hi[weather]"))
    );
    assert_eq!(h.get("/custom/weather").await, StatusCode::OK);

    store.fail_reads.store(false, Ordering::SeqCst);
    assert!(!h.manager.toggle("weather").await.unwrap());
    assert_eq!(h.get("/custom/weather").await, StatusCode::NOT_FOUND);
}

// =============================================================================
// Toggle
// =============================================================================

#[tokio::test]
async fn test_toggle_twice_restores_artifacts() {
    let h = Harness::new(&["weather"]);
    h.add_full_plugin("weather");
    h.manager.discover().await.unwrap();

    let before = artifact_names(&h.manager);
    assert_eq!(before.0, vec!["weather::before_reply"]);
    assert_eq!(before.1, vec!["weather_tool"]);
    assert_eq!(before.2, vec!["/custom/weather"]);
    assert_eq!(h.get("/custom/weather").await, StatusCode::OK);

    assert!(!h.manager.toggle("weather").await.unwrap());
    let (hooks, tools, endpoints) = artifact_names(&h.manager);
    assert!(hooks.is_empty() && tools.is_empty() && endpoints.is_empty());
    assert!(h.router.routes().is_empty());
    assert!(h.active_set().await.is_empty());

    assert!(h.manager.toggle("weather").await.unwrap());
    assert_eq!(artifact_names(&h.manager), before);
    assert_eq!(h.get("/custom/weather").await, StatusCode::OK);
    assert_eq!(h.active_set().await, vec!["weather"]);
}

#[tokio::test]
async fn test_toggle_unknown_plugin() {
    let h = Harness::new(&["a"]);
    h.manager.discover().await.unwrap();

    let err = h.manager.toggle("ghost").await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound(id) if id == "ghost"));
    assert_eq!(h.active_set().await, vec!["a"]);
}

#[tokio::test]
async fn test_failed_activation_leaves_active_set_untouched() {
    let h = Harness::new(&[]);
    h.add_folder("empty", "");
    h.manager.discover().await.unwrap();

    assert!(h.manager.toggle("empty").await.is_err());
    assert!(h.active_set().await.is_empty());
    assert!(!h.manager.plugin("empty").unwrap().active);
}

#[tokio::test]
async fn test_toggle_leaves_state_alone_when_active_set_cannot_be_stored() {
    let store = Arc::new(FlakyStore::new(&["weather"]));
    let h = Harness::with_store(store.clone());
    h.add_full_plugin("weather");
    h.add_full_plugin("radar");
    h.manager.discover().await.unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);

    assert!(h.manager.toggle("weather").await.is_err());
    assert!(h.manager.plugin("weather").unwrap().active);
    assert_eq!(h.get("/custom/weather").await, StatusCode::OK);

    assert!(h.manager.toggle("radar").await.is_err());
    assert!(!h.manager.plugin("radar").unwrap().active);
    assert_eq!(h.get("/custom/radar").await, StatusCode::NOT_FOUND);
    let (hooks, tools, _) = artifact_names(&h.manager);
    assert_eq!(hooks, vec!["weather::before_reply"]);
    assert_eq!(tools, vec!["weather_tool"]);
    assert_eq!(h.active_set().await, vec!["weather"]);
}

#[tokio::test]
async fn test_activated_override_failure_aborts_activation() {
    let h = Harness::new(&[]);
    h.add_folder("picky", "");
    h.manager.native_units().register_fn("picky", "main", |r| {
        r.hook_fn("before_reply", 1, |_| Ok(None));
        r.plugin_override(PluginOverride::activated(|_| {
            Err(PluginError::execution_error("picky", "missing API key"))
        }));
        Ok(())
    });
    h.manager.discover().await.unwrap();

    assert!(h.manager.toggle("picky").await.is_err());
    assert_eq!(h.manager.snapshot().hook_count(), 0);
    assert!(!h.manager.plugin("picky").unwrap().active);
}

#[tokio::test]
async fn test_endpoints_are_unmounted_before_deactivated_override() {
    let h = Harness::new(&["tidy"]);
    h.add_folder("tidy", "");
    let router = h.router.clone();
    let mounted_during_override = Arc::new(AtomicBool::new(true));
    let seen = mounted_during_override.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.manager.native_units().register_fn("tidy", "main", move |r| {
        r.endpoint(EndpointDecl::get("/tidy", |_, _| Ok(Value::Null)));
        let router = router.clone();
        let seen = seen.clone();
        let counter = counter.clone();
        r.plugin_override(PluginOverride::deactivated(move |info| {
            assert_eq!(info.id, "tidy");
            counter.fetch_add(1, Ordering::SeqCst);
            seen.store(router.is_mounted(&Method::GET, "/custom/tidy"), Ordering::SeqCst);
            Ok(())
        }));
        Ok(())
    });
    h.manager.discover().await.unwrap();
    assert!(h.router.is_mounted(&Method::GET, "/custom/tidy"));

    h.manager.toggle("tidy").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!mounted_during_override.load(Ordering::SeqCst));
}

// =============================================================================
// Dependencies
// =============================================================================

#[tokio::test]
async fn test_satisfied_requirements_skip_install() {
    let h = Harness::with_packages(&["ready"], RecordingPackages::with_installed(&["requests"]));
    let path = h.add_folder("ready", "");
    std::fs::write(path.join("requirements.txt"), "# http\nRequests>=2.0\n").unwrap();
    h.manager.native_units().register_fn("ready", "main", |_| Ok(()));

    let report = h.manager.discover().await.unwrap();
    assert_eq!(report.active, vec!["ready"]);
    assert!(h.packages.install_calls.lock().is_empty());
}

#[tokio::test]
async fn test_missing_requirements_are_installed() {
    let h = Harness::with_packages(&[], RecordingPackages::with_installed(&["requests"]));
    let path = h.add_folder("numeric", "");
    std::fs::write(path.join("requirements.txt"), "requests\nnumpy==1.26\n").unwrap();
    h.manager.native_units().register_fn("numeric", "main", |_| Ok(()));
    h.manager.discover().await.unwrap();

    assert!(h.manager.toggle("numeric").await.unwrap());
    assert_eq!(*h.packages.install_calls.lock(), vec![vec!["numpy".to_string()]]);
}

#[tokio::test]
async fn test_failed_install_rolls_back_and_keeps_plugin_inactive() {
    let packages = RecordingPackages::default();
    packages.fail_install.store(true, Ordering::SeqCst);
    let h = Harness::with_packages(&[], packages);
    let path = h.add_folder("heavy", "");
    std::fs::write(path.join("requirements.txt"), "torch\n").unwrap();
    h.manager.native_units().register_fn("heavy", "main", |_| Ok(()));
    h.manager.discover().await.unwrap();

    let err = h.manager.toggle("heavy").await.unwrap_err();
    assert!(matches!(err, PluginError::DependencyInstall { plugin, .. } if plugin == "heavy"));
    assert_eq!(*h.packages.uninstall_calls.lock(), vec![vec!["torch".to_string()]]);
    assert!(!h.manager.plugin("heavy").unwrap().active);
    assert!(h.active_set().await.is_empty());
}

// =============================================================================
// Settings
// =============================================================================

const SETTINGS_MANIFEST: &str = r#"
[plugin]
name = "Greeter"

[settings.greeting]
type = "string"
default = "hello"

[settings.limit]
type = "integer"
default = 3
validation = { min = 1, max = 10 }
"#;

#[tokio::test]
async fn test_settings_are_materialized_and_validated() {
    let h = Harness::new(&["greeter"]);
    let path = h.add_folder("greeter", SETTINGS_MANIFEST);
    h.manager.native_units().register_fn("greeter", "main", |_| Ok(()));
    h.manager.discover().await.unwrap();

    let stored: Value =
        serde_json::from_str(&std::fs::read_to_string(path.join("settings.json")).unwrap())
            .unwrap();
    assert_eq!(stored, json!({"greeting": "hello", "limit": 3}));

    let err = h
        .manager
        .save_plugin_settings("greeter", json!({"limit": 99}))
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::SettingsValidation { .. }));
    assert_eq!(
        h.manager.plugin_settings("greeter").await.unwrap(),
        json!({"greeting": "hello", "limit": 3})
    );

    let saved = h
        .manager
        .save_plugin_settings("greeter", json!({"limit": 5}))
        .await
        .unwrap();
    assert_eq!(saved, json!({"greeting": "hello", "limit": 5}));

    let schema = h.manager.plugin_settings_schema("greeter").await.unwrap();
    assert_eq!(schema["properties"]["limit"]["type"], "integer");
}

#[tokio::test]
async fn test_settings_overrides_take_precedence() {
    let h = Harness::new(&["custom"]);
    let path = h.add_folder("custom", SETTINGS_MANIFEST);
    let saved = Arc::new(Mutex::new(Value::Null));
    let sink = saved.clone();
    h.manager.native_units().register_fn("custom", "main", move |r| {
        let sink = sink.clone();
        r.plugin_override(PluginOverride::load_settings(|| Ok(json!({"from": "override"}))));
        r.plugin_override(PluginOverride::save_settings(move |value| {
            *sink.lock() = value.clone();
            Ok(value)
        }));
        Ok(())
    });
    h.manager.discover().await.unwrap();

    // No file is written when the plugin loads its own settings
    assert!(!path.join("settings.json").exists());
    assert_eq!(
        h.manager.plugin_settings("custom").await.unwrap(),
        json!({"from": "override"})
    );

    h.manager
        .save_plugin_settings("custom", json!({"limit": 2}))
        .await
        .unwrap();
    assert_eq!(*saved.lock(), json!({"limit": 2}));
}

// =============================================================================
// Install / uninstall
// =============================================================================

#[tokio::test]
async fn test_install_archive_activates_plugin() {
    let h = Harness::new(&[]);
    h.manager.discover().await.unwrap();
    h.manager
        .native_units()
        .register_fn("zipped", "main", |r| {
            r.tool(ToolDecl::from_fn("unzip", "", |_, _| Ok("done".into())));
            Ok(())
        });

    let archive = h.dir.path().join("zipped.zip");
    write_zip(
        &archive,
        &[("zipped/plugin.toml", "[plugin]\nname = \"Zipped\"\nversion = \"1.0.0\"\n")],
    );

    let info = h.manager.install(&archive).await.unwrap();
    assert_eq!(info.id, "zipped");
    assert!(info.active);
    assert_eq!(h.active_set().await, vec!["zipped"]);
    assert_eq!(
        h.manager
            .run_tool("unzip", "", &PluginContext::new())
            .await
            .unwrap(),
        "done"
    );

    // Same id again: upgrade in place
    let upgrade = h.dir.path().join("zipped-2.zip");
    write_zip(
        &upgrade,
        &[("zipped/plugin.toml", "[plugin]\nname = \"Zipped\"\nversion = \"2.0.0\"\n")],
    );
    let info = h.manager.install(&upgrade).await.unwrap();
    assert_eq!(info.manifest.plugin.version, "2.0.0");
    assert!(info.active);
    assert_eq!(h.manager.tools().len(), 1);
    assert_eq!(h.manager.list_plugins().len(), 1);
}

#[tokio::test]
async fn test_install_of_broken_archive_leaves_nothing() {
    let h = Harness::new(&[]);
    h.manager.discover().await.unwrap();

    let archive = h.dir.path().join("broken.zip");
    std::fs::write(&archive, b"definitely not a zip").unwrap();

    assert!(h.manager.install(&archive).await.is_err());
    assert_eq!(std::fs::read_dir(h.plugins_dir()).unwrap().count(), 0);
    assert!(h.manager.list_plugins().is_empty());
}

#[tokio::test]
async fn test_uninstall_active_plugin_removes_routes_and_folder() {
    let h = Harness::new(&["weather"]);
    h.add_full_plugin("weather");
    h.manager.discover().await.unwrap();
    assert_eq!(h.get("/custom/weather").await, StatusCode::OK);

    h.manager.uninstall("weather").await.unwrap();

    assert_eq!(h.get("/custom/weather").await, StatusCode::NOT_FOUND);
    assert!(!h.plugins_dir().join("weather").exists());
    assert!(!h.manager.plugin_exists("weather"));
    assert!(h.active_set().await.is_empty());
    assert!(h.manager.tools().is_empty());

    let err = h.manager.uninstall("weather").await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound(_)));
}

#[tokio::test]
async fn test_core_plugin_can_be_deactivated_but_not_removed() {
    let h = Harness::new(&["core"]);
    h.add_full_plugin("core");
    h.manager.discover().await.unwrap();

    assert!(matches!(
        h.manager.uninstall("core").await,
        Err(PluginError::CoreProtected(_))
    ));
    assert!(h.manager.plugin("core").unwrap().active);

    assert!(!h.manager.toggle("core").await.unwrap());
    assert!(h.plugins_dir().join("core").exists());
}

// =============================================================================
// Events
// =============================================================================

struct Collector {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn event_types(&self) -> Vec<EventType> {
        vec![EventType::PluginActivated, EventType::PluginDeactivated]
    }
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let h = Harness::new(&[]);
    h.add_full_plugin("noisy");
    let collector = Arc::new(Collector {
        events: Mutex::new(Vec::new()),
    });
    h.manager
        .event_bus()
        .subscribe("test", collector.clone())
        .await;
    h.manager.discover().await.unwrap();

    h.manager.toggle("noisy").await.unwrap();
    h.manager.toggle("noisy").await.unwrap();

    // Handlers run on their own tasks
    for _ in 0..100 {
        if collector.events.lock().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let events = collector.events.lock().clone();
    assert_eq!(events.len(), 2);
    assert!(events.contains(&Event::PluginActivated {
        plugin_id: "noisy".into(),
        hooks: 1,
        tools: 1,
        endpoints: 1,
    }));
    assert!(events.contains(&Event::PluginDeactivated {
        plugin_id: "noisy".into(),
    }));
}
