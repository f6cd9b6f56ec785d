//! HTTP endpoints exported by plugins.
//!
//! An [`EndpointDecl`] is mounted onto the host server through the narrow
//! [`RouteMount`] capability while its owning plugin is active, and unmounted
//! as soon as the plugin is deactivated.

use axum::http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::PluginContext;
use crate::{PluginError, Result};

/// Request handed to an endpoint handler.
#[derive(Debug, Clone)]
pub struct EndpointRequest {
    pub method: Method,
    /// Request path (including the prefix)
    pub path: String,
    /// Values captured by `{name}` path segments
    pub params: HashMap<String, String>,
    /// Query string parameters
    pub query: HashMap<String, String>,
    /// JSON body (`Null` when absent or not JSON)
    pub body: Value,
}

/// Response produced by an endpoint handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointResponse {
    pub status: u16,
    pub body: Value,
}

impl EndpointResponse {
    /// 200 response.
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn with_status(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// Future returned by an endpoint handler.
pub type EndpointFuture = Pin<Box<dyn Future<Output = Result<EndpointResponse>> + Send>>;

/// Endpoint handler.
pub type EndpointFn = Arc<dyn Fn(EndpointRequest, PluginContext) -> EndpointFuture + Send + Sync>;

/// Route registered on the host server.
#[derive(Clone)]
pub struct RouteSpec {
    pub method: Method,
    /// Full path (prefix + path)
    pub path: String,
    pub tags: Vec<String>,
    pub plugin_id: String,
    pub handler: EndpointFn,
}

impl RouteSpec {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            method: self.method.clone(),
            path: self.path.clone(),
            plugin_id: self.plugin_id.clone(),
        }
    }
}

impl fmt::Debug for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSpec")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

/// Identifies a mounted route. Only the owning plugin may remove it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub method: Method,
    pub path: String,
    pub plugin_id: String,
}

/// Mount capability of the host server.
pub trait RouteMount: Send + Sync {
    /// Add a route to the live route table.
    fn mount_route(&self, spec: RouteSpec) -> Result<()>;

    /// Remove a route. Returns `false` when nothing matching was mounted.
    fn unmount_route(&self, key: &RouteKey) -> bool;
}

/// An endpoint declared by a plugin.
#[derive(Clone)]
pub struct EndpointDecl {
    pub path: String,
    /// Route prefix; the configured default applies when unset
    pub prefix: Option<String>,
    pub methods: Vec<Method>,
    /// Tags; the configured defaults apply when empty
    pub tags: Vec<String>,
    /// Owning plugin (stamped at extraction)
    pub plugin_id: String,
    handler: EndpointFn,
    mounted: Arc<AtomicBool>,
}

impl EndpointDecl {
    pub fn new(path: impl Into<String>, methods: Vec<Method>, handler: EndpointFn) -> Self {
        Self {
            path: path.into(),
            prefix: None,
            methods,
            tags: Vec::new(),
            plugin_id: String::new(),
            handler,
            mounted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Endpoint answering 200 with the JSON returned by a synchronous closure.
    pub fn from_fn<F>(path: impl Into<String>, methods: Vec<Method>, f: F) -> Self
    where
        F: Fn(EndpointRequest, PluginContext) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: EndpointFn = Arc::new(move |req, ctx| -> EndpointFuture {
            let f = f.clone();
            Box::pin(async move { f(req, ctx).map(EndpointResponse::ok) })
        });
        Self::new(path, methods, handler)
    }

    /// GET endpoint.
    pub fn get<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(EndpointRequest, PluginContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self::from_fn(path, vec![Method::GET], f)
    }

    /// POST endpoint.
    pub fn post<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(EndpointRequest, PluginContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self::from_fn(path, vec![Method::POST], f)
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Prefix + path, always starting with a single `/`.
    pub fn full_path(&self) -> String {
        join_path(self.prefix.as_deref().unwrap_or_default(), &self.path)
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Mount the endpoint if its owner is active.
    ///
    /// Returns whether routes were added by this call.
    pub fn activate(&self, server: &dyn RouteMount, active_ids: &HashSet<String>) -> Result<bool> {
        if !active_ids.contains(&self.plugin_id) {
            return Ok(false);
        }
        if self
            .mounted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        let path = self.full_path();
        for method in &self.methods {
            let spec = RouteSpec {
                method: method.clone(),
                path: path.clone(),
                tags: self.tags.clone(),
                plugin_id: self.plugin_id.clone(),
                handler: self.handler.clone(),
            };
            if let Err(e) = server.mount_route(spec) {
                self.unmount_all(server);
                self.mounted.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        tracing::info!(
            "Mounted endpoint {} {} for plugin {}",
            self.method_list(),
            path,
            self.plugin_id
        );
        Ok(true)
    }

    /// Unmount the endpoint. Returns whether it was mounted.
    pub fn deactivate(&self, server: &dyn RouteMount) -> bool {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.unmount_all(server);
        tracing::info!(
            "Unmounted endpoint {} for plugin {}",
            self.full_path(),
            self.plugin_id
        );
        true
    }

    fn unmount_all(&self, server: &dyn RouteMount) {
        let path = self.full_path();
        for method in &self.methods {
            server.unmount_route(&RouteKey {
                method: method.clone(),
                path: path.clone(),
                plugin_id: self.plugin_id.clone(),
            });
        }
    }

    fn method_list(&self) -> String {
        self.methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Serializable summary.
    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            path: self.full_path(),
            methods: self.methods.iter().map(|m| m.to_string()).collect(),
            tags: self.tags.clone(),
            plugin_id: self.plugin_id.clone(),
            mounted: self.is_mounted(),
        }
    }
}

impl fmt::Debug for EndpointDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDecl")
            .field("path", &self.full_path())
            .field("methods", &self.methods)
            .field("plugin_id", &self.plugin_id)
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

/// Endpoint as listed by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSummary {
    pub path: String,
    pub methods: Vec<String>,
    pub tags: Vec<String>,
    pub plugin_id: String,
    pub mounted: bool,
}

/// Parse an HTTP method name (case-insensitive).
pub fn parse_method(name: &str) -> Result<Method> {
    Method::from_bytes(name.trim().to_uppercase().as_bytes())
        .map_err(|_| PluginError::ConfigError(format!("Invalid HTTP method: {}", name)))
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let path = path.trim_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", path),
        (false, true) => format!("/{}", prefix),
        (false, false) => format!("/{}/{}", prefix, path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingServer {
        routes: Mutex<Vec<RouteKey>>,
    }

    impl RouteMount for RecordingServer {
        fn mount_route(&self, spec: RouteSpec) -> Result<()> {
            self.routes.lock().push(spec.key());
            Ok(())
        }

        fn unmount_route(&self, key: &RouteKey) -> bool {
            let mut routes = self.routes.lock();
            let before = routes.len();
            routes.retain(|k| k != key);
            routes.len() != before
        }
    }

    fn endpoint() -> EndpointDecl {
        let mut decl = EndpointDecl::from_fn("/hello", vec![Method::GET, Method::POST], |_req, _ctx| {
            Ok(json!("hi"))
        })
        .with_prefix("/custom");
        decl.plugin_id = "greeter".into();
        decl
    }

    #[test]
    fn test_full_path() {
        assert_eq!(endpoint().full_path(), "/custom/hello");
        assert_eq!(join_path("", "x"), "/x");
        assert_eq!(join_path("/api/", "/"), "/api");
    }

    #[test]
    fn test_activate_requires_active_owner() {
        let server = RecordingServer::default();
        let decl = endpoint();

        assert!(!decl.activate(&server, &HashSet::new()).unwrap());
        assert!(server.routes.lock().is_empty());

        let active: HashSet<String> = ["greeter".to_string()].into();
        assert!(decl.activate(&server, &active).unwrap());
        assert_eq!(server.routes.lock().len(), 2);

        // Idempotent
        assert!(!decl.activate(&server, &active).unwrap());
        assert_eq!(server.routes.lock().len(), 2);
    }

    #[test]
    fn test_deactivate_is_idempotent_and_shared_between_clones() {
        let server = RecordingServer::default();
        let decl = endpoint();
        let clone = decl.clone();
        let active: HashSet<String> = ["greeter".to_string()].into();

        decl.activate(&server, &active).unwrap();
        assert!(clone.is_mounted());

        assert!(clone.deactivate(&server));
        assert!(!decl.deactivate(&server));
        assert!(server.routes.lock().is_empty());
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method(" Delete ").unwrap(), Method::DELETE);
        assert!(parse_method("not a method").is_err());
    }
}
