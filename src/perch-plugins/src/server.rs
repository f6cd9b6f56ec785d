//! Live route table for plugin endpoints.
//!
//! Axum routers are immutable once built, so plugin routes are not added to
//! the router itself. [`DynamicRouter`] keeps its own table and is exposed as
//! a router whose fallback resolves the table on every request; mounting and
//! unmounting take effect immediately.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::{PluginContext, scope_plugin};
use crate::endpoints::{EndpointFn, EndpointRequest, RouteKey, RouteMount, RouteSpec};
use crate::error::panic_message;
use crate::{PluginError, Result};

/// Header carrying the caller's user id into the plugin context.
pub const USER_HEADER: &str = "x-user-id";
/// Header carrying the caller's session id into the plugin context.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct MountedRoute {
    method: Method,
    path: String,
    segments: Vec<Segment>,
    tags: Vec<String>,
    plugin_id: String,
    handler: EndpointFn,
}

impl MountedRoute {
    fn matches(&self, path: &[&str]) -> Option<HashMap<String, String>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        Some(params)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn parse_segments(path: &str) -> Vec<Segment> {
    split_path(path)
        .into_iter()
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

/// A mounted route as listed by [`DynamicRouter::routes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub method: String,
    pub path: String,
    pub tags: Vec<String>,
    pub plugin_id: String,
}

/// Route table shared between the mount capability and the HTTP fallback.
#[derive(Clone, Default)]
pub struct DynamicRouter {
    routes: Arc<RwLock<Vec<MountedRoute>>>,
}

impl DynamicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Axum router serving the mounted routes.
    pub fn router(&self) -> Router {
        Router::new().fallback(dispatch).with_state(self.clone())
    }

    /// Snapshot of the mounted routes.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .iter()
            .map(|r| RouteInfo {
                method: r.method.to_string(),
                path: r.path.clone(),
                tags: r.tags.clone(),
                plugin_id: r.plugin_id.clone(),
            })
            .collect()
    }

    pub fn is_mounted(&self, method: &Method, path: &str) -> bool {
        self.routes
            .read()
            .iter()
            .any(|r| &r.method == method && r.path == path)
    }

    fn resolve(&self, method: &Method, path: &str) -> Resolution {
        let parts = split_path(path);
        let routes = self.routes.read();
        let mut path_known = false;

        for route in routes.iter() {
            if let Some(params) = route.matches(&parts) {
                if &route.method == method {
                    return Resolution::Found {
                        plugin_id: route.plugin_id.clone(),
                        handler: route.handler.clone(),
                        params,
                    };
                }
                path_known = true;
            }
        }

        if path_known {
            Resolution::MethodNotAllowed
        } else {
            Resolution::NotFound
        }
    }
}

impl RouteMount for DynamicRouter {
    fn mount_route(&self, spec: RouteSpec) -> Result<()> {
        let segments = parse_segments(&spec.path);
        let mut routes = self.routes.write();

        if let Some(existing) = routes
            .iter_mut()
            .find(|r| r.method == spec.method && r.segments == segments)
        {
            if existing.plugin_id != spec.plugin_id {
                return Err(PluginError::AlreadyExists(format!(
                    "{} {} (mounted by plugin {})",
                    spec.method, spec.path, existing.plugin_id
                )));
            }
            existing.handler = spec.handler;
            existing.tags = spec.tags;
            return Ok(());
        }

        tracing::debug!("Mounting {} {} for {}", spec.method, spec.path, spec.plugin_id);
        routes.push(MountedRoute {
            method: spec.method,
            path: spec.path,
            segments,
            tags: spec.tags,
            plugin_id: spec.plugin_id,
            handler: spec.handler,
        });
        Ok(())
    }

    fn unmount_route(&self, key: &RouteKey) -> bool {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| {
            !(r.method == key.method && r.path == key.path && r.plugin_id == key.plugin_id)
        });
        routes.len() != before
    }
}

enum Resolution {
    Found {
        plugin_id: String,
        handler: EndpointFn,
        params: HashMap<String, String>,
    },
    MethodNotAllowed,
    NotFound,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": detail.into() }))).into_response()
}

fn context_from_headers(headers: &HeaderMap) -> PluginContext {
    let mut context = PluginContext::new();
    if let Some(user) = headers.get(USER_HEADER).and_then(|v| v.to_str().ok()) {
        context = context.with_user(user);
    }
    if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        context = context.with_session(session);
    }
    context
}

async fn dispatch(
    State(router): State<DynamicRouter>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let (plugin_id, handler, params) = match router.resolve(&method, &path) {
        Resolution::Found {
            plugin_id,
            handler,
            params,
        } => (plugin_id, handler, params),
        Resolution::MethodNotAllowed => {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        }
        Resolution::NotFound => return error_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    let query = uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    let request = EndpointRequest {
        method,
        path,
        params,
        query,
        body,
    };
    let context = context_from_headers(&headers);

    let call = scope_plugin(plugin_id.clone(), async move { handler(request, context).await });
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(response)) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response.body)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Error in endpoint {} of plugin {}: {}", uri.path(), plugin_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Endpoint {} of plugin {} {}", uri.path(), plugin_id, message);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_plugin_id;
    use crate::endpoints::EndpointDecl;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashSet;
    use tower::ServiceExt;

    fn active(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn call(router: &DynamicRouter, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, "alice")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn owned(mut decl: EndpointDecl, plugin_id: &str) -> EndpointDecl {
        decl.plugin_id = plugin_id.to_string();
        decl
    }

    #[tokio::test]
    async fn test_mounted_route_is_served() {
        let router = DynamicRouter::new();
        let decl = owned(
            EndpointDecl::get("/items/{id}", |req, ctx| {
                Ok(json!({
                    "id": req.params["id"],
                    "q": req.query.get("q"),
                    "user": ctx.user_id,
                    "owner": current_plugin_id(),
                }))
            })
            .with_prefix("/custom"),
            "shop",
        );
        decl.activate(&router, &active(&["shop"])).unwrap();

        let (status, body) = call(&router, Method::GET, "/custom/items/42?q=red", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"id": "42", "q": "red", "user": "alice", "owner": "shop"})
        );
    }

    #[tokio::test]
    async fn test_unmounted_route_is_not_found() {
        let router = DynamicRouter::new();
        let decl = owned(EndpointDecl::post("/echo", |req, _| Ok(req.body)), "echo");
        decl.activate(&router, &active(&["echo"])).unwrap();

        let (status, body) = call(&router, Method::POST, "/echo", r#"{"a":1}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"a": 1}));

        let (status, _) = call(&router, Method::GET, "/echo", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        decl.deactivate(&router);
        let (status, body) = call(&router, Method::POST, "/echo", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Not Found");
        assert!(router.routes().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failures_are_500() {
        let router = DynamicRouter::new();
        owned(
            EndpointDecl::get("/fail", |_, _| Err(PluginError::execution_error("p", "nope"))),
            "p",
        )
        .activate(&router, &active(&["p"]))
        .unwrap();
        owned(EndpointDecl::get("/panic", |_, _| panic!("boom")), "p")
            .activate(&router, &active(&["p"]))
            .unwrap();

        let (status, body) = call(&router, Method::GET, "/fail", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("nope"));

        let (status, body) = call(&router, Method::GET, "/panic", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_route_owned_by_another_plugin_is_rejected() {
        let router = DynamicRouter::new();
        owned(EndpointDecl::get("/shared", |_, _| Ok(Value::Null)), "first")
            .activate(&router, &active(&["first", "second"]))
            .unwrap();

        let second = owned(EndpointDecl::get("/shared", |_, _| Ok(Value::Null)), "second");
        assert!(second.activate(&router, &active(&["first", "second"])).is_err());
        assert!(!second.is_mounted());

        // Only the owner can unmount
        assert!(!router.unmount_route(&RouteKey {
            method: Method::GET,
            path: "/shared".into(),
            plugin_id: "second".into(),
        }));
        assert!(router.is_mounted(&Method::GET, "/shared"));
    }
}
