//! HTTP management surface for plugins.
//!
//! Mount the router returned by [`router`] wherever the host serves its admin
//! API:
//!
//! | Method | Path | Action |
//! |---|---|---|
//! | GET | `/plugins?query=` | installed + marketplace listing |
//! | GET | `/plugins/{id}` | manifest of an installed plugin |
//! | PUT | `/plugins/{id}/toggle` | activate / deactivate |
//! | GET | `/plugins/{id}/settings` | `{id, value, schema}` |
//! | PUT | `/plugins/{id}/settings` | validate and store settings |
//! | DELETE | `/plugins/{id}` | uninstall |
//! | POST | `/plugins/upload?filename=` | install the archive sent as body |
//! | POST | `/plugins/marketplace` | install `{url}` from the marketplace |

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

use crate::PluginError;
use crate::archive::ArchiveFormat;
use crate::manager::{ListedPlugin, PluginManager};
use crate::manifest::PluginManifest;

/// Largest archive accepted by the upload route.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Admin API error.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    /// The marketplace failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<PluginError> for AdminError {
    fn from(error: PluginError) -> Self {
        match &error {
            PluginError::NotFound(_) | PluginError::ToolNotFound(_) => {
                Self::NotFound(error.to_string())
            }
            PluginError::CoreProtected(_) => Self::Forbidden(error.to_string()),
            PluginError::AlreadyExists(_) => Self::Conflict(error.to_string()),
            PluginError::SettingsValidation { message, .. } => Self::BadRequest(message.clone()),
            PluginError::Archive(_) | PluginError::InvalidManifest { .. } => {
                Self::BadRequest(error.to_string())
            }
            PluginError::Marketplace(_) => Self::Upstream(error.to_string()),
            _ => Self::Internal(error.to_string()),
        }
    }
}

pub type AdminResult<T> = std::result::Result<T, AdminError>;

type SharedManager = State<Arc<PluginManager>>;

/// Admin routes over `manager`.
pub fn router(manager: Arc<PluginManager>) -> Router {
    Router::new()
        .route("/plugins", get(list_plugins))
        .route(
            "/plugins/upload",
            post(upload_plugin).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/plugins/marketplace", post(install_from_marketplace))
        .route("/plugins/{id}", get(get_plugin).delete(delete_plugin))
        .route("/plugins/{id}/toggle", put(toggle_plugin))
        .route(
            "/plugins/{id}/settings",
            get(get_plugin_settings).put(put_plugin_settings),
        )
        .with_state(manager)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub query: Option<String>,
}

async fn list_plugins(
    State(manager): SharedManager,
    Query(params): Query<ListQuery>,
) -> Json<Vec<ListedPlugin>> {
    Json(manager.list_available(params.query.as_deref()).await)
}

async fn get_plugin(
    State(manager): SharedManager,
    Path(id): Path<String>,
) -> AdminResult<Json<PluginManifest>> {
    let info = manager
        .plugin(&id)
        .ok_or_else(|| AdminError::NotFound(format!("Plugin {}", id)))?;
    Ok(Json(info.manifest))
}

async fn toggle_plugin(
    State(manager): SharedManager,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let active = manager.toggle(&id).await.inspect_err(|e| {
        tracing::error!("Could not toggle plugin {}: {}", id, e);
    })?;
    Ok(Json(json!({ "id": id, "active": active })))
}

async fn get_plugin_settings(
    State(manager): SharedManager,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    let value = manager.plugin_settings(&id).await?;
    let mut schema = manager.plugin_settings_schema(&id).await?;

    let no_properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .is_none_or(|p| p.is_empty());
    if no_properties {
        schema = json!({});
    }

    Ok(Json(json!({ "id": id, "value": value, "schema": schema })))
}

async fn put_plugin_settings(
    State(manager): SharedManager,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> AdminResult<Json<Value>> {
    let value = manager.save_plugin_settings(&id, payload).await?;
    Ok(Json(json!({ "id": id, "value": value })))
}

async fn delete_plugin(
    State(manager): SharedManager,
    Path(id): Path<String>,
) -> AdminResult<Json<Value>> {
    manager.uninstall(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

async fn upload_plugin(
    State(manager): SharedManager,
    Query(params): Query<UploadQuery>,
    body: Bytes,
) -> AdminResult<Json<PluginManifest>> {
    // Only the final component; the name must not pick the write location
    let filename = std::path::Path::new(&params.filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if ArchiveFormat::detect(&filename).is_none() {
        return Err(AdminError::BadRequest(format!(
            "Archive type of `{}` not supported. Admitted types: .zip, .tar, .tar.gz, .tgz",
            params.filename
        )));
    }

    tracing::info!("Uploading plugin {}", filename);
    let upload_dir = tempfile::TempDir::new().map_err(PluginError::from)?;
    let archive_path = upload_dir.path().join(&filename);
    tokio::fs::write(&archive_path, &body)
        .await
        .map_err(PluginError::from)?;

    let info = manager.install(&archive_path).await?;
    Ok(Json(info.manifest))
}

#[derive(Debug, Deserialize)]
pub struct MarketplaceInstall {
    pub url: String,
}

async fn install_from_marketplace(
    State(manager): SharedManager,
    Json(payload): Json<MarketplaceInstall>,
) -> AdminResult<Json<PluginManifest>> {
    let info = manager
        .install_from_marketplace(&payload.url)
        .await
        .inspect_err(|e| {
            tracing::error!("Could not install plugin {} from the marketplace: {}", payload.url, e);
        })?;
    Ok(Json(info.manifest))
}
