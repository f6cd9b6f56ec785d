//! Execution context forwarded into plugin code.
//!
//! The engine never inspects a [`PluginContext`]; it hands the caller's value
//! to every hook, tool and endpoint untouched. Separately, every call into
//! plugin code runs inside a task-local scope naming the plugin that owns the
//! code, which is what [`current_plugin_id`] (and
//! [`PluginManager::get_plugin`](crate::PluginManager::get_plugin)) read.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

/// Context provided by the host to plugin code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginContext {
    /// Conversation/session ID
    pub session_id: Option<String>,

    /// User on whose behalf the call runs
    pub user_id: Option<String>,

    /// Current message ID
    pub message_id: Option<String>,

    /// Extra data
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session ID.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the user ID.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the message ID.
    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Add extra data.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

tokio::task_local! {
    static CURRENT_PLUGIN: String;
}

/// Run a future with `plugin_id` recorded as the owner of the code being executed.
pub async fn scope_plugin<F>(plugin_id: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_PLUGIN.scope(plugin_id.into(), fut).await
}

/// Run a closure with `plugin_id` recorded as the owner of the code being executed.
pub fn sync_scope_plugin<R>(plugin_id: impl Into<String>, f: impl FnOnce() -> R) -> R {
    CURRENT_PLUGIN.sync_scope(plugin_id.into(), f)
}

/// Id of the plugin whose code is currently executing, if any.
pub fn current_plugin_id() -> Option<String> {
    CURRENT_PLUGIN.try_with(|id| id.clone()).ok()
}
