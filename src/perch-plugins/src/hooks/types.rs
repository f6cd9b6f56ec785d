//! Core hook types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Result;
use crate::context::PluginContext;

/// Hook priority - higher values run first.
///
/// Hooks sharing a priority run in plugin id order, then in the order the
/// plugin declared them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookPriority(pub i32);

impl HookPriority {
    /// Priority of hooks that do not declare one.
    pub const DEFAULT: Self = Self(1);
}

impl Default for HookPriority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i32> for HookPriority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for HookPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arguments of a single hook invocation.
///
/// Every invocation receives its own copies of the carrier and of the extra
/// arguments, so a hook may mutate them freely.
#[derive(Debug, Clone)]
pub struct HookCall {
    /// Carrier value; `None` when the hook is executed without arguments
    pub value: Option<Value>,
    /// Extra arguments following the carrier
    pub args: Vec<Value>,
    /// Caller context, forwarded verbatim
    pub context: PluginContext,
}

/// Future returned by a hook. `Ok(None)` means "leave the carrier unchanged".
pub type HookFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

/// Hook function.
pub type HookFn = Arc<dyn Fn(HookCall) -> HookFuture + Send + Sync>;

/// A hook declared by a plugin.
#[derive(Clone)]
pub struct HookDecl {
    /// Hook name (the pipeline it joins)
    pub name: String,
    /// Execution priority
    pub priority: HookPriority,
    /// Owning plugin (stamped at extraction)
    pub plugin_id: String,
    function: HookFn,
}

impl HookDecl {
    /// Create a hook from a raw hook function.
    pub fn new(name: impl Into<String>, priority: impl Into<HookPriority>, function: HookFn) -> Self {
        Self {
            name: name.into(),
            priority: priority.into(),
            plugin_id: String::new(),
            function,
        }
    }

    /// Create a hook from an async closure.
    pub fn from_async<F, Fut>(name: impl Into<String>, priority: impl Into<HookPriority>, f: F) -> Self
    where
        F: Fn(HookCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let function: HookFn = Arc::new(move |call| -> HookFuture { Box::pin(f(call)) });
        Self::new(name, priority, function)
    }

    /// Create a hook from a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, priority: impl Into<HookPriority>, f: F) -> Self
    where
        F: Fn(HookCall) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let function: HookFn = Arc::new(move |call| -> HookFuture {
            let f = f.clone();
            Box::pin(async move { f(call) })
        });
        Self::new(name, priority, function)
    }

    /// Invoke the hook function.
    pub fn call(&self, call: HookCall) -> HookFuture {
        (self.function)(call)
    }

    /// `plugin::hook` label used in logs.
    pub fn label(&self) -> String {
        format!("{}::{}", self.plugin_id, self.name)
    }
}

impl fmt::Debug for HookDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookDecl")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_priority() {
        assert_eq!(HookPriority::default(), HookPriority(1));
        assert!(HookPriority(5) > HookPriority::DEFAULT);
    }

    #[tokio::test]
    async fn test_sync_and_async_constructors() {
        let sync_hook = HookDecl::from_fn("h", 2, |call| {
            Ok(call.value.map(|v| json!(format!("{}!", v.as_str().unwrap_or_default()))))
        });
        let async_hook = HookDecl::from_async("h", HookPriority::DEFAULT, |call: HookCall| async move {
            Ok(Some(json!(call.args.len())))
        });

        let call = HookCall {
            value: Some(json!("hi")),
            args: vec![json!(1), json!(2)],
            context: PluginContext::new(),
        };

        assert_eq!(sync_hook.call(call.clone()).await.unwrap(), Some(json!("hi!")));
        assert_eq!(async_hook.call(call).await.unwrap(), Some(json!(2)));
        assert_eq!(sync_hook.priority, HookPriority(2));
        assert!(sync_hook.plugin_id.is_empty());
    }
}
