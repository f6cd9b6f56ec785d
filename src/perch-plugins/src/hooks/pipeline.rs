//! Hook pipeline: ordered fold over the hooks sharing a name.

use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use super::types::{HookCall, HookDecl};
use crate::Result;
use crate::context::{PluginContext, scope_plugin};
use crate::error::{PluginError, panic_message};

/// Sort hooks into execution order: priority descending, then plugin id,
/// then declaration order.
pub fn sort_hooks(hooks: &mut [HookDecl]) {
    hooks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.plugin_id.cmp(&b.plugin_id))
    });
}

/// Executes the hooks registered under one name.
///
/// Each hook receives its own copy of the carrier and of the extra
/// arguments. A hook returning `None` or JSON `null` leaves the carrier
/// unchanged; a failing or panicking hook is logged and skipped, the carrier
/// it received is kept.
pub struct HookPipeline<'a> {
    hooks: &'a [HookDecl],
    diagnostics: &'a HashMap<String, String>,
}

impl<'a> HookPipeline<'a> {
    /// `hooks` must already be in execution order (see [`sort_hooks`]).
    /// `diagnostics` maps plugin ids to the message logged when their code fails.
    pub fn new(hooks: &'a [HookDecl], diagnostics: &'a HashMap<String, String>) -> Self {
        Self { hooks, diagnostics }
    }

    /// Run the pipeline.
    ///
    /// With no arguments every hook is called for its side effects and
    /// nothing is returned. Otherwise the first argument is the carrier and
    /// the final carrier is returned.
    pub async fn run(&self, mut args: Vec<Value>, context: &PluginContext) -> Option<Value> {
        if args.is_empty() {
            for hook in self.hooks {
                let call = HookCall {
                    value: None,
                    args: Vec::new(),
                    context: context.clone(),
                };
                if let Err(e) = self.invoke(hook, call).await {
                    self.report(hook, &e);
                }
            }
            return None;
        }

        let extra = args.split_off(1);
        let mut carrier = args.pop()?;

        for hook in self.hooks {
            let call = HookCall {
                value: Some(carrier.clone()),
                args: extra.clone(),
                context: context.clone(),
            };
            match self.invoke(hook, call).await {
                Ok(Some(value)) if !value.is_null() => carrier = value,
                Ok(_) => {}
                Err(e) => self.report(hook, &e),
            }
        }

        Some(carrier)
    }

    async fn invoke(&self, hook: &HookDecl, call: HookCall) -> Result<Option<Value>> {
        tracing::debug!(
            "Executing {} with priority {}",
            hook.label(),
            hook.priority
        );

        // The call itself runs inside the future so a panic while building it
        // is caught as well.
        let fut = scope_plugin(hook.plugin_id.clone(), async move { hook.call(call).await });
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(PluginError::hook_error(&hook.plugin_id, &hook.name, e.to_string())),
            Err(payload) => Err(PluginError::hook_error(
                &hook.plugin_id,
                &hook.name,
                panic_message(payload.as_ref()),
            )),
        }
    }

    fn report(&self, hook: &HookDecl, error: &PluginError) {
        tracing::error!("Error in {}: {}", hook.label(), error);
        if let Some(diagnostic) = self.diagnostics.get(&hook.plugin_id) {
            tracing::warn!("{}", diagnostic);
        }
    }
}
