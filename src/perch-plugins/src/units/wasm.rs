//! WASM code units.
//!
//! Modules run in a wasmtime sandbox with a fuel budget and a memory cap;
//! every call gets a fresh instance, so no state survives between calls.
//!
//! # ABI
//!
//! A module exports `memory`, `alloc(len: i32) -> i32` and entry functions
//! `(ptr: i32, len: i32) -> i64`. The host writes the UTF-8 JSON input at the
//! pointer returned by `alloc`, calls the entry and reads the output located
//! by the returned `(out_ptr << 32) | out_len`. An empty output or JSON
//! `null` means "no value".

use parking_lot::RwLock;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use wasmtime::{Config, Engine, Instance, Module, ResourceLimiter, Store};

use super::{CodeUnit, Registrar};
use crate::config::WasmLimits;
use crate::endpoints::{EndpointDecl, EndpointFn, EndpointFuture, EndpointResponse, parse_method};
use crate::hooks::{HookDecl, HookFn, HookFuture, HookPriority};
use crate::manifest::ExportManifest;
use crate::overrides::PluginOverride;
use crate::plugin::PluginInfo;
use crate::settings::SettingsShape;
use crate::tools::{FormDecl, ToolDecl, ToolFn, ToolFuture};
use crate::{PluginError, Result};

/// Maximum number of table elements.
const MAX_TABLE_ELEMENTS: usize = 10_000;

/// Shared wasmtime engine.
pub struct WasmRuntime {
    engine: Engine,
    limits: WasmLimits,
}

impl WasmRuntime {
    pub fn new(limits: WasmLimits) -> Result<Self> {
        let mut config = Config::new();
        // Bounded CPU per call
        config.consume_fuel(true);

        let engine = Engine::new(&config)?;
        Ok(Self { engine, limits })
    }

    /// Compile a module from binary or text format.
    pub fn compile(&self, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)?;
        Ok(self.wrap(module))
    }

    /// Compile a module file.
    pub fn compile_file(&self, path: &Path) -> Result<WasmModule> {
        let module = Module::from_file(&self.engine, path).map_err(|e| {
            PluginError::WasmError(format!("Failed to compile {}: {}", path.display(), e))
        })?;
        Ok(self.wrap(module))
    }

    pub fn limits(&self) -> WasmLimits {
        self.limits
    }

    fn wrap(&self, module: Module) -> WasmModule {
        WasmModule {
            engine: self.engine.clone(),
            module,
            limits: self.limits,
        }
    }
}

/// A compiled module.
#[derive(Clone)]
pub struct WasmModule {
    engine: Engine,
    module: Module,
    limits: WasmLimits,
}

impl WasmModule {
    /// Names of the exported functions.
    pub fn function_exports(&self) -> Vec<String> {
        self.module
            .exports()
            .filter(|e| e.ty().func().is_some())
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Call an entry function with a JSON input.
    pub fn call_json(&self, function: &str, input: &Value) -> Result<Option<Value>> {
        let mut store = Store::new(&self.engine, UnitLimits::new(self.limits.max_memory_bytes));
        store.limiter(|limits| limits);
        store.set_fuel(self.limits.fuel)?;

        let instance = Instance::new(&mut store, &self.module, &[])?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| PluginError::WasmError("Module does not export `memory`".into()))?;
        let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc")?;
        let entry = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, function)
            .map_err(|e| {
                PluginError::WasmError(format!(
                    "Function '{}' not found or wrong signature: {}",
                    function, e
                ))
            })?;

        let bytes = serde_json::to_vec(input)?;
        let len = i32::try_from(bytes.len())
            .map_err(|_| PluginError::WasmError("Input too large".into()))?;
        let ptr = alloc.call(&mut store, len)?;
        memory
            .write(&mut store, ptr as u32 as usize, &bytes)
            .map_err(|e| PluginError::WasmError(format!("Failed to write input: {}", e)))?;

        let packed = entry.call(&mut store, (ptr, len))? as u64;
        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xffff_ffff) as usize;
        if out_len == 0 {
            return Ok(None);
        }

        let memory_size = memory.data_size(&store);
        if out_ptr.checked_add(out_len).is_none_or(|end| end > memory_size) {
            return Err(PluginError::WasmError(format!(
                "Output {}..{} is outside the {} bytes of guest memory",
                out_ptr,
                out_ptr.saturating_add(out_len),
                memory_size
            )));
        }

        let mut output = vec![0u8; out_len];
        memory
            .read(&store, out_ptr, &mut output)
            .map_err(|e| PluginError::WasmError(format!("Failed to read output: {}", e)))?;

        let value: Value = serde_json::from_slice(&output)?;
        Ok((!value.is_null()).then_some(value))
    }
}

/// Store limits for a single call.
struct UnitLimits {
    max_memory_bytes: usize,
}

impl UnitLimits {
    fn new(max_memory_bytes: usize) -> Self {
        Self { max_memory_bytes }
    }
}

impl ResourceLimiter for UnitLimits {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory_bytes {
            tracing::warn!(
                current_bytes = current,
                desired_bytes = desired,
                max_bytes = self.max_memory_bytes,
                "WASM memory request denied"
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }

    fn memories(&self) -> usize {
        1
    }
}

/// A `.wasm` file of a plugin.
///
/// The module is compiled during registration and dropped on unload; a
/// reactivation compiles the file again.
pub struct WasmUnit {
    name: String,
    path: PathBuf,
    runtime: Arc<WasmRuntime>,
    exports: Vec<ExportManifest>,
    module: RwLock<Option<WasmModule>>,
}

impl WasmUnit {
    pub fn new(
        name: impl Into<String>,
        path: PathBuf,
        runtime: Arc<WasmRuntime>,
        exports: Vec<ExportManifest>,
    ) -> Self {
        Self {
            name: name.into(),
            path,
            runtime,
            exports,
            module: RwLock::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.module.read().is_some()
    }

    fn bind(&self, module: &WasmModule, export: &ExportManifest, registrar: &mut Registrar) -> Result<()> {
        let name = export.artifact_name().to_string();
        let function = export.function.clone();

        match export.kind.as_str() {
            "hook" => {
                let priority = export.priority.map(HookPriority).unwrap_or_default();
                registrar.hook(HookDecl::new(name, priority, hook_fn(module.clone(), function)));
            }
            "tool" => {
                let tool = ToolDecl::new(name, &export.description, tool_fn(module.clone(), function))
                    .with_examples(export.examples.clone())
                    .return_direct(export.return_direct);
                registrar.tool(tool);
            }
            "form" => {
                registrar.form(
                    FormDecl::new(name, &export.description)
                        .with_start_examples(export.examples.clone()),
                );
            }
            "endpoint" => {
                let methods = if export.methods.is_empty() {
                    vec![axum::http::Method::GET]
                } else {
                    export
                        .methods
                        .iter()
                        .map(|m| parse_method(m))
                        .collect::<Result<Vec<_>>>()?
                };
                let path = export.path.clone().unwrap_or_else(|| format!("/{}", name));
                let mut endpoint =
                    EndpointDecl::new(path, methods, endpoint_fn(module.clone(), function))
                        .with_tags(export.tags.clone());
                if let Some(prefix) = &export.prefix {
                    endpoint = endpoint.with_prefix(prefix);
                }
                registrar.endpoint(endpoint);
            }
            "override" => match override_for(module.clone(), &name, function) {
                Some(item) => {
                    registrar.plugin_override(item);
                }
                None => tracing::debug!(
                    "Ignoring unknown override {} in plugin {}",
                    name,
                    registrar.plugin_id()
                ),
            },
            other => tracing::debug!(
                "Ignoring export {} of unknown kind '{}' in plugin {}",
                export.function,
                other,
                registrar.plugin_id()
            ),
        }
        Ok(())
    }
}

impl CodeUnit for WasmUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registrar: &mut Registrar) -> Result<()> {
        let module = self.runtime.compile_file(&self.path)?;

        for export in self.exports.iter().filter(|e| e.module_name() == self.name) {
            self.bind(&module, export, registrar)?;
        }

        *self.module.write() = Some(module);
        Ok(())
    }

    fn unload(&self) {
        self.module.write().take();
    }
}

/// Run a module call off the async executor.
async fn call_blocking(module: WasmModule, function: String, input: Value) -> Result<Option<Value>> {
    tokio::task::spawn_blocking(move || module.call_json(&function, &input))
        .await
        .map_err(|e| PluginError::WasmError(format!("WASM call aborted: {}", e)))?
}

fn hook_fn(module: WasmModule, function: String) -> HookFn {
    Arc::new(move |call| -> HookFuture {
        let input = json!({
            "value": call.value,
            "args": call.args,
            "context": call.context,
        });
        Box::pin(call_blocking(module.clone(), function.clone(), input))
    })
}

fn tool_fn(module: WasmModule, function: String) -> ToolFn {
    Arc::new(move |input, context| -> ToolFuture {
        let input = json!({ "input": input, "context": context });
        let call = call_blocking(module.clone(), function.clone(), input);
        Box::pin(async move {
            Ok(match call.await? {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            })
        })
    })
}

fn endpoint_fn(module: WasmModule, function: String) -> EndpointFn {
    Arc::new(move |request, context| -> EndpointFuture {
        let input = json!({
            "request": {
                "method": request.method.as_str(),
                "path": request.path,
                "params": request.params,
                "query": request.query,
                "body": request.body,
            },
            "context": context,
        });
        let call = call_blocking(module.clone(), function.clone(), input);
        Box::pin(async move { Ok(EndpointResponse::ok(call.await?.unwrap_or(Value::Null))) })
    })
}

fn override_for(module: WasmModule, name: &str, function: String) -> Option<PluginOverride> {
    let item = match name {
        "activated" | "deactivated" => {
            let run = move |info: &PluginInfo| -> Result<()> {
                module.call_json(&function, &json!({ "plugin": info }))?;
                Ok(())
            };
            if name == "activated" {
                PluginOverride::activated(run)
            } else {
                PluginOverride::deactivated(run)
            }
        }
        "settings_schema" => PluginOverride::settings_schema(move || {
            Ok(module.call_json(&function, &json!({}))?.unwrap_or_else(|| json!({})))
        }),
        "settings_model" => PluginOverride::settings_model(move || {
            match module.call_json(&function, &json!({}))? {
                Some(shape) => Ok(serde_json::from_value::<SettingsShape>(shape)?),
                None => Ok(SettingsShape::empty()),
            }
        }),
        "load_settings" => PluginOverride::load_settings(move || {
            Ok(module.call_json(&function, &json!({}))?.unwrap_or_else(|| json!({})))
        }),
        "save_settings" => PluginOverride::save_settings(move |settings| {
            let stored = module.call_json(&function, &json!({ "settings": settings }))?;
            Ok(stored.unwrap_or(settings))
        }),
        _ => return None,
    };
    Some(item)
}
