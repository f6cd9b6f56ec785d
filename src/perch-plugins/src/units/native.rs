//! Process-local table of native code units.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::{CodeUnit, Registrar};
use crate::Result;

/// Builds a fresh unit. Called on every activation, so a reactivated plugin
/// never sees state left over from its previous run.
pub type UnitFactory = Arc<dyn Fn() -> Arc<dyn CodeUnit> + Send + Sync>;

type RegisterFn = Arc<dyn Fn(&mut Registrar) -> Result<()> + Send + Sync>;

/// Native units keyed by plugin id.
///
/// The table is shared by cloning; it belongs to whoever builds the
/// [`PluginManager`](crate::PluginManager) and is injected into it.
#[derive(Clone, Default)]
pub struct NativeUnitTable {
    factories: Arc<RwLock<HashMap<String, Vec<UnitFactory>>>>,
}

impl NativeUnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit factory for a plugin.
    pub fn register<F, U>(&self, plugin_id: impl Into<String>, factory: F)
    where
        F: Fn() -> U + Send + Sync + 'static,
        U: CodeUnit + 'static,
    {
        let factory: UnitFactory = Arc::new(move || -> Arc<dyn CodeUnit> { Arc::new(factory()) });
        self.factories
            .write()
            .entry(plugin_id.into())
            .or_default()
            .push(factory);
    }

    /// Register a unit whose registration is a plain closure.
    pub fn register_fn<F>(&self, plugin_id: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(&mut Registrar) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let f: RegisterFn = Arc::new(f);
        self.register(plugin_id, move || FnUnit {
            name: name.clone(),
            register: f.clone(),
        });
    }

    /// Fresh instances of every unit registered for a plugin.
    pub fn instantiate(&self, plugin_id: &str) -> Vec<Arc<dyn CodeUnit>> {
        self.factories
            .read()
            .get(plugin_id)
            .map(|factories| factories.iter().map(|factory| factory()).collect())
            .unwrap_or_default()
    }

    /// Forget every unit of a plugin.
    pub fn remove(&self, plugin_id: &str) -> bool {
        self.factories.write().remove(plugin_id).is_some()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.factories.read().contains_key(plugin_id)
    }
}

/// Unit backed by a registration closure.
pub struct FnUnit {
    name: String,
    register: RegisterFn,
}

impl CodeUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registrar: &mut Registrar) -> Result<()> {
        (self.register)(registrar)
    }
}
