//! Artifact extraction: runs the registration of every code unit of a plugin.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::context::sync_scope_plugin;
use crate::error::panic_message;
use crate::units::{Artifacts, CodeUnit, Registrar};
use crate::{PluginError, Result};

/// Collects the artifacts of a plugin's units.
pub struct ArtifactExtractor<'a> {
    plugin_id: &'a str,
    endpoint_prefix: &'a str,
    endpoint_tags: &'a [String],
    diagnostic: &'a str,
}

impl<'a> ArtifactExtractor<'a> {
    /// `diagnostic` is the message logged next to any unit failure.
    pub fn new(
        plugin_id: &'a str,
        endpoint_prefix: &'a str,
        endpoint_tags: &'a [String],
        diagnostic: &'a str,
    ) -> Self {
        Self {
            plugin_id,
            endpoint_prefix,
            endpoint_tags,
            diagnostic,
        }
    }

    /// Register every unit.
    ///
    /// A unit that fails (or panics) contributes nothing and does not affect
    /// the others. Extraction fails only when no unit could be registered.
    pub fn extract(&self, units: &[Arc<dyn CodeUnit>]) -> Result<Artifacts> {
        let mut artifacts = Artifacts::default();
        let mut failures = Vec::new();

        for unit in units {
            match self.register_unit(unit.as_ref()) {
                Ok(unit_artifacts) => artifacts.extend(unit_artifacts),
                Err(e) => {
                    tracing::error!("Error loading {}::{}: {}", self.plugin_id, unit.name(), e);
                    tracing::warn!("{}", self.diagnostic);
                    failures.push(format!("{}: {}", unit.name(), e));
                }
            }
        }

        if !units.is_empty() && failures.len() == units.len() {
            return Err(PluginError::load_error(self.plugin_id, failures.join("; ")));
        }

        tracing::debug!(
            "Extracted {} hooks, {} tools, {} forms, {} endpoints, {} overrides from {}",
            artifacts.hooks.len(),
            artifacts.tools.len(),
            artifacts.forms.len(),
            artifacts.endpoints.len(),
            artifacts.overrides.len(),
            self.plugin_id
        );
        Ok(artifacts)
    }

    fn register_unit(&self, unit: &dyn CodeUnit) -> Result<Artifacts> {
        let mut registrar = Registrar::new(
            self.plugin_id,
            self.endpoint_prefix,
            self.endpoint_tags.to_vec(),
        );

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            sync_scope_plugin(self.plugin_id, || unit.register(&mut registrar))
        }));

        match outcome {
            Ok(Ok(())) => Ok(registrar.into_artifacts()),
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(PluginError::load_error(
                self.plugin_id,
                panic_message(payload.as_ref()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_plugin_id;
    use crate::tools::ToolDecl;
    use crate::units::NativeUnitTable;

    fn extract(table: &NativeUnitTable, plugin_id: &str) -> Result<Artifacts> {
        let units = table.instantiate(plugin_id);
        ArtifactExtractor::new(plugin_id, "/custom", &[], "diagnostic").extract(&units)
    }

    #[test]
    fn test_failing_unit_is_isolated() {
        let table = NativeUnitTable::new();
        table.register_fn("p", "good", |r| {
            r.hook_fn("h", 1, |_| Ok(None));
            Ok(())
        });
        table.register_fn("p", "bad", |r| {
            // Artifacts registered before the failure are dropped with the unit
            r.tool(ToolDecl::from_fn("t", "", |_, _| Ok(String::new())));
            Err(PluginError::load_error("p", "import failed"))
        });
        table.register_fn("p", "panicky", |_| panic!("syntax error"));

        let artifacts = extract(&table, "p").unwrap();
        assert_eq!(artifacts.hooks.len(), 1);
        assert!(artifacts.tools.is_empty());
    }

    #[test]
    fn test_all_units_failing_is_a_load_error() {
        let table = NativeUnitTable::new();
        table.register_fn("p", "bad", |_| Err(PluginError::load_error("p", "nope")));

        let err = extract(&table, "p").err().unwrap();
        assert!(matches!(err, PluginError::LoadError { .. }));
    }

    #[test]
    fn test_registration_runs_in_plugin_scope() {
        let table = NativeUnitTable::new();
        table.register_fn("scoped", "main", |r| {
            assert_eq!(current_plugin_id().as_deref(), Some("scoped"));
            assert_eq!(r.plugin_id(), "scoped");
            Ok(())
        });
        extract(&table, "scoped").unwrap();
    }
}
