//! Tools and forms exported by plugins.
//!
//! Tools are callables the conversation agent may choose to run; forms are
//! declarative multi-turn procedures. The engine only collects them from
//! active plugins and hands them out; deciding when to use them belongs to
//! the agent.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Result;
use crate::context::PluginContext;
use crate::settings::SettingsShape;

/// Future returned by a tool.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Tool function: receives the input chosen by the agent and the caller context.
pub type ToolFn = Arc<dyn Fn(String, PluginContext) -> ToolFuture + Send + Sync>;

/// A tool declared by a plugin.
#[derive(Clone)]
pub struct ToolDecl {
    /// Tool name
    pub name: String,
    /// What the tool does (shown to the agent)
    pub description: String,
    /// The tool output is returned to the user as-is
    pub return_direct: bool,
    /// Example utterances that should trigger the tool
    pub examples: Vec<String>,
    /// Owning plugin (stamped at extraction)
    pub plugin_id: String,
    function: ToolFn,
}

impl ToolDecl {
    pub fn new(name: impl Into<String>, description: impl Into<String>, function: ToolFn) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            return_direct: false,
            examples: Vec::new(),
            plugin_id: String::new(),
            function,
        }
    }

    /// Create a tool from a synchronous closure.
    pub fn from_fn<F>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(String, PluginContext) -> Result<String> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let function: ToolFn = Arc::new(move |input, ctx| -> ToolFuture {
            let f = f.clone();
            Box::pin(async move { f(input, ctx) })
        });
        Self::new(name, description, function)
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }

    pub fn return_direct(mut self, value: bool) -> Self {
        self.return_direct = value;
        self
    }

    /// Run the tool.
    pub fn run(&self, input: String, ctx: PluginContext) -> ToolFuture {
        (self.function)(input, ctx)
    }

    /// Descriptions and examples used to index the tool for retrieval.
    pub fn triggers_map(&self) -> Value {
        json!({
            "description": [format!("{}: {}", self.name, self.description)],
            "start_example": self.examples,
        })
    }

    /// Serializable summary.
    pub fn summary(&self) -> ProcedureSummary {
        ProcedureSummary {
            kind: "tool",
            name: self.name.clone(),
            description: self.description.clone(),
            plugin_id: self.plugin_id.clone(),
            examples: self.examples.clone(),
        }
    }
}

impl fmt::Debug for ToolDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDecl")
            .field("name", &self.name)
            .field("return_direct", &self.return_direct)
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

/// A form declared by a plugin.
///
/// Only forms flagged `autopilot` are picked up; the others are building
/// blocks the plugin drives itself.
#[derive(Debug, Clone, Serialize)]
pub struct FormDecl {
    pub name: String,
    pub description: String,
    pub start_examples: Vec<String>,
    pub stop_examples: Vec<String>,
    /// Ask the user to confirm before submitting
    pub ask_confirm: bool,
    pub autopilot: bool,
    /// Fields the form collects
    pub fields: SettingsShape,
    pub plugin_id: String,
}

impl FormDecl {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            start_examples: Vec::new(),
            stop_examples: Vec::new(),
            ask_confirm: false,
            autopilot: true,
            fields: SettingsShape::empty(),
            plugin_id: String::new(),
        }
    }

    pub fn with_fields(mut self, fields: SettingsShape) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_start_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_examples = examples.into_iter().map(Into::into).collect();
        self
    }

    pub fn autopilot(mut self, value: bool) -> Self {
        self.autopilot = value;
        self
    }

    pub fn summary(&self) -> ProcedureSummary {
        ProcedureSummary {
            kind: "form",
            name: self.name.clone(),
            description: self.description.clone(),
            plugin_id: self.plugin_id.clone(),
            examples: self.start_examples.clone(),
        }
    }
}

/// Tool or form, as listed by [`PluginManager::procedures`](crate::PluginManager::procedures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcedureSummary {
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    pub plugin_id: String,
    pub examples: Vec<String>,
}
