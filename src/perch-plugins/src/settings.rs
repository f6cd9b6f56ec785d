//! Plugin settings shapes, validation and the default file-backed store.
//!
//! A plugin describes its settings as a [`SettingsShape`]: a set of named
//! [`SettingsField`]s, each with a type, an optional default and optional
//! validation constraints. The shape drives three things:
//!
//! - the defaults written to `settings.json` the first time a plugin is activated,
//! - validation of settings before they are saved,
//! - the JSON schema shown to administrators.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{PluginError, Result};

/// Name of the settings file inside a plugin folder.
pub const SETTINGS_FILE: &str = "settings.json";

/// Settings field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsField {
    /// Field description
    #[serde(default)]
    pub description: String,

    /// Field type
    #[serde(rename = "type")]
    pub field_type: SettingsFieldType,

    /// Default value
    #[serde(default)]
    pub default: Option<Value>,

    /// Whether the field is required
    #[serde(default)]
    pub required: bool,

    /// Validation constraints
    #[serde(default)]
    pub validation: Option<SettingsValidation>,
}

impl SettingsField {
    /// Create a field of the given type with no default.
    pub fn new(field_type: SettingsFieldType) -> Self {
        Self {
            description: String::new(),
            field_type,
            default: None,
            required: false,
            validation: None,
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set validation constraints.
    pub fn with_validation(mut self, validation: SettingsValidation) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Settings field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsFieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SettingsFieldType {
    fn as_schema_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Settings validation constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsValidation {
    /// Minimum value (for numbers) or length (for strings/arrays)
    #[serde(default)]
    pub min: Option<f64>,

    /// Maximum value (for numbers) or length (for strings/arrays)
    #[serde(default)]
    pub max: Option<f64>,

    /// Regex pattern (for strings)
    #[serde(default)]
    pub pattern: Option<String>,

    /// Enum of allowed values
    #[serde(default)]
    pub enum_values: Option<Vec<Value>>,
}

/// The settings model of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsShape {
    fields: BTreeMap<String, SettingsField>,
}

impl SettingsShape {
    /// Shape with no fields; accepts any object.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn field(mut self, name: impl Into<String>, field: SettingsField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Iterate over fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &SettingsField)> {
        self.fields.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Default settings object, or `None` when a required field has no default.
    pub fn defaults(&self) -> Option<Map<String, Value>> {
        let mut out = Map::new();
        for (name, field) in &self.fields {
            match &field.default {
                Some(value) => {
                    out.insert(name.clone(), value.clone());
                }
                None if field.required => return None,
                None => {}
            }
        }
        Some(out)
    }

    /// Validate a settings object, returning every violation found.
    pub fn validate(&self, settings: &Value) -> std::result::Result<(), Vec<String>> {
        let Some(object) = settings.as_object() else {
            return Err(vec!["settings must be a JSON object".to_string()]);
        };

        let mut errors = Vec::new();
        for (name, field) in &self.fields {
            match object.get(name) {
                None | Some(Value::Null) if field.required => {
                    errors.push(format!("{}: field required", name));
                }
                None | Some(Value::Null) => {}
                Some(value) => validate_field(name, field, value, &mut errors),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// JSON schema describing this shape.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for (name, field) in &self.fields {
            let mut prop = Map::new();
            prop.insert("type".into(), field.field_type.as_schema_type().into());
            if !field.description.is_empty() {
                prop.insert("description".into(), field.description.clone().into());
            }
            if let Some(default) = &field.default {
                prop.insert("default".into(), default.clone());
            }
            if let Some(v) = &field.validation {
                schema_constraints(field.field_type, v, &mut prop);
            }
            properties.insert(name.clone(), Value::Object(prop));

            if field.required {
                required.push(Value::String(name.clone()));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), "object".into());
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        Value::Object(schema)
    }
}

fn validate_field(name: &str, field: &SettingsField, value: &Value, errors: &mut Vec<String>) {
    if !field.field_type.matches(value) {
        errors.push(format!(
            "{}: expected {}",
            name,
            field.field_type.as_schema_type()
        ));
        return;
    }

    let Some(validation) = &field.validation else {
        return;
    };

    let measured = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(a) => Some(a.len() as f64),
        _ => None,
    };
    if let Some(measured) = measured {
        if let Some(min) = validation.min {
            if measured < min {
                errors.push(format!("{}: must be at least {}", name, min));
            }
        }
        if let Some(max) = validation.max {
            if measured > max {
                errors.push(format!("{}: must be at most {}", name, max));
            }
        }
    }

    if let (Some(pattern), Value::String(s)) = (&validation.pattern, value) {
        match regex::Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => {
                errors.push(format!("{}: does not match pattern {}", name, pattern));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("{}: invalid pattern {}: {}", name, pattern, e)),
        }
    }

    if let Some(allowed) = &validation.enum_values {
        if !allowed.contains(value) {
            errors.push(format!("{}: value not allowed", name));
        }
    }
}

fn schema_constraints(ty: SettingsFieldType, v: &SettingsValidation, prop: &mut Map<String, Value>) {
    let (min_key, max_key) = match ty {
        SettingsFieldType::String => ("minLength", "maxLength"),
        SettingsFieldType::Array => ("minItems", "maxItems"),
        _ => ("minimum", "maximum"),
    };
    if let Some(min) = v.min {
        prop.insert(min_key.into(), min.into());
    }
    if let Some(max) = v.max {
        prop.insert(max_key.into(), max.into());
    }
    if let Some(pattern) = &v.pattern {
        prop.insert("pattern".into(), pattern.clone().into());
    }
    if let Some(values) = &v.enum_values {
        prop.insert("enum".into(), Value::Array(values.clone()));
    }
}

/// Default settings store: a `settings.json` file inside the plugin folder.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    /// Store for the plugin located at `plugin_dir`.
    pub fn new(plugin_dir: &Path) -> Self {
        Self {
            path: plugin_dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Write the shape's defaults unless a settings file already exists.
    ///
    /// Returns `false` without touching the disk when the defaults are
    /// incomplete or when the file is already there.
    pub async fn materialize(&self, shape: &SettingsShape) -> Result<bool> {
        let Some(defaults) = shape.defaults() else {
            return Ok(false);
        };
        let content = serde_json::to_string_pretty(&Value::Object(defaults))?;

        let path = self.path.clone();
        let created = tokio::task::spawn_blocking(move || {
            use std::io::Write;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => file.write_all(content.as_bytes()).map(|_| true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| PluginError::IoError(std::io::Error::other(e.to_string())))??;

        Ok(created)
    }

    /// Read the stored settings, materializing defaults on first access.
    ///
    /// Yields an empty object when nothing is stored and no complete
    /// defaults exist.
    pub async fn load(&self, shape: &SettingsShape) -> Result<Value> {
        if !self.exists().await && !self.materialize(shape).await? {
            return Ok(Value::Object(Map::new()));
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Merge `settings` over the stored ones and persist the result.
    pub async fn save(&self, shape: &SettingsShape, settings: &Value) -> Result<Value> {
        let mut merged = match self.load(shape).await? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Value::Object(update) = settings {
            for (k, v) in update {
                merged.insert(k.clone(), v.clone());
            }
        }

        let merged = Value::Object(merged);
        tokio::fs::write(&self.path, serde_json::to_string_pretty(&merged)?).await?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_shape() -> SettingsShape {
        SettingsShape::empty()
            .field(
                "greeting",
                SettingsField::new(SettingsFieldType::String)
                    .with_default(json!("hello"))
                    .with_validation(SettingsValidation {
                        max: Some(10.0),
                        ..Default::default()
                    }),
            )
            .field(
                "max_items",
                SettingsField::new(SettingsFieldType::Integer)
                    .with_default(json!(3))
                    .with_validation(SettingsValidation {
                        min: Some(1.0),
                        max: Some(10.0),
                        ..Default::default()
                    }),
            )
    }

    #[test]
    fn test_defaults_complete() {
        let defaults = sample_shape().defaults().unwrap();
        assert_eq!(defaults["greeting"], "hello");
        assert_eq!(defaults["max_items"], 3);
    }

    #[test]
    fn test_defaults_incomplete_when_required_field_lacks_default() {
        let shape = sample_shape().field(
            "api_key",
            SettingsField::new(SettingsFieldType::String).required(),
        );
        assert!(shape.defaults().is_none());
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let shape = sample_shape().field(
            "mode",
            SettingsField::new(SettingsFieldType::String)
                .required()
                .with_validation(SettingsValidation {
                    enum_values: Some(vec![json!("fast"), json!("slow")]),
                    ..Default::default()
                }),
        );

        let errors = shape
            .validate(&json!({"greeting": "far too long greeting", "max_items": 0}))
            .unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.starts_with("mode")));

        assert!(shape.validate(&json!({"mode": "fast", "extra": true})).is_ok());
        assert!(shape.validate(&json!({"mode": "medium"})).is_err());
    }

    #[test]
    fn test_validate_pattern_and_type() {
        let shape = SettingsShape::empty().field(
            "code",
            SettingsField::new(SettingsFieldType::String).with_validation(SettingsValidation {
                pattern: Some("^[A-Z]{3}$".into()),
                ..Default::default()
            }),
        );
        assert!(shape.validate(&json!({"code": "EUR"})).is_ok());
        assert!(shape.validate(&json!({"code": "eur"})).is_err());
        assert!(shape.validate(&json!({"code": 42})).is_err());
        assert!(shape.validate(&json!("not an object")).is_err());
    }

    #[test]
    fn test_json_schema() {
        let schema = sample_shape().json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["greeting"]["maxLength"], 10.0);
        assert_eq!(schema["properties"]["max_items"]["minimum"], 1.0);

        let empty = SettingsShape::empty().json_schema();
        assert_eq!(empty["properties"], json!({}));
    }

    #[tokio::test]
    async fn test_materialize_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = SettingsFile::new(dir.path());

        assert!(store.materialize(&sample_shape()).await.unwrap());
        tokio::fs::write(store.path(), r#"{"greeting": "ciao"}"#)
            .await
            .unwrap();
        assert!(!store.materialize(&sample_shape()).await.unwrap());

        let loaded = store.load(&sample_shape()).await.unwrap();
        assert_eq!(loaded, json!({"greeting": "ciao"}));
    }

    #[tokio::test]
    async fn test_load_without_complete_defaults_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SettingsFile::new(dir.path());
        let shape =
            SettingsShape::empty().field("key", SettingsField::new(SettingsFieldType::String).required());

        assert_eq!(store.load(&shape).await.unwrap(), json!({}));
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn test_save_merges_over_existing() {
        let dir = TempDir::new().unwrap();
        let store = SettingsFile::new(dir.path());

        let saved = store
            .save(&sample_shape(), &json!({"max_items": 7}))
            .await
            .unwrap();
        assert_eq!(saved, json!({"greeting": "hello", "max_items": 7}));

        let reloaded = store.load(&sample_shape()).await.unwrap();
        assert_eq!(reloaded, saved);
    }
}
