//! Argument validation against declared tool schemas.
//!
//! The default check is deliberately small: every `required` field must be
//! present, and every argument that the schema's `properties` map describes
//! must carry the declared JSON type. Unknown arguments pass (open world),
//! and so do `null` values. Strict mode additionally runs the whole schema
//! through `jsonschema` and reports every violation.

use super::spec::ToolSpec;
use crate::error::JsonType;
use crate::{Arguments, ToolError};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Validates tool-call arguments against the schemas of one tool set.
pub struct ArgumentValidator {
    schemas: HashMap<String, Value>,
    strict: HashMap<String, jsonschema::Validator>,
}

impl std::fmt::Debug for ArgumentValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgumentValidator")
            .field("tools", &self.schemas.keys().collect::<Vec<_>>())
            .field("strict", &!self.strict.is_empty())
            .finish()
    }
}

impl ArgumentValidator {
    /// Build a validator from the given specs.
    pub fn new<'a>(specs: impl IntoIterator<Item = &'a ToolSpec>) -> Self {
        Self {
            schemas: specs
                .into_iter()
                .map(|s| (s.name.clone(), s.parameters.clone()))
                .collect(),
            strict: HashMap::new(),
        }
    }

    /// Also run full JSON Schema validation. Schemas that fail to compile
    /// are logged and skipped (only the basic check applies to them).
    pub fn strict(mut self) -> Self {
        for (name, schema) in &self.schemas {
            match jsonschema::validator_for(schema) {
                Ok(v) => {
                    self.strict.insert(name.clone(), v);
                }
                Err(e) => warn!("Schema for tool {name} does not compile, strict check skipped: {e}"),
            }
        }
        self
    }

    /// Whether a schema is registered for `tool`.
    pub fn knows(&self, tool: &str) -> bool {
        self.schemas.contains_key(tool)
    }

    /// Check `args` for a call to `tool`.
    pub fn validate(&self, tool: &str, args: &Arguments) -> Result<(), ToolError> {
        let schema = self
            .schemas
            .get(tool)
            .ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(field) {
                    return Err(ToolError::MissingParameter {
                        tool: tool.to_string(),
                        parameter: field.to_string(),
                    });
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, value) in args {
                let Some(declared) = properties
                    .get(name)
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                    .and_then(JsonType::from_keyword)
                else {
                    continue;
                };
                if !matches_type(value, declared) {
                    return Err(ToolError::TypeMismatch {
                        tool: tool.to_string(),
                        parameter: name.clone(),
                        expected: declared,
                        actual: runtime_type(value),
                    });
                }
            }
        }

        if let Some(validator) = self.strict.get(tool) {
            let instance = Value::Object(args.clone());
            let errors: Vec<String> = validator
                .iter_errors(&instance)
                .map(|e| format!("  - {}: {e}", e.instance_path()))
                .collect();
            if !errors.is_empty() {
                return Err(ToolError::SchemaViolation {
                    tool: tool.to_string(),
                    details: errors.join("\n"),
                });
            }
        }

        Ok(())
    }
}

/// Whether `value` satisfies `declared`. `null` always passes.
fn matches_type(value: &Value, declared: JsonType) -> bool {
    match (declared, value) {
        (_, Value::Null) => true,
        (JsonType::String, Value::String(_)) => true,
        (JsonType::Number, Value::Number(_)) => true,
        (JsonType::Integer, Value::Number(n)) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        (JsonType::Boolean, Value::Bool(_)) => true,
        (JsonType::Array, Value::Array(_)) => true,
        (JsonType::Object, Value::Object(_)) => true,
        _ => false,
    }
}

fn runtime_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
