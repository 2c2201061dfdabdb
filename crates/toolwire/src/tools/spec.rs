//! Tool specifications: the name, description, and parameter schema the
//! model sees.
//!
//! A spec is immutable once a conversation starts. Parameters can come from
//! a raw JSON value, the explicit [`Schema`] builder, or a type that
//! implements `schemars::JsonSchema`.

use super::schema::Schema;
use serde::{Deserialize, Serialize};

/// Declared interface of one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (must be unique within a [`ToolSet`](super::ToolSet)).
    pub name: String,
    pub description: String,
    /// JSON-Schema-like object: `type`, `properties`, `required`.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Start a builder for a spec with the given name.
    pub fn builder(name: impl Into<String>) -> ToolSpecBuilder {
        ToolSpecBuilder {
            name: name.into(),
            description: String::new(),
            parameters: None,
        }
    }

    /// Names listed in the schema's `required` array.
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Builder for [`ToolSpec`]. Parameters default to an empty object schema.
#[derive(Debug)]
pub struct ToolSpecBuilder {
    name: String,
    description: String,
    parameters: Option<serde_json::Value>,
}

impl ToolSpecBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parameters(mut self, params: serde_json::Value) -> Self {
        self.parameters = Some(params);
        self
    }

    /// Use an explicitly built [`Schema`] for the parameters.
    pub fn schema(self, schema: Schema) -> Self {
        self.parameters(schema.to_value())
    }

    /// Derive parameters from a type implementing `schemars::JsonSchema`, so
    /// the schema and the handler's deserialization cannot diverge.
    pub fn parameters_for<T: schemars::JsonSchema>(self) -> Self {
        self.parameters(crate::json_schema_for::<T>())
    }

    pub fn build(self) -> ToolSpec {
        ToolSpec {
            name: self.name,
            description: self.description,
            parameters: self
                .parameters
                .unwrap_or_else(|| Schema::object().to_value()),
        }
    }
}
