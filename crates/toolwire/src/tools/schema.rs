//! Explicit parameter-schema construction.
//!
//! [`Schema`] builds the JSON-Schema subset that tool specs use (type,
//! description, enum, items, properties, required) from tagged variants,
//! for tools whose arguments have no Rust type to derive a schema from.
//!
//! ```
//! use toolwire::tools::schema::Schema;
//!
//! let params = Schema::object()
//!     .property("city", Schema::string().describe("City name"), true)
//!     .property("days", Schema::integer(), false)
//!     .to_value();
//! assert_eq!(params["required"][0], "city");
//! ```

use serde_json::{Map, Value, json};

/// One node of a parameter schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    String {
        description: Option<String>,
        allowed: Vec<String>,
    },
    Number {
        description: Option<String>,
    },
    Integer {
        description: Option<String>,
    },
    Boolean {
        description: Option<String>,
    },
    Array {
        description: Option<String>,
        items: Box<Schema>,
    },
    Object {
        description: Option<String>,
        /// Properties in declaration order.
        properties: Vec<(String, Schema)>,
        required: Vec<String>,
    },
}

impl Schema {
    pub fn string() -> Self {
        Self::String {
            description: None,
            allowed: Vec::new(),
        }
    }

    pub fn number() -> Self {
        Self::Number { description: None }
    }

    pub fn integer() -> Self {
        Self::Integer { description: None }
    }

    pub fn boolean() -> Self {
        Self::Boolean { description: None }
    }

    pub fn array(items: Schema) -> Self {
        Self::Array {
            description: None,
            items: Box::new(items),
        }
    }

    pub fn object() -> Self {
        Self::Object {
            description: None,
            properties: Vec::new(),
            required: Vec::new(),
        }
    }

    /// Attach a description to this node.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            Self::String { description, .. }
            | Self::Number { description }
            | Self::Integer { description }
            | Self::Boolean { description }
            | Self::Array { description, .. }
            | Self::Object { description, .. } => *description = text,
        }
        self
    }

    /// Restrict a string node to a fixed set of values. Ignored on other
    /// variants.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Self::String { allowed, .. } = &mut self {
            *allowed = values.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Add a property to an object node. Re-adding a name replaces it.
    /// Ignored on non-object variants.
    pub fn property(mut self, name: impl Into<String>, schema: Schema, required: bool) -> Self {
        if let Self::Object {
            properties,
            required: req,
            ..
        } = &mut self
        {
            let name = name.into();
            properties.retain(|(n, _)| n != &name);
            req.retain(|n| n != &name);
            if required {
                req.push(name.clone());
            }
            properties.push((name, schema));
        }
        self
    }

    /// The `type` keyword for this node.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Number { .. } => "number",
            Self::Integer { .. } => "integer",
            Self::Boolean { .. } => "boolean",
            Self::Array { .. } => "array",
            Self::Object { .. } => "object",
        }
    }

    /// Render to the JSON value sent to providers.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("type".into(), json!(self.type_name()));
        match self {
            Self::String {
                description,
                allowed,
            } => {
                insert_description(&mut out, description);
                if !allowed.is_empty() {
                    out.insert("enum".into(), json!(allowed));
                }
            }
            Self::Number { description }
            | Self::Integer { description }
            | Self::Boolean { description } => insert_description(&mut out, description),
            Self::Array { description, items } => {
                insert_description(&mut out, description);
                out.insert("items".into(), items.to_value());
            }
            Self::Object {
                description,
                properties,
                required,
            } => {
                insert_description(&mut out, description);
                let props: Map<String, Value> = properties
                    .iter()
                    .map(|(name, schema)| (name.clone(), schema.to_value()))
                    .collect();
                out.insert("properties".into(), Value::Object(props));
                if !required.is_empty() {
                    out.insert("required".into(), json!(required));
                }
            }
        }
        Value::Object(out)
    }
}

fn insert_description(out: &mut Map<String, Value>, description: &Option<String>) {
    if let Some(d) = description {
        out.insert("description".into(), json!(d));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_object_renders() {
        let schema = Schema::object()
            .describe("Search request")
            .property(
                "tags",
                Schema::array(Schema::string()).describe("Tags to match"),
                false,
            )
            .property("mode", Schema::string().one_of(["fast", "exact"]), true);
        let value = schema.to_value();
        assert_eq!(value["description"], "Search request");
        assert_eq!(value["properties"]["tags"]["items"]["type"], "string");
        assert_eq!(value["properties"]["mode"]["enum"], json!(["fast", "exact"]));
        assert_eq!(value["required"], json!(["mode"]));
    }

    #[test]
    fn re_adding_property_replaces_it() {
        let value = Schema::object()
            .property("x", Schema::string(), true)
            .property("x", Schema::number(), false)
            .to_value();
        assert_eq!(value["properties"]["x"]["type"], "number");
        assert!(value.get("required").is_none());
    }

    #[test]
    fn one_of_ignored_on_non_string() {
        let value = Schema::integer().one_of(["1"]).to_value();
        assert!(value.get("enum").is_none());
    }
}
