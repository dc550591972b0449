//! Input-shape validation for registered handlers.
//!
//! Handlers declare the shape of their params as a JSON Schema document. Only
//! the subset the tool layer uses is understood: `type` (single or union),
//! `properties`, `required`, `additionalProperties: false`, `enum`, `items`,
//! `minimum` and `maximum`. Unknown keywords are ignored.

use serde_json::{Map, Value};

/// Validates a request's params before its handler runs.
pub trait InputValidator: Send + Sync {
    /// Return a human-readable reason if `params` is not acceptable.
    fn validate(&self, params: &Value) -> std::result::Result<(), String>;
}

/// Accepts any params.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyInput;

impl InputValidator for AnyInput {
    fn validate(&self, _params: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// A JSON Schema subset validator.
#[derive(Debug, Clone)]
pub struct Schema {
    schema: Value,
}

impl Schema {
    pub fn new(schema: Value) -> Self {
        Self { schema }
    }
}

impl InputValidator for Schema {
    fn validate(&self, params: &Value) -> std::result::Result<(), String> {
        // Absent params are an empty object for object-shaped inputs.
        if params.is_null() && allows_type(&self.schema, "object") {
            return check(&Value::Object(Map::new()), &self.schema, "params");
        }
        check(params, &self.schema, "params")
    }
}

fn allows_type(schema: &Value, name: &str) -> bool {
    match schema.get("type") {
        Some(Value::String(t)) => t == name,
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(name)),
        _ => false,
    }
}

fn type_matches(value: &Value, name: &str) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check(value: &Value, schema: &Value, path: &str) -> std::result::Result<(), String> {
    match schema.get("type") {
        Some(Value::String(t)) if !type_matches(value, t) => {
            return Err(format!(
                "{}: expected {}, got {}",
                path,
                t,
                json_type_name(value)
            ));
        }
        Some(Value::Array(ts)) => {
            let ok = ts
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(value, t));
            if !ok {
                return Err(format!(
                    "{}: expected one of {}, got {}",
                    path,
                    Value::Array(ts.clone()),
                    json_type_name(value)
                ));
            }
        }
        _ => {}
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{}: value {} is not one of {}", path, value, Value::Array(allowed.clone())));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("{}: {} is less than minimum {}", path, n, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("{}: {} is greater than maximum {}", path, n, max));
            }
        }
    }

    if let Value::Object(obj) = value {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!("{}: missing required property '{}'", path, name));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        if let Some(properties) = properties {
            for (name, prop_schema) in properties {
                if let Some(prop) = obj.get(name) {
                    check(prop, prop_schema, &format!("{}.{}", path, name))?;
                }
            }
        }

        if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
            for name in obj.keys() {
                let declared = properties.map(|p| p.contains_key(name)).unwrap_or(false);
                if !declared {
                    return Err(format!("{}: unexpected property '{}'", path, name));
                }
            }
        }
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check(item, item_schema, &format!("{}[{}]", path, i))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "k": { "type": "integer", "minimum": 1, "maximum": 50 },
                "mode": { "enum": ["fast", "full"] },
                "documents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } },
                        "required": ["text"]
                    }
                }
            },
            "required": ["query"]
        }))
    }

    #[test]
    fn test_accepts_valid_params() {
        let schema = search_schema();
        assert!(schema
            .validate(&json!({"query": "install", "k": 3, "documents": [{"text": "a"}]}))
            .is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = search_schema().validate(&json!({"k": 3})).unwrap_err();
        assert!(err.contains("missing required property 'query'"));
    }

    #[test]
    fn test_wrong_type() {
        let err = search_schema().validate(&json!({"query": 5})).unwrap_err();
        assert!(err.contains("params.query: expected string, got number"));
    }

    #[test]
    fn test_bounds_and_enum() {
        let schema = search_schema();
        assert!(schema.validate(&json!({"query": "q", "k": 0})).is_err());
        assert!(schema.validate(&json!({"query": "q", "k": 51})).is_err());
        assert!(schema.validate(&json!({"query": "q", "mode": "slow"})).is_err());
        assert!(schema.validate(&json!({"query": "q", "mode": "fast"})).is_ok());
    }

    #[test]
    fn test_nested_items_report_path() {
        let err = search_schema()
            .validate(&json!({"query": "q", "documents": [{"text": "ok"}, {"title": "no text"}]}))
            .unwrap_err();
        assert!(err.starts_with("params.documents[1]"));
    }

    #[test]
    fn test_absent_params_are_empty_object() {
        let lenient = Schema::new(json!({"type": "object"}));
        assert!(lenient.validate(&Value::Null).is_ok());
        assert!(search_schema().validate(&Value::Null).is_err());
    }

    #[test]
    fn test_additional_properties_false() {
        let strict = Schema::new(json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": false
        }));
        assert!(strict.validate(&json!({"a": "x"})).is_ok());
        assert!(strict.validate(&json!({"a": "x", "b": 1})).is_err());
    }

    #[test]
    fn test_union_types() {
        let schema = Schema::new(json!({"type": ["string", "null"]}));
        assert!(schema.validate(&json!("x")).is_ok());
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!(1)).is_err());
    }

    #[test]
    fn test_any_input() {
        assert!(AnyInput.validate(&json!([1, 2, 3])).is_ok());
    }
}
