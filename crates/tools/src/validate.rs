//! Parameter validation at the dispatch boundary.
//!
//! Checks the subset of JSON Schema tools actually declare: an object with
//! `required` keys and primitive `type`s on its properties. Anything richer
//! is left to the tool's own typed decoding.

use rustedloop_core::ToolError;
use serde_json::Value;

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type names are not ours to reject.
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

/// Validate `params` against `schema`.
pub fn validate_params(tool_name: &str, schema: &Value, params: &Value) -> Result<(), ToolError> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if schema.get("type").and_then(Value::as_str) == Some("object") && !params.is_object() {
        return Err(ToolError::InvalidArguments(format!(
            "{tool_name}: parameters must be an object, got {}",
            json_type_name(params)
        )));
    }

    let Some(object) = params.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if object.get(key).is_none_or(Value::is_null) {
                return Err(ToolError::MissingParameter {
                    tool_name: tool_name.to_string(),
                    parameter: key.to_string(),
                });
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in object {
        let Some(declared) = properties.get(key).and_then(|p| p.get("type")) else {
            continue;
        };
        let ok = match declared {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(ToolError::InvalidArguments(format!(
                "{tool_name}: parameter '{key}' must be of type {declared}, got {}",
                json_type_name(value)
            )));
        }
    }

    Ok(())
}
