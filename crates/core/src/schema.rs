//! JSON Schema helpers for tool parameter and output validation.

use serde_json::Value;

/// Validate `instance` against `schema`.
///
/// An empty or null schema accepts everything. Errors are joined into one
/// human-readable message.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    if is_unconstrained(schema) {
        return Ok(());
    }

    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("invalid schema: {e}"))?;

    let outcome = match compiled.validate(instance) {
        Ok(()) => Ok(()),
        Err(errors) => {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            Err(messages.join("; "))
        }
    };
    outcome
}

fn is_unconstrained(schema: &Value) -> bool {
    match schema {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Bool(true) => true,
        _ => false,
    }
}

/// Names listed under `required`.
pub fn required_fields(schema: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Property names declared under `properties`, sorted.
pub fn property_names(schema: &Value) -> Vec<String> {
    let mut names: Vec<String> = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();
    names.sort();
    names
}

/// The declared `type` of one property, if any.
pub fn property_type<'a>(schema: &'a Value, name: &str) -> Option<&'a str> {
    schema
        .get("properties")
        .and_then(|p| p.get(name))
        .and_then(|p| p.get("type"))
        .and_then(Value::as_str)
}
