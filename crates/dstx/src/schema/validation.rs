//! ✅ Payload validation: normalize, then hand the payload to `jsonschema`.
//!
//! Normalization runs before evaluation and edits the payload in place:
//! - scalars are coerced toward the declared type (`"123"` → `123`, `1234` → `"1234"`,
//!   `"true"` → `true`)
//! - a single value where an array is declared gets wrapped
//! - properties not declared under `additionalProperties: false` are removed
//!
//! Compiled validators are cached per `schema_key` for the life of the process.
//!
//! ✅ Yes, this quietly turns `"123"` into `123`. The partner asked for a number, the customer
//! sent a string, and somebody has to be the grown-up in the room.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use jsonschema::Validator;
use jsonschema::error::ValidationErrorKind;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::errors::{SchemaValidationError, ValidationIssue};

static VALIDATORS: LazyLock<RwLock<HashMap<String, Arc<Validator>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Cache key for the compiled validator. Never reuse one key for two schemas.
    pub schema_key: Option<String>,
    /// `false` turns validation into a filter: invalid payloads give `Ok(false)`.
    pub throw_if_invalid: bool,
    /// Root keys kept even when the schema does not declare them.
    pub exempt: Vec<String>,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            schema_key: None,
            throw_if_invalid: true,
            exempt: Vec::new(),
        }
    }
}

impl ValidationOptions {
    pub fn keyed(schema_key: impl Into<String>) -> Self {
        Self {
            schema_key: Some(schema_key.into()),
            ..Self::default()
        }
    }

    pub fn lenient(mut self) -> Self {
        self.throw_if_invalid = false;
        self
    }
}

/// Normalizes `value` in place and validates it against `schema`.
pub fn validate_schema(
    value: &mut Value,
    schema: &Value,
    options: &ValidationOptions,
) -> Result<bool, SchemaValidationError> {
    normalize(value, schema, &options.exempt, true);

    let validator = compiled(schema, options.schema_key.as_deref())?;

    // exempt keys sit out the evaluation, the schema would otherwise reject them
    let set_aside = take_exempt(value, &options.exempt);
    let issues: Vec<ValidationIssue> = validator.iter_errors(value).map(issue_for).collect();
    if let (Value::Object(map), false) = (&mut *value, set_aside.is_empty()) {
        map.extend(set_aside);
    }

    if issues.is_empty() {
        return Ok(true);
    }
    debug!(
        schema_key = options.schema_key.as_deref().unwrap_or("<uncached>"),
        issues = issues.len(),
        "📐 payload does not match its schema"
    );
    if options.throw_if_invalid {
        Err(SchemaValidationError::from_issues(issues))
    } else {
        Ok(false)
    }
}

fn take_exempt(value: &mut Value, exempt: &[String]) -> Map<String, Value> {
    let mut taken = Map::new();
    if let Value::Object(map) = value {
        for key in exempt {
            if let Some(kept) = map.remove(key) {
                taken.insert(key.clone(), kept);
            }
        }
    }
    taken
}

fn compiled(schema: &Value, key: Option<&str>) -> Result<Arc<Validator>, SchemaValidationError> {
    if let Some(key) = key
        && let Some(hit) = VALIDATORS
            .read()
            .ok()
            .and_then(|cache| cache.get(key).cloned())
    {
        return Ok(hit);
    }

    trace!(schema_key = key.unwrap_or("<uncached>"), "🔨 compiling schema");
    let validator = Arc::new(build(schema)?);
    if let Some(key) = key
        && let Ok(mut cache) = VALIDATORS.write()
    {
        cache
            .entry(key.to_string())
            .or_insert_with(|| Arc::clone(&validator));
    }
    Ok(validator)
}

fn build(schema: &Value) -> Result<Validator, SchemaValidationError> {
    jsonschema::options()
        .with_format("date-like", is_date_like)
        .with_format("password", |_: &str| true)
        .with_format("text", |_: &str| true)
        .should_validate_formats(true)
        .build(schema)
        .map_err(|err| {
            SchemaValidationError::from_issues(vec![ValidationIssue::new(
                &[],
                format!("The schema could not be compiled: {err}"),
            )])
        })
}

fn is_date_like(text: &str) -> bool {
    DateTime::parse_from_rfc3339(text).is_ok()
        || DateTime::parse_from_rfc2822(text).is_ok()
        || NAIVE_DATETIME_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(text, format).is_ok())
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        || (!text.trim().is_empty() && text.trim().parse::<f64>().is_ok())
}

fn issue_for(err: jsonschema::ValidationError<'_>) -> ValidationIssue {
    let pointer = err.instance_path.to_string();
    let path: Vec<String> = pointer
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    let subject = if path.is_empty() {
        "The root value".to_string()
    } else {
        format!("The value at {pointer}")
    };
    let message = match &err.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            format!("{subject} is missing the required field '{name}'.")
        }
        _ => format!("{subject} is invalid: {err}."),
    };
    ValidationIssue { path, message }
}

fn declared_types(schema: &Value) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(single)) => vec![single.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn is_type(value: &Value, json_type: &str) -> bool {
    match json_type {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn number_from(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}

fn coerce(value: &Value, json_type: &str) -> Option<Value> {
    match (json_type, value) {
        ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
        ("number", Value::String(s)) if !s.trim().is_empty() => {
            s.trim().parse::<f64>().ok().and_then(number_from)
        }
        ("integer", Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        ("number" | "integer", Value::Bool(b)) => Some(Value::from(u8::from(*b))),
        ("boolean", Value::String(s)) => match s.as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ("boolean", Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(Value::Bool(true)),
            Some(0) => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn normalize(value: &mut Value, schema: &Value, exempt: &[String], is_root: bool) {
    let types = declared_types(schema);
    if !types.is_empty() && !types.iter().any(|t| is_type(value, t)) {
        if types.contains(&"array") {
            let single = value.take();
            *value = Value::Array(vec![single]);
        } else if let Some(coerced) = types.iter().find_map(|t| coerce(value, t)) {
            *value = coerced;
        }
    }

    match value {
        Value::Object(map) => {
            let properties = schema.get("properties").and_then(Value::as_object);
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                map.retain(|key, _| {
                    properties.is_some_and(|declared| declared.contains_key(key))
                        || (is_root && exempt.contains(key))
                });
            }
            if let Some(properties) = properties {
                for (key, child) in map.iter_mut() {
                    if let Some(child_schema) = properties.get(key) {
                        normalize(child, child_schema, exempt, false);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items {
                    normalize(item, item_schema, exempt, false);
                }
            }
        }
        _ => {}
    }
}
