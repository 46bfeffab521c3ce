//! 🧹 Prune empty values the schema has no room for.
//!
//! Marie Kondo for payloads. Does this `""` spark joy in a field typed `number`? It does not.

use serde_json::Value;

fn allows(schema: Option<&Value>, json_type: &str) -> Option<bool> {
    match schema?.get("type")? {
        Value::String(single) => Some(single == json_type),
        Value::Array(types) => Some(types.iter().any(|t| t.as_str() == Some(json_type))),
        _ => None,
    }
}

/// Strips `null`s and empty strings out of `value`.
///
/// - `null` survives only where the schema allows `"null"` (or says nothing about the type)
/// - `""` directly under the root is always dropped; deeper down it only goes when the
///   schema declares a type that is not `string`
/// - array slots and object keys whose cleaned value is gone are dropped
///
/// `is_root` marks `value` as the payload root. Applying it twice changes nothing.
pub fn remove_empty_values(value: Value, schema: &Value, is_root: bool) -> Option<Value> {
    match value {
        Value::Object(map) if is_root => Some(Value::Object(
            map.into_iter()
                .filter_map(|(key, child)| {
                    let child_schema = property_schema(Some(schema), &key);
                    clean(child, child_schema, true).map(|cleaned| (key, cleaned))
                })
                .collect(),
        )),
        other => clean(other, Some(schema), false),
    }
}

fn property_schema<'a>(schema: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    schema?.get("properties")?.get(key)
}

fn clean(value: Value, schema: Option<&Value>, root_child: bool) -> Option<Value> {
    match value {
        Value::Null => match allows(schema, "null") {
            Some(false) => None,
            _ => Some(Value::Null),
        },
        Value::String(text) if text.is_empty() => {
            if root_child || allows(schema, "string") == Some(false) {
                None
            } else {
                Some(Value::String(text))
            }
        }
        Value::Array(items) => {
            let item_schema = schema.and_then(|s| s.get("items"));
            Some(Value::Array(
                items
                    .into_iter()
                    .filter_map(|item| clean(item, item_schema, false))
                    .collect(),
            ))
        }
        Value::Object(map) => Some(Value::Object(
            map.into_iter()
                .filter_map(|(key, child)| {
                    clean(child, property_schema(schema, &key), false).map(|c| (key, c))
                })
                .collect(),
        )),
        other => Some(other),
    }
}
