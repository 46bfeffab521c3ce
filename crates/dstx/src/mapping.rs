//! 🗺️ Mapping engine: resolve a declarative mapping tree against an event payload.
//!
//! A mapping is plain JSON. Objects with an `@`-prefixed key are directives (`@path`,
//! `@template`, `@if`, `@literal`, `@arrayPath`), everything else is copied through with its
//! children resolved. `undefined` is modelled as `None`: object keys that resolve to it are
//! dropped, array slots that resolve to it become `null`.
//!
//! ```text
//!   mapping ──validate──▶ ok ──resolve(payload)──▶ Option<Value>
//! ```
//!
//! 🗺️ The mapping is the treasure map, the payload is the island. Most of the time the X is
//! where the map says. When it is not, we return `None` and leave quietly instead of digging up
//! the whole beach.

mod directives;
mod path;
mod template;
mod validate;

use serde_json::{Map, Value};
use tracing::trace;

use crate::errors::MappingError;
use validate::type_phrase;

pub use directives::{DirectiveKind, DirectiveRegistry, METADATA_KEY, REGISTRY};
pub use path::get as get_path;
pub use validate::validate;

/// Knobs for a single transform.
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    /// `{{x}}` in templates is HTML-escaped when true. `{{{x}}}` never is.
    pub escape_html: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self { escape_html: true }
    }
}

/// Validates `mapping`, then resolves it against `payload`.
pub fn transform(mapping: &Value, payload: &Value) -> Result<Option<Value>, MappingError> {
    transform_with(mapping, payload, &TransformOptions::default())
}

pub fn transform_with(
    mapping: &Value,
    payload: &Value,
    options: &TransformOptions,
) -> Result<Option<Value>, MappingError> {
    validate(mapping)?;
    ensure_object(payload)?;
    let resolved = resolve_value(mapping, payload, options)?;
    Ok(remove_undefined(resolved))
}

/// Same mapping over many payloads. The mapping is validated once, results keep input order.
pub fn transform_batch(
    mapping: &Value,
    payloads: &[Value],
) -> Result<Vec<Option<Value>>, MappingError> {
    validate(mapping)?;
    let options = TransformOptions::default();
    payloads
        .iter()
        .map(|payload| {
            ensure_object(payload)?;
            resolve_value(mapping, payload, &options).map(remove_undefined)
        })
        .collect()
}

/// Resolves without validating first. Callers that skip [`validate`] get resolution-time
/// errors instead of the aggregated shape report.
pub fn resolve(mapping: &Value, payload: &Value) -> Result<Option<Value>, MappingError> {
    resolve_value(mapping, payload, &TransformOptions::default())
}

/// Resolution already drops `undefined` object keys as it goes, so with `Option<Value>` the
/// only place left for one is the top. Kept as the explicit post-pass; idempotent.
pub fn remove_undefined(value: Option<Value>) -> Option<Value> {
    value
}

fn ensure_object(payload: &Value) -> Result<(), MappingError> {
    match payload {
        Value::Object(_) => Ok(()),
        other => Err(MappingError::PayloadNotObject(type_phrase(other))),
    }
}

fn resolve_value(
    mapping: &Value,
    payload: &Value,
    options: &TransformOptions,
) -> Result<Option<Value>, MappingError> {
    match mapping {
        Value::Object(map) if directives::is_directive(map) => {
            resolve_directive(map, payload, options)
        }
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, child) in map {
                if let Some(value) = resolve_value(child, payload, options)? {
                    resolved.insert(key.clone(), value);
                }
            }
            Ok(Some(Value::Object(resolved)))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve_value(item, payload, options).map(|v| v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, MappingError>>()?;
            Ok(Some(Value::Array(resolved)))
        }
        scalar => Ok(Some(scalar.clone())),
    }
}

fn resolve_directive(
    map: &Map<String, Value>,
    payload: &Value,
    options: &TransformOptions,
) -> Result<Option<Value>, MappingError> {
    let Some((key, operand)) = directives::directive_entry(map) else {
        return Ok(None);
    };
    let kind = REGISTRY
        .lookup(key)
        .ok_or_else(|| MappingError::UnknownDirective(key.to_string()))?;
    trace!(directive = key, "🔄 resolving directive");

    match kind {
        DirectiveKind::Path => {
            let at = resolve_string(kind, operand, payload, options)?;
            Ok(path::get(payload, &at).cloned())
        }
        DirectiveKind::Template => {
            let text = resolve_string(kind, operand, payload, options)?;
            let rendered = template::render(&text, payload, options.escape_html)
                .map_err(|err| directive_error(kind, err.to_string()))?;
            Ok(Some(Value::String(rendered)))
        }
        DirectiveKind::Literal => resolve_value(operand, payload, options),
        DirectiveKind::If => resolve_if(operand, payload, options),
        DirectiveKind::ArrayPath => resolve_array_path(operand, payload, options),
    }
}

fn directive_error(kind: DirectiveKind, message: String) -> MappingError {
    MappingError::Directive {
        directive: kind.key(),
        message,
    }
}

fn resolve_string(
    kind: DirectiveKind,
    operand: &Value,
    payload: &Value,
    options: &TransformOptions,
) -> Result<String, MappingError> {
    match resolve_value(operand, payload, options)? {
        Some(Value::String(text)) => Ok(text),
        Some(other) => Err(directive_error(
            kind,
            format!(
                "expected the operand to resolve to a string but it is {}",
                type_phrase(&other)
            ),
        )),
        None => Err(directive_error(
            kind,
            "expected the operand to resolve to a string but it is undefined".to_string(),
        )),
    }
}

fn resolve_if(
    operand: &Value,
    payload: &Value,
    options: &TransformOptions,
) -> Result<Option<Value>, MappingError> {
    let Value::Object(branches) = operand else {
        return Err(directive_error(
            DirectiveKind::If,
            format!("expected an object but it is {}", type_phrase(operand)),
        ));
    };

    let holds = if let Some(exists) = branches.get("exists") {
        matches!(resolve_value(exists, payload, options)?, Some(v) if !v.is_null())
    } else if let Some(blank) = branches.get("blank") {
        matches!(
            resolve_value(blank, payload, options)?,
            Some(v) if !v.is_null() && v.as_str() != Some("")
        )
    } else {
        return Err(directive_error(
            DirectiveKind::If,
            "expected an \"exists\" or \"blank\" condition".to_string(),
        ));
    };

    match branches.get(if holds { "then" } else { "else" }) {
        Some(branch) => resolve_value(branch, payload, options),
        None => Ok(None),
    }
}

fn resolve_array_path(
    operand: &Value,
    payload: &Value,
    options: &TransformOptions,
) -> Result<Option<Value>, MappingError> {
    let (root_mapping, shape) = match operand {
        Value::Array(parts) => match parts.as_slice() {
            [root] => (root, None),
            [root, shape] => (root, Some(shape)),
            _ => {
                return Err(directive_error(
                    DirectiveKind::ArrayPath,
                    format!("expected one or two elements but it has {}", parts.len()),
                ));
            }
        },
        other => {
            return Err(directive_error(
                DirectiveKind::ArrayPath,
                format!("expected an array but it is {}", type_phrase(other)),
            ));
        }
    };

    let root = match root_mapping {
        Value::String(at) => path::get(payload, at).cloned(),
        other => resolve_value(other, payload, options)?,
    };
    let shape = shape.filter(|s| matches!(s, Value::Object(m) if !m.is_empty()));

    match (root, shape) {
        (Some(root @ (Value::Object(_) | Value::Array(_))), Some(shape)) => {
            let items = match root {
                Value::Array(items) => items,
                single => vec![single],
            };
            let resolved = items
                .iter()
                .map(|item| resolve_value(shape, item, options).map(|v| v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, MappingError>>()?;
            Ok(Some(Value::Array(resolved)))
        }
        (root, _) => Ok(root),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(mapping: Value, payload: Value) -> Option<Value> {
        transform(&mapping, &payload).expect("💀 transform blew up")
    }

    #[test]
    fn the_one_where_bad_mappings_and_payloads_are_refused() {
        assert!(transform(&json!({"a": 1, "@field": "$.foo.bar"}), &json!({})).is_err());
        assert!(transform(&json!({"oops": {"@merge": [{}, 123]}}), &json!({})).is_err());
        assert!(transform(&json!({"@template": false}), &json!({})).is_err());

        let err = transform(&json!({"a": 1}), &json!(123)).expect_err("💀 number payload");
        assert_eq!(err, MappingError::PayloadNotObject("a number"));
        let err = transform(&json!({"a": 1}), &json!([])).expect_err("💀 array payload");
        assert_eq!(err.to_string(), "payload must be an object but it is an array");
    }

    #[test]
    fn the_one_where_nothing_happens_on_purpose() {
        assert_eq!(run(json!({}), json!({"cool": false})), Some(json!({})));
        assert_eq!(run(json!({"cool": true}), json!({})), Some(json!({"cool": true})));
    }

    #[test]
    fn the_one_where_literal_still_resolves_what_is_inside() {
        assert_eq!(
            run(json!({"simple": {"@literal": false}}), json!({})),
            Some(json!({"simple": false}))
        );
        assert_eq!(
            run(
                json!({"nested": {"@literal": {"a": {"@path": "$.a"}, "b": {"@path": "$.b"}}}}),
                json!({"a": "some value"})
            ),
            Some(json!({"nested": {"a": "some value"}}))
        );
    }

    #[test]
    fn the_one_where_if_checks_existence() {
        let payload = json!({"a": 1, "b": true, "c": false, "d": null, "e": ""});
        let check = |key: &str| {
            run(
                json!({"@if": {"exists": {"@path": format!("$.{key}")}, "then": 1, "else": 2}}),
                payload.clone(),
            )
        };
        assert_eq!(check("a"), Some(json!(1)));
        assert_eq!(check("d"), Some(json!(2)));
        assert_eq!(check("x"), Some(json!(2)));
        assert_eq!(check("e"), Some(json!(1)));
    }

    #[test]
    fn the_one_where_if_checks_blankness() {
        let payload = json!({"a": 1, "b": true, "c": false, "d": null, "e": ""});
        let check = |key: &str| {
            run(
                json!({"@if": {"blank": {"@path": format!("$.{key}")}, "then": 1, "else": 2}}),
                payload.clone(),
            )
        };
        assert_eq!(check("a"), Some(json!(1)));
        assert_eq!(check("d"), Some(json!(2)));
        assert_eq!(check("x"), Some(json!(2)));
        assert_eq!(check("e"), Some(json!(2)));
    }

    #[test]
    fn the_one_where_a_missing_else_drops_the_key() {
        let mapping = json!({"x": {"@if": {"exists": {"@path": "$.a"}, "then": 1}}});
        assert_eq!(run(mapping.clone(), json!({"a": 5})), Some(json!({"x": 1})));
        assert_eq!(run(mapping, json!({"a": null})), Some(json!({})));
    }

    fn products() -> Value {
        json!({"products": [
            {"productId": "123", "price": 0.5},
            {"productId": "456", "price": 0.99}
        ]})
    }

    fn shape() -> Value {
        json!({"product_id": {"@path": "$.productId"}, "monies": {"@path": "$.price"}})
    }

    #[test]
    fn the_one_where_array_path_walks_the_products() {
        let data = products();
        assert_eq!(
            run(json!({"neat": {"@arrayPath": ["$.products"]}}), data.clone()),
            Some(json!({"neat": data["products"]}))
        );
        assert_eq!(
            run(json!({"neat": {"@arrayPath": ["$.products", shape()]}}), data),
            Some(json!({"neat": [
                {"product_id": "123", "monies": 0.5},
                {"product_id": "456", "monies": 0.99}
            ]}))
        );
    }

    #[test]
    fn the_one_where_the_array_root_is_itself_a_directive() {
        let root = json!({"@if": {
            "exists": {"@path": "$.products"},
            "then": {"@path": "$.products"},
            "else": []
        }});
        assert_eq!(
            run(json!({"neat": {"@arrayPath": [root, shape()]}}), products()),
            Some(json!({"neat": [
                {"product_id": "123", "monies": 0.5},
                {"product_id": "456", "monies": 0.99}
            ]}))
        );
    }

    #[test]
    fn the_one_where_a_lonely_object_becomes_an_array() {
        assert_eq!(
            run(
                json!({"neat": {"@arrayPath": ["$.products", shape()]}}),
                json!({"products": {"notAnArray": true}})
            ),
            Some(json!({"neat": [{}]}))
        );
        assert_eq!(
            run(
                json!({"neat": {"@arrayPath": ["$.properties", shape()]}}),
                json!({"properties": {"productId": "123", "price": 0.5}})
            ),
            Some(json!({"neat": [{"product_id": "123", "monies": 0.5}]}))
        );
    }

    #[test]
    fn the_one_where_path_finds_things() {
        assert_eq!(
            run(json!({"neat": {"@path": "$.foo"}}), json!({"foo": "bar"})),
            Some(json!({"neat": "bar"}))
        );
        let obj = json!({"foo": "bar"});
        assert_eq!(run(json!({"@path": ""}), obj.clone()), Some(obj.clone()));
        assert_eq!(run(json!({"@path": "$."}), obj.clone()), Some(obj));
        assert_eq!(
            run(json!({"@path": {"@path": "$.foo"}}), json!({"foo": "bar", "bar": "baz"})),
            Some(json!("baz"))
        );
        assert_eq!(
            run(json!({"neat": {"@path": "$.oops"}}), json!({"foo": "bar"})),
            Some(json!({}))
        );
        assert_eq!(
            run(json!({"neat": {"@path": "$.foo.bar.baz"}}), json!({"foo": "bar"})),
            Some(json!({}))
        );
    }

    #[test]
    fn the_one_where_path_refuses_a_non_string() {
        assert!(transform(&json!({"neat": {"@path": {}}}), &json!({"foo": "bar"})).is_err());
        let err = resolve(&json!({"@path": {"@literal": 5}}), &json!({}))
            .expect_err("💀 a number is not a path");
        assert_eq!(
            err.to_string(),
            "@path: expected the operand to resolve to a string but it is a number"
        );
    }

    #[test]
    fn the_one_where_templates_render() {
        assert_eq!(
            run(json!({"@template": "Hello, {{who}}!"}), json!({"who": "World"})),
            Some(json!("Hello, World!"))
        );
        assert_eq!(
            run(json!({"@template": "{{oops.yo}}"}), json!({})),
            Some(json!(""))
        );
        let raw = transform_with(
            &json!({"@template": "<blink>{{a}} {{{a}}}</blink>"}),
            &json!({"a": "<b>Hi</b>"}),
            &TransformOptions { escape_html: false },
        )
        .expect("💀 unescaped template");
        assert_eq!(raw, Some(json!("<blink><b>Hi</b> <b>Hi</b></blink>")));
    }

    #[test]
    fn the_one_where_an_unclosed_template_tag_is_a_directive_error() {
        let err = transform(&json!({"greeting": {"@template": "hi {{name"}}), &json!({"name": "x"}))
            .expect_err("💀 that tag never closes");
        assert!(err.to_string().starts_with("@template: "));
    }

    #[test]
    fn the_one_where_ann_gets_a_name_and_an_id() {
        assert_eq!(
            run(
                json!({"name": {"@path": "$.traits.name"}, "id": {"@literal": 42}}),
                json!({"traits": {"name": "Ann"}})
            ),
            Some(json!({"name": "Ann", "id": 42}))
        );
    }

    #[test]
    fn the_one_where_a_single_item_gets_wrapped() {
        let wrapped = resolve(
            &json!({"@arrayPath": ["$.items", {"id": {"@path": "$.id"}}]}),
            &json!({"items": {"id": "x"}}),
        )
        .expect("💀 arrayPath should resolve");
        assert_eq!(wrapped, Some(json!([{"id": "x"}])));
    }

    #[test]
    fn the_one_where_undefined_keys_disappear() {
        assert_eq!(run(json!({"x": null}), json!({})), Some(json!({"x": null})));
        assert_eq!(
            run(json!({"x": {"y": {"@path": "$.nope"}, "z": 1}, "foo": 1}), json!({})),
            Some(json!({"x": {"z": 1}, "foo": 1}))
        );
        assert_eq!(
            run(json!({"x": {"y": {"z": {"@path": "$.nope"}}}, "foo": 1}), json!({})),
            Some(json!({"x": {"y": {}}, "foo": 1}))
        );
        assert_eq!(
            run(json!({"list": [{"@path": "$.nope"}, 1]}), json!({})),
            Some(json!({"list": [null, 1]}))
        );
        let once = remove_undefined(Some(json!({"a": [1, null]})));
        assert_eq!(remove_undefined(once.clone()), once);
    }

    #[test]
    fn the_one_where_a_batch_keeps_its_order() {
        let mapping = json!({"id": {"@path": "$.id"}});
        let out = transform_batch(&mapping, &[json!({"id": 2}), json!({}), json!({"id": 1})])
            .expect("💀 batch transform");
        assert_eq!(
            out,
            vec![Some(json!({"id": 2})), Some(json!({})), Some(json!({"id": 1}))]
        );
        assert!(transform_batch(&mapping, &[json!("nope")]).is_err());
    }
}
