//! 🔍 Static shape check for mappings. Never looks at a payload.
//!
//! Every problem is collected with the path that led to it, so a mapping with three typos
//! reports three issues instead of making you fix them one by one.

use serde_json::{Map, Value};

use super::directives::{self, DirectiveKind, METADATA_KEY, REGISTRY};
use crate::errors::{MappingValidationError, ValidationIssue};

const IF_KEYS: [&str; 4] = ["exists", "blank", "then", "else"];

/// "a string", "an object", "a directive" and friends, for error messages.
pub(crate) fn type_phrase(value: &Value) -> &'static str {
    match value {
        Value::Null => "a null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(map) if directives::is_directive(map) => "a directive",
        Value::Object(_) => "an object",
    }
}

/// Checks `mapping` and returns every issue found.
pub fn validate(mapping: &Value) -> Result<(), MappingValidationError> {
    let mut validator = Validator::default();
    validator.value(mapping);
    if validator.issues.is_empty() {
        Ok(())
    } else {
        Err(MappingValidationError {
            issues: validator.issues,
        })
    }
}

#[derive(Default)]
struct Validator {
    path: Vec<String>,
    issues: Vec<ValidationIssue>,
}

impl Validator {
    fn report(&mut self, message: String) {
        self.issues.push(ValidationIssue::new(&self.path, message));
    }

    fn nested(&mut self, segment: impl Into<String>, value: &Value) {
        self.path.push(segment.into());
        self.value(value);
        self.path.pop();
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::Object(map) if directives::is_directive(map) => self.directive(map),
            Value::Object(map) => {
                for (key, child) in map {
                    self.nested(key.as_str(), child);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.nested(index.to_string(), child);
                }
            }
            _ => {}
        }
    }

    fn directive(&mut self, map: &Map<String, Value>) {
        let directive_keys: Vec<&str> = map
            .keys()
            .filter(|k| k.starts_with('@'))
            .map(String::as_str)
            .collect();
        if directive_keys.len() > 1 {
            self.report(format!(
                "should only have one @-prefixed key but it has {} keys",
                directive_keys.len()
            ));
            return;
        }

        let counted = map.keys().filter(|k| k.as_str() != METADATA_KEY).count();
        if counted > directive_keys.len() {
            self.report(format!(
                "should only have one @-prefixed key but it has {counted} keys"
            ));
            return;
        }

        let Some((key, operand)) = directives::directive_entry(map) else {
            return;
        };
        let Some(kind) = REGISTRY.lookup(key) else {
            self.report(format!("has an invalid directive: {key}"));
            return;
        };

        match kind {
            DirectiveKind::Path | DirectiveKind::Template => self.directive_or_string(operand),
            DirectiveKind::Literal => self.value(operand),
            DirectiveKind::If => self.if_operand(operand),
            DirectiveKind::ArrayPath => self.array_path_operand(operand),
        }
    }

    fn directive_or_string(&mut self, value: &Value) {
        match value {
            Value::String(_) => {}
            Value::Object(map) if directives::is_directive(map) => self.directive(map),
            other => self.report(format!(
                "should be a string or a mapping directive but it is {}",
                type_phrase(other)
            )),
        }
    }

    fn if_operand(&mut self, operand: &Value) {
        let branches = match operand {
            Value::Object(map) if !directives::is_directive(map) => map,
            other => {
                self.report(format!(
                    "should be an object but it is {}",
                    type_phrase(other)
                ));
                return;
            }
        };

        if !branches.contains_key("exists") && !branches.contains_key("blank") {
            self.report("should have field \"exists\" or \"blank\" but it doesn't".to_string());
        }
        for key in branches.keys().filter(|k| !IF_KEYS.contains(&k.as_str())) {
            self.report(format!("has an unexpected field {key:?}"));
        }
        for key in IF_KEYS {
            if let Some(branch) = branches.get(key) {
                self.nested(key, branch);
            }
        }
    }

    fn array_path_operand(&mut self, operand: &Value) {
        let Value::Array(parts) = operand else {
            self.report(format!(
                "should be an array but it is {}",
                type_phrase(operand)
            ));
            return;
        };
        match parts.as_slice() {
            [root] => self.directive_or_string(root),
            [root, shape] => {
                self.directive_or_string(root);
                self.value(shape);
            }
            _ => self.report(format!(
                "should have one or two elements but it has {}",
                parts.len()
            )),
        }
    }
}
