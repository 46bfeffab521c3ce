//! 🧾 Field declarations and the JSON Schema they compile to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const DRAFT_07: &str = "http://json-schema.org/draft-07/schema#";

pub type FieldMap = BTreeMap<String, Field>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Text,
    Number,
    Integer,
    Datetime,
    Boolean,
    Password,
    Object,
}

impl FieldType {
    fn json_type(self) -> Value {
        match self {
            FieldType::String | FieldType::Text | FieldType::Password => json!("string"),
            FieldType::Datetime => json!(["string", "number"]),
            FieldType::Number => json!("number"),
            FieldType::Integer => json!("integer"),
            FieldType::Boolean => json!("boolean"),
            FieldType::Object => json!("object"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Choice {
    Plain(String),
    Labeled { label: String, value: Value },
}

impl Choice {
    fn value(&self) -> Value {
        match self {
            Choice::Plain(value) => Value::String(value.clone()),
            Choice::Labeled { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Match {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Is,
    IsNot,
}

/// One "required when" condition. A dotted `field_key` (`parent.child`) reaches into an
/// object field. A missing `value` means "is set" / "is not set".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCondition {
    pub field_key: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default, rename = "match")]
    pub matching: Match,
    pub conditions: Vec<FieldCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Required {
    Always(bool),
    When(DependsOn),
}

impl Default for Required {
    fn default() -> Self {
        Required::Always(false)
    }
}

/// 🏷️ One declared input of an action or of a destination's settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: FieldType,
    #[serde(default)]
    pub required: Required,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub allow_null: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub additional_properties: bool,
    /// Choices come from a dynamic field resolver at authoring time.
    #[serde(default)]
    pub dynamic: bool,
    /// Flagged `hidden` in the [`crate::destination::Manifest`] so editors keep it out of sight.
    #[serde(default, rename = "unsafe_hidden")]
    pub unsafe_hidden: bool,
}

impl Field {
    pub fn new(label: impl Into<String>, kind: FieldType) -> Self {
        Self {
            label: label.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = Required::Always(true);
        self
    }

    pub fn required_when(mut self, depends_on: DependsOn) -> Self {
        self.required = Required::When(depends_on);
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(
            choices
                .into_iter()
                .map(|c| Choice::Plain(c.into()))
                .collect(),
        );
        self
    }

    pub fn with_properties(mut self, properties: FieldMap) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_additional_properties(mut self) -> Self {
        self.additional_properties = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Still validated, just kept out of sight of whoever is filling in the mapping.
    pub fn unsafe_hidden(mut self) -> Self {
        self.unsafe_hidden = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaOptions {
    /// Root-level `additionalProperties`. Off unless asked for.
    pub additional_properties: bool,
    /// Extra keywords merged into the root (`anyOf`, `allOf`, ...), last write wins.
    pub extra: Option<Map<String, Value>>,
}

/// Builds a draft-07 JSON Schema for `fields`.
pub fn fields_to_schema(fields: &FieldMap, options: &SchemaOptions) -> Value {
    let mut conditions: Vec<(String, DependsOn)> = Vec::new();
    let mut root = object_schema(fields, options.additional_properties, &mut conditions);

    let mut schema = Map::new();
    schema.insert("$schema".into(), json!(DRAFT_07));
    schema.append(&mut root);

    if !conditions.is_empty() {
        let all_of = conditions
            .iter()
            .map(|(key, depends_on)| condition_schema(key, depends_on))
            .collect();
        schema.insert("allOf".into(), Value::Array(all_of));
    }
    if let Some(extra) = &options.extra {
        for (key, value) in extra {
            schema.insert(key.clone(), value.clone());
        }
    }
    Value::Object(schema)
}

/// Conditional requirements of nested object properties bubble up to the caller as
/// `parent.child` keys.
fn object_schema(
    fields: &FieldMap,
    additional_properties: bool,
    conditions: &mut Vec<(String, DependsOn)>,
) -> Map<String, Value> {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for (key, field) in fields {
        properties.insert(key.clone(), field_schema(key, field, conditions));
        match &field.required {
            Required::Always(true) => required.push(Value::String(key.clone())),
            Required::Always(false) => {}
            Required::When(depends_on) => conditions.push((key.clone(), depends_on.clone())),
        }
    }

    let mut schema = Map::new();
    schema.insert("type".into(), json!("object"));
    schema.insert(
        "additionalProperties".into(),
        Value::Bool(additional_properties),
    );
    schema.insert("properties".into(), Value::Object(properties));
    schema.insert("required".into(), Value::Array(required));
    schema
}

fn field_schema(key: &str, field: &Field, conditions: &mut Vec<(String, DependsOn)>) -> Value {
    let json_type = field.kind.json_type();
    let mut schema = Map::new();
    schema.insert("title".into(), json!(field.label));
    if let Some(description) = &field.description {
        schema.insert("description".into(), json!(description));
    }
    schema.insert("type".into(), json_type.clone());
    if let Some(format) = &field.format {
        schema.insert("format".into(), json!(format));
    }
    if let Some(default) = &field.default {
        schema.insert("default".into(), default.clone());
    }

    match field.kind {
        FieldType::Datetime => {
            schema.insert("format".into(), json!("date-like"));
        }
        FieldType::Password => {
            schema.insert("format".into(), json!("password"));
        }
        FieldType::Text => {
            schema.insert("format".into(), json!("text"));
        }
        FieldType::String => {
            if let Some(min) = field.minimum {
                schema.insert("minLength".into(), number(min));
            }
            if let Some(max) = field.maximum {
                schema.insert("maxLength".into(), number(max));
            }
        }
        FieldType::Number => {
            if let Some(min) = field.minimum {
                schema.insert("minimum".into(), number(min));
            }
            if let Some(max) = field.maximum {
                schema.insert("maximum".into(), number(max));
            }
        }
        _ => {}
    }

    let mut choices: Option<Vec<Value>> = field
        .choices
        .as_ref()
        .map(|choices| choices.iter().map(Choice::value).collect());

    if field.allow_null {
        let mut types = match json_type.clone() {
            Value::Array(types) => types,
            single => vec![single],
        };
        types.push(json!("null"));
        schema.insert("type".into(), Value::Array(types));
        if let Some(choices) = choices.as_mut() {
            choices.push(Value::Null);
        }
    }

    if field.multiple {
        let mut items = Map::new();
        items.insert("type".into(), json_type.clone());
        if let Some(choices) = choices.take() {
            items.insert("enum".into(), Value::Array(choices));
        }
        schema.insert("type".into(), json!("array"));
        schema.insert("items".into(), Value::Object(items));
    } else if let Some(choices) = choices {
        schema.insert("enum".into(), Value::Array(choices));
    }

    if let (FieldType::Object, Some(properties)) = (field.kind, &field.properties) {
        let mut nested_conditions = Vec::new();
        let mut nested = object_schema(
            properties,
            field.additional_properties,
            &mut nested_conditions,
        );
        conditions.extend(
            nested_conditions
                .into_iter()
                .map(|(child, depends_on)| (format!("{key}.{child}"), depends_on)),
        );
        if field.multiple {
            schema.insert("items".into(), Value::Object(nested));
        } else {
            schema.append(&mut nested);
        }
    }

    Value::Object(schema)
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn split_dotted(key: &str) -> Option<(&str, &str)> {
    key.split_once('.')
}

/// What must hold once a condition matches: `key` is present.
fn then_required(key: &str) -> Value {
    match split_dotted(key) {
        Some((parent, child)) => json!({
            "required": [parent],
            "properties": {parent: {"required": [child]}}
        }),
        None => json!({"required": [key]}),
    }
}

fn value_check(operator: ConditionOperator, value: &Value) -> Value {
    match operator {
        ConditionOperator::Is => json!({"const": value}),
        ConditionOperator::IsNot => json!({"not": {"const": value}}),
    }
}

/// A single condition as a predicate over the payload, without the if/then wrapper.
fn predicate(condition: &FieldCondition) -> Value {
    let dependant = condition.field_key.as_str();
    match (split_dotted(dependant), &condition.value) {
        (Some((parent, child)), value) => {
            let value = value.clone().unwrap_or(Value::Null);
            json!({
                "properties": {parent: {
                    "properties": {child: value_check(condition.operator, &value)},
                    "required": [child]
                }},
                "required": [parent]
            })
        }
        (None, Some(value)) => json!({
            "properties": {dependant: value_check(condition.operator, value)},
            "required": [dependant]
        }),
        (None, None) => match condition.operator {
            ConditionOperator::Is => json!({"anyOf": [
                {"not": {"required": [dependant]}},
                {"properties": {dependant: {"type": "null"}}}
            ]}),
            ConditionOperator::IsNot => json!({"allOf": [
                {"required": [dependant]},
                {"not": {"properties": {dependant: {"type": "null"}}}}
            ]}),
        },
    }
}

fn condition_schema(key: &str, depends_on: &DependsOn) -> Value {
    let predicate = match depends_on.conditions.as_slice() {
        [single] => predicate(single),
        many => {
            let parts: Vec<Value> = many.iter().map(predicate).collect();
            match depends_on.matching {
                Match::All => json!({"allOf": parts}),
                Match::Any => json!({"anyOf": parts}),
            }
        }
    };
    json!({"if": predicate, "then": then_required(key)})
}
