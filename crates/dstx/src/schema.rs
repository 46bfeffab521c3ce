//! 📐 Schema: field declarations in, JSON Schema out, payloads checked against it.
//!
//! ```text
//!   FieldMap ──fields_to_schema──▶ schema
//!   payload ──remove_empty_values──▶ ──validate_schema(schema)──▶ bool | SchemaValidationError
//! ```
//!
//! Validation mutates the payload on the way (coercion, array wrapping, stripping of
//! undeclared properties), so what gets dispatched is what was validated.

mod clean;
mod fields;
mod validation;

pub use clean::remove_empty_values;
pub use fields::{
    Choice, ConditionOperator, DependsOn, Field, FieldCondition, FieldMap, FieldType, Match,
    Required, SchemaOptions, fields_to_schema,
};
pub use validation::{ValidationOptions, validate_schema};
