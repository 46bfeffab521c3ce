//! 📬 Subscriptions: which action runs for which events, and what happened when it did.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::settings::RawSettings;
use crate::action::ActionResult;

/// An FQL filter bound to an action and the mapping that feeds it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub partner_action: String,
    /// FQL. `None` when missing or not a string.
    #[serde(default)]
    pub subscribe: Option<String>,
    #[serde(default)]
    pub mapping: Option<Value>,
}

impl Subscription {
    pub fn new(partner_action: impl Into<String>, subscribe: impl Into<String>) -> Self {
        Self {
            partner_action: partner_action.into(),
            subscribe: Some(subscribe.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mapping(mut self, mapping: Value) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Lenient read: wrong-typed fields become empty rather than failing the whole list.
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            name: text("name"),
            partner_action: text("partnerAction").unwrap_or_default(),
            subscribe: text("subscribe"),
            mapping: value.get("mapping").filter(|m| !m.is_null()).cloned(),
        }
    }
}

/// `subscription` (one) wins over `subscriptions` (many). Either may be JSON text.
pub fn get_subscriptions(settings: &RawSettings) -> Vec<Subscription> {
    if let Some(single) = settings.get("subscription").and_then(decoded)
        && single.is_object()
    {
        return vec![Subscription::from_value(&single)];
    }
    match settings.get("subscriptions").and_then(decoded) {
        Some(Value::Array(items)) => items.iter().map(Subscription::from_value).collect(),
        _ => Vec::new(),
    }
}

fn decoded(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => match serde_json::from_str(text) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!("📬 subscriptions setting is not valid JSON: {err}");
                None
            }
        },
        other => Some(other.clone()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Ran the action, successfully or not.
    Done,
    /// Invalid subscription or the event did not match.
    Skipped,
    Errored,
}

/// Reported once per subscription, after it finished either way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStats {
    pub duration_ms: f64,
    pub destination: String,
    pub action: String,
    pub subscribe: String,
    pub state: SubscriptionState,
    /// `{data, mapping, settings}` the subscription ran with.
    pub input: Value,
    pub output: Vec<ActionResult>,
}
