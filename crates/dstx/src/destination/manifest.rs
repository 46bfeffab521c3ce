//! 🪪 Manifest: a destination's public face, with every closure peeled off.
//!
//! A `DestinationDefinition` is mostly functions, and functions do not serialize. The manifest is
//! the part that does: names, slugs, field declarations, which actions are hidden, what each one
//! subscribes to by default and which subscriptions come pre-baked. It is what a catalog or an
//! editor UI gets to see, and it is plain serde all the way down. 📇

use serde::Serialize;
use serde_json::{Value, json};

use super::DestinationDefinition;
use super::auth::AuthScheme;
use crate::schema::{Field, FieldMap, FieldType, Required};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<AuthScheme>,
    pub settings: Vec<FieldManifest>,
    pub actions: Vec<ActionManifest>,
    pub presets: Vec<PresetManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionManifest {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub hidden: bool,
    /// The action's default subscription, offered when someone first turns it on.
    pub default_trigger: Option<String>,
    pub supports_batch: bool,
    pub fields: Vec<FieldManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldManifest {
    pub field_key: String,
    #[serde(rename = "type")]
    pub kind: FieldType,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Always or sometimes. Conditional requirements count.
    pub required: bool,
    pub multiple: bool,
    pub dynamic: bool,
    pub hidden: bool,
    pub allow_null: bool,
}

impl FieldManifest {
    fn new(field_key: &str, field: &Field) -> Self {
        Self {
            field_key: field_key.to_string(),
            kind: field.kind,
            label: field.label.clone(),
            description: field.description.clone(),
            default_value: field.default.clone(),
            required: !matches!(field.required, Required::Always(false)),
            multiple: field.multiple,
            dynamic: field.dynamic,
            hidden: field.unsafe_hidden,
            allow_null: field.allow_null,
        }
    }
}

fn field_manifests(fields: &FieldMap) -> Vec<FieldManifest> {
    fields
        .iter()
        .map(|(key, field)| FieldManifest::new(key, field))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetManifest {
    pub partner_action: String,
    pub name: String,
    pub trigger: Option<String>,
    pub fields: Value,
}

impl Manifest {
    pub fn from_definition(definition: &DestinationDefinition) -> Self {
        let actions = definition
            .actions
            .iter()
            .map(|(slug, action)| ActionManifest {
                slug: slug.clone(),
                name: action.title.clone(),
                description: action.description.clone(),
                hidden: action.hidden,
                default_trigger: action.default_subscription.clone(),
                supports_batch: action.perform_batch.is_some(),
                fields: field_manifests(&action.fields),
            })
            .collect();

        // 👻 a preset pointing at an action that does not exist is a preset for nobody
        let presets = definition
            .presets
            .iter()
            .filter_map(|preset| {
                let action = definition.actions.get(&preset.partner_action)?;
                Some(PresetManifest {
                    partner_action: preset.partner_action.clone(),
                    name: preset.name.clone().unwrap_or_else(|| action.title.clone()),
                    trigger: preset.subscribe.clone(),
                    fields: preset.mapping.clone().unwrap_or_else(|| json!({})),
                })
            })
            .collect();

        Self {
            name: definition.name.clone(),
            slug: definition
                .slug
                .clone()
                .unwrap_or_else(|| slugify(&definition.name)),
            description: definition.description.clone(),
            scheme: definition.authentication.as_ref().map(|auth| auth.scheme),
            settings: definition
                .authentication
                .as_ref()
                .map(|auth| field_manifests(&auth.fields))
                .unwrap_or_default(),
            actions,
            presets,
        }
    }
}

/// `"Actions Webhook (Beta)"` → `"actions-webhook-beta"`.
pub fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDefinition, PerformOutput};
    use crate::destination::{Authentication, Subscription};

    fn definition() -> DestinationDefinition {
        DestinationDefinition::new("Actions Webhook (Beta)")
            .description("Ships events to any URL")
            .authentication(
                Authentication::new(AuthScheme::Custom)
                    .field("apiKey", Field::new("API Key", FieldType::Password).required()),
            )
            .action(
                "send",
                ActionDefinition::new("Send", "POSTs the event")
                    .default_subscription("type = \"track\"")
                    .field("url", Field::new("URL", FieldType::String).required().dynamic())
                    .field("secret", Field::new("Secret", FieldType::String).unsafe_hidden())
                    .perform(|_request, _input| async { Ok(PerformOutput::Nothing) }),
            )
            .action(
                "legacy",
                ActionDefinition::new("Legacy", "").hidden().perform_batch(
                    |_request, _input| async { Ok(PerformOutput::Nothing) },
                ),
            )
            .preset(
                Subscription::new("send", "type = \"identify\"")
                    .with_mapping(json!({"url": "https://example.com"})),
            )
            .preset(Subscription::new("nope", "type = \"page\"").named("Ghost"))
    }

    #[test]
    fn the_one_where_the_manifest_tells_the_whole_story() {
        let manifest = Manifest::from_definition(&definition());

        assert_eq!(manifest.slug, "actions-webhook-beta");
        assert_eq!(manifest.description.as_deref(), Some("Ships events to any URL"));
        assert_eq!(manifest.scheme, Some(AuthScheme::Custom));
        assert_eq!(manifest.settings.len(), 1);
        assert!(manifest.settings[0].required);

        let legacy = &manifest.actions[0];
        assert_eq!((legacy.slug.as_str(), legacy.hidden, legacy.supports_batch), ("legacy", true, true));

        let send = &manifest.actions[1];
        assert!(!send.hidden);
        assert_eq!(send.default_trigger.as_deref(), Some("type = \"track\""));
        let secret = send
            .fields
            .iter()
            .find(|field| field.field_key == "secret")
            .expect("💀 secret should be listed");
        assert!(secret.hidden && !secret.dynamic);
        let url = send
            .fields
            .iter()
            .find(|field| field.field_key == "url")
            .expect("💀 url should be listed");
        assert!(url.dynamic && url.required && !url.hidden);
    }

    #[test]
    fn the_one_where_presets_borrow_the_action_title_and_ghosts_are_dropped() {
        let manifest = Manifest::from_definition(&definition());
        assert_eq!(
            manifest.presets,
            vec![PresetManifest {
                partner_action: "send".into(),
                name: "Send".into(),
                trigger: Some("type = \"identify\"".into()),
                fields: json!({"url": "https://example.com"}),
            }]
        );
    }

    #[test]
    fn the_one_where_an_explicit_slug_wins_and_serde_speaks_camel() {
        let manifest =
            Manifest::from_definition(&DestinationDefinition::new("Whatever").slug("actions-custom"));
        assert_eq!(
            serde_json::to_value(&manifest).expect("💀 manifests serialize"),
            json!({
                "name": "Whatever",
                "slug": "actions-custom",
                "settings": [],
                "actions": [],
                "presets": [],
            })
        );
    }
}
