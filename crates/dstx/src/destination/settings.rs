//! 🔑 Raw settings, the destination-only projection and the OAuth bits in between.
//!
//! Raw settings are the junk drawer. Subscriptions and OAuth tokens live in there next to the
//! actual destination settings. Actions only ever see the projection, so nobody's perform
//! function accidentally ships a refresh token to a partner. 🗝️

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys that belong to the runtime, never to the destination.
const RESERVED_KEYS: [&str; 3] = ["subscription", "subscriptions", "oauth"];

/// Settings as they arrive: destination settings plus subscriptions plus oauth tokens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSettings(pub Map<String, Value>);

/// Settings with the runtime keys stripped. This is what actions see.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DestinationSettings(pub Map<String, Value>);

/// Tokens handed to every request function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// What a token refresh gets to work with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuth2ClientCredentials {
    #[serde(flatten)]
    pub tokens: AuthTokens,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshAccessTokenResult {
    pub access_token: String,
    /// Only some providers rotate the refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl RefreshAccessTokenResult {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
        }
    }
}

impl From<Value> for RawSettings {
    /// Anything that is not an object is treated as no settings at all.
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => RawSettings(map),
            _ => RawSettings::default(),
        }
    }
}

impl RawSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn oauth(&self) -> Option<&Map<String, Value>> {
        self.0.get("oauth").and_then(Value::as_object)
    }

    fn oauth_str(&self, key: &str) -> Option<String> {
        self.oauth()
            .and_then(|oauth| oauth.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl DestinationSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Drops `subscription`, `subscriptions` and `oauth`.
pub fn get_destination_settings(settings: &RawSettings) -> DestinationSettings {
    DestinationSettings(
        settings
            .0
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

pub fn get_auth_data(settings: &RawSettings) -> AuthTokens {
    AuthTokens {
        access_token: settings.oauth_str("access_token"),
        refresh_token: settings.oauth_str("refresh_token"),
    }
}

pub fn get_oauth2_data(settings: &RawSettings) -> OAuth2ClientCredentials {
    OAuth2ClientCredentials {
        tokens: get_auth_data(settings),
        client_id: settings.oauth_str("clientId"),
        client_secret: settings.oauth_str("clientSecret"),
    }
}

/// Settings with the fresh tokens written into `oauth`, everything else untouched.
pub fn update_oauth_settings(
    settings: &RawSettings,
    fresh: &RefreshAccessTokenResult,
) -> RawSettings {
    let mut oauth = settings.oauth().cloned().unwrap_or_default();
    oauth.insert(
        "access_token".into(),
        Value::String(fresh.access_token.clone()),
    );
    if let Some(refresh_token) = &fresh.refresh_token {
        oauth.insert("refresh_token".into(), Value::String(refresh_token.clone()));
    }
    let mut updated = settings.0.clone();
    updated.insert("oauth".into(), Value::Object(oauth));
    RawSettings(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> RawSettings {
        RawSettings::from(json!({
            "apiKey": "k",
            "subscription": {"subscribe": "type = \"track\""},
            "subscriptions": [],
            "oauth": {
                "access_token": "old",
                "refresh_token": "r1",
                "clientId": "cid",
                "clientSecret": "shh",
            },
        }))
    }

    #[test]
    fn the_one_where_runtime_keys_stay_out_of_destination_settings() {
        assert_eq!(
            get_destination_settings(&raw()).as_value(),
            json!({"apiKey": "k"})
        );
    }

    #[test]
    fn the_one_where_oauth_tokens_are_read_and_rewritten() {
        let settings = raw();
        assert_eq!(
            get_auth_data(&settings),
            AuthTokens {
                access_token: Some("old".into()),
                refresh_token: Some("r1".into()),
            }
        );
        let credentials = get_oauth2_data(&settings);
        assert_eq!(credentials.client_id.as_deref(), Some("cid"));
        assert_eq!(
            serde_json::to_value(&credentials).expect("💀 serialize"),
            json!({"accessToken": "old", "refreshToken": "r1", "clientId": "cid", "clientSecret": "shh"})
        );

        let updated = update_oauth_settings(&settings, &RefreshAccessTokenResult::new("fresh"));
        assert_eq!(updated.get("oauth").expect("💀 oauth")["access_token"], "fresh");
        assert_eq!(updated.get("oauth").expect("💀 oauth")["refresh_token"], "r1");
        assert_eq!(updated.get("apiKey"), Some(&json!("k")));
    }

    #[test]
    fn the_one_where_settings_without_oauth_get_one() {
        let updated = update_oauth_settings(
            &RawSettings::from(json!({"apiKey": "k"})),
            &RefreshAccessTokenResult {
                access_token: "a".into(),
                refresh_token: Some("r".into()),
            },
        );
        assert_eq!(
            updated.as_value(),
            json!({"apiKey": "k", "oauth": {"access_token": "a", "refresh_token": "r"}})
        );
        assert_eq!(RawSettings::from(json!("nope")), RawSettings::default());
    }
}
