//! 🏢 Destinations: a set of actions behind one partner, one settings schema and one auth scheme.
//!
//! ```text
//!   event + settings
//!        │ validate settings
//!        ▼
//!   ┌─ attempt ───────────────────────────────────────────────┐
//!   │  subscriptions ─▶ FQL match? ─▶ action.execute  (join)  │
//!   └─────────────┬───────────────────────────────────────────┘
//!                 │ 401 and oauth2 ─▶ refresh token ─▶ attempt again
//!                 ▼
//!            Vec<ActionResult>
//! ```
//!
//! 🏢 Think of it as a mailroom. Every subscription looks at the incoming event at the same
//! time, and the ones that match get their own envelope. If the partner slams the door with a
//! 401 we go get a fresh key exactly once. Twice would be stalking.

mod auth;
mod fql;
mod manifest;
mod settings;
mod subscriptions;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::action::{
    Action, ActionDefinition, ActionResult, BatchBundle, ExecuteBundle, ExecuteInput,
    ExtendRequest, PerformOutput, RequestFn, ResponseSink, dispatch_client,
};
use crate::app_config::RuntimeConfig;
use crate::errors::{ActionError, INVALID_AUTHENTICATION, NOT_IMPLEMENTED};
use crate::request_client::{RequestClient, RequestOptions};
use crate::schema::{SchemaOptions, ValidationOptions, fields_to_schema, validate_schema};

pub use auth::{AuthScheme, Authentication, RefreshAccessToken};
pub use fql::{Comparison, Condition, Connective, FqlError, Literal, parse as parse_fql};
pub use manifest::{ActionManifest, FieldManifest, Manifest, PresetManifest, slugify};
pub use settings::{
    AuthTokens, DestinationSettings, OAuth2ClientCredentials, RawSettings,
    RefreshAccessTokenResult, get_auth_data, get_destination_settings, get_oauth2_data,
    update_oauth_settings,
};
pub use subscriptions::{Subscription, SubscriptionState, SubscriptionStats, get_subscriptions};

/// 📋 Everything a destination declares about itself.
#[derive(Clone, Default)]
pub struct DestinationDefinition {
    pub name: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub authentication: Option<Authentication>,
    pub actions: BTreeMap<String, ActionDefinition>,
    /// Subscriptions offered when the destination is first connected.
    pub presets: Vec<Subscription>,
    pub extend_request: Option<ExtendRequest>,
    pub on_delete: Option<Arc<dyn RequestFn>>,
}

impl fmt::Debug for DestinationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationDefinition")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("description", &self.description)
            .field("authentication", &self.authentication)
            .field("actions", &self.actions)
            .field("presets", &self.presets)
            .field("extend_request", &self.extend_request.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish_non_exhaustive()
    }
}

impl DestinationDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Defaults to the kebab-cased name in the [`Manifest`].
    pub fn slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = Some(authentication);
        self
    }

    pub fn action(mut self, slug: impl Into<String>, action: ActionDefinition) -> Self {
        self.actions.insert(slug.into(), action);
        self
    }

    pub fn preset(mut self, subscription: Subscription) -> Self {
        self.presets.push(subscription);
        self
    }

    pub fn extend_request<F>(mut self, extend: F) -> Self
    where
        F: Fn(&ExecuteInput) -> RequestOptions + Send + Sync + 'static,
    {
        self.extend_request = Some(Arc::new(extend));
        self
    }

    pub fn on_delete<F, Fut>(mut self, on_delete: F) -> Self
    where
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        self.on_delete = Some(Arc::new(on_delete));
        self
    }
}

/// One event or many, as handed to every subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Single(Value),
    Batch(Vec<Value>),
}

impl EventData {
    pub fn as_value(&self) -> Value {
        match self {
            EventData::Single(event) => event.clone(),
            EventData::Batch(events) => Value::Array(events.clone()),
        }
    }
}

type OnComplete = Arc<dyn Fn(SubscriptionStats) + Send + Sync>;
type OnTokenRefresh = Arc<dyn Fn(&RefreshAccessTokenResult) + Send + Sync>;

/// 🎛️ Caller-side knobs for one `on_event`/`on_batch`/`on_delete` call.
#[derive(Clone, Default)]
pub struct EventOptions {
    pub on_complete: Option<OnComplete>,
    pub on_token_refresh: Option<OnTokenRefresh>,
    pub responses: Option<ResponseSink>,
}

impl fmt::Debug for EventOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventOptions")
            .field("on_complete", &self.on_complete.is_some())
            .field("on_token_refresh", &self.on_token_refresh.is_some())
            .field("responses", &self.responses.is_some())
            .finish()
    }
}

impl EventOptions {
    pub fn on_complete<F>(mut self, on_complete: F) -> Self
    where
        F: Fn(SubscriptionStats) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(on_complete));
        self
    }

    pub fn on_token_refresh<F>(mut self, on_token_refresh: F) -> Self
    where
        F: Fn(&RefreshAccessTokenResult) + Send + Sync + 'static,
    {
        self.on_token_refresh = Some(Arc::new(on_token_refresh));
        self
    }

    pub fn collect_responses(mut self, sink: ResponseSink) -> Self {
        self.responses = Some(sink);
        self
    }
}

/// 🏢 A live destination.
pub struct Destination {
    definition: DestinationDefinition,
    actions: BTreeMap<String, Action>,
    settings_schema: Option<Value>,
    request_defaults: RequestOptions,
    retry_attempts: usize,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.definition.name)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

impl Destination {
    pub fn new(definition: DestinationDefinition) -> Self {
        let settings_schema = definition
            .authentication
            .as_ref()
            .filter(|auth| !auth.fields.is_empty())
            .map(|auth| fields_to_schema(&auth.fields, &SchemaOptions::default()));
        let actions = definition
            .actions
            .iter()
            .map(|(slug, action)| {
                let live = Action::new(
                    definition.name.clone(),
                    action.clone(),
                    definition.extend_request.clone(),
                );
                (slug.clone(), live)
            })
            .collect();
        info!(
            destination = %definition.name,
            actions = definition.actions.len(),
            "🏢 destination ready"
        );
        Self {
            definition,
            actions,
            settings_schema,
            request_defaults: RequestOptions::default(),
            retry_attempts: RuntimeConfig::default().attempts(),
        }
    }

    /// Picks up the retry setting. Whatever it says, a call refreshes the token at most once.
    pub fn with_runtime(mut self, runtime: &RuntimeConfig) -> Self {
        self.retry_attempts = runtime.attempts();
        self
    }

    /// Defaults for every request any action or hook of this destination makes.
    pub fn with_request_defaults(mut self, defaults: RequestOptions) -> Self {
        self.actions = std::mem::take(&mut self.actions)
            .into_iter()
            .map(|(slug, action)| (slug, action.with_request_defaults(defaults.clone())))
            .collect();
        self.request_defaults = defaults;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &DestinationDefinition {
        &self.definition
    }

    pub fn action(&self, slug: &str) -> Option<&Action> {
        self.actions.get(slug)
    }

    pub fn settings_schema(&self) -> Option<&Value> {
        self.settings_schema.as_ref()
    }

    /// 🪪 Everything about this destination that is not a function.
    pub fn manifest(&self) -> Manifest {
        Manifest::from_definition(&self.definition)
    }

    fn scheme(&self) -> Option<AuthScheme> {
        self.definition.authentication.as_ref().map(|auth| auth.scheme)
    }

    /// 🎯 Runs every matching subscription for one event.
    pub async fn on_event(
        &self,
        event: &Value,
        settings: &RawSettings,
        options: &EventOptions,
    ) -> Result<Vec<ActionResult>, ActionError> {
        self.on_subscriptions(EventData::Single(event.clone()), settings, options)
            .await
    }

    /// 📦 Runs every matching subscription for a batch, each with its own matching slice.
    pub async fn on_batch(
        &self,
        events: &[Value],
        settings: &RawSettings,
        options: &EventOptions,
    ) -> Result<Vec<ActionResult>, ActionError> {
        self.on_subscriptions(EventData::Batch(events.to_vec()), settings, options)
            .await
    }

    /// Validates settings, then fans out to every subscription concurrently under the
    /// token-refresh retry. Results come back in subscription order, the first error wins.
    pub async fn on_subscriptions(
        &self,
        data: EventData,
        settings: &RawSettings,
        options: &EventOptions,
    ) -> Result<Vec<ActionResult>, ActionError> {
        self.validate_settings(settings)?;
        let data = &data;
        self.with_token_refresh(settings, options, |attempt| async move {
            let subscriptions = get_subscriptions(&attempt);
            let destination_settings = get_destination_settings(&attempt);
            let auth = get_auth_data(&attempt);
            let runs = subscriptions.iter().map(|subscription| {
                self.on_subscription(subscription, data, &destination_settings, &auth, options)
            });
            // 🏃 everyone runs, everyone finishes. only then do we look for the first casualty
            let mut results = Vec::new();
            for outcome in join_all(runs).await {
                results.extend(outcome?);
            }
            Ok(results)
        })
        .await
    }

    /// One subscription against the data. Reports stats through `on_complete` either way.
    pub async fn on_subscription(
        &self,
        subscription: &Subscription,
        data: &EventData,
        settings: &DestinationSettings,
        auth: &AuthTokens,
        options: &EventOptions,
    ) -> Result<Vec<ActionResult>, ActionError> {
        let started = Instant::now();
        let outcome = self
            .run_subscription(subscription, data, settings, auth, options)
            .await;

        if let Some(on_complete) = &options.on_complete {
            let (state, output) = match &outcome {
                Ok((state, results)) => (*state, results.clone()),
                Err(err) => (SubscriptionState::Errored, vec![ActionResult::error(err)]),
            };
            on_complete(SubscriptionStats {
                duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                destination: self.definition.name.clone(),
                action: subscription.partner_action.clone(),
                subscribe: subscription.subscribe.clone().unwrap_or_default(),
                state,
                input: json!({
                    "data": data.as_value(),
                    "mapping": subscription.mapping.clone().unwrap_or(Value::Null),
                    "settings": settings.as_value(),
                }),
                output,
            });
        }

        if let Err(err) = &outcome {
            warn!(
                destination = %self.definition.name,
                action = %subscription.partner_action,
                status = err.status(),
                "💀 subscription failed: {err}"
            );
        }
        outcome.map(|(_, results)| results)
    }

    async fn run_subscription(
        &self,
        subscription: &Subscription,
        data: &EventData,
        settings: &DestinationSettings,
        auth: &AuthTokens,
        options: &EventOptions,
    ) -> Result<(SubscriptionState, Vec<ActionResult>), ActionError> {
        let skipped =
            |output: String| Ok((SubscriptionState::Skipped, vec![ActionResult::output(output)]));

        let Some(subscribe) = subscription
            .subscribe
            .as_deref()
            .filter(|fql| !fql.trim().is_empty())
        else {
            return skipped("invalid subscription".into());
        };
        // 🙈 a broken subscription is the customer's typo, not our outage. skip it and say why
        let condition = match fql::parse(subscribe) {
            Ok(condition) => condition,
            Err(err) => return skipped(format!("invalid subscription : {err}")),
        };
        let mapping = subscription.mapping.clone().unwrap_or_else(|| json!({}));
        let auth = Some(auth.clone());

        match data {
            EventData::Single(event) => {
                if !condition.evaluate(event) {
                    return skipped("not subscribed".into());
                }
                let Some(action) = self.actions.get(&subscription.partner_action) else {
                    debug!(action = %subscription.partner_action, "🎬 no such action, nothing to do");
                    return Ok((SubscriptionState::Done, Vec::new()));
                };
                let results = action
                    .execute(ExecuteBundle {
                        data: event.clone(),
                        mapping,
                        settings: settings.as_value(),
                        auth,
                        responses: options.responses.clone(),
                    })
                    .await?;
                Ok((SubscriptionState::Done, results))
            }
            EventData::Batch(events) => {
                let matching: Vec<Value> = events
                    .iter()
                    .filter(|event| condition.evaluate(event))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    return skipped("not subscribed".into());
                }
                let Some(action) = self.actions.get(&subscription.partner_action) else {
                    debug!(action = %subscription.partner_action, "🎬 no such action, nothing to do");
                    return Ok((SubscriptionState::Done, Vec::new()));
                };
                action
                    .execute_batch(BatchBundle {
                        data: matching,
                        mapping,
                        settings: settings.as_value(),
                        auth,
                        responses: options.responses.clone(),
                    })
                    .await?;
                Ok((
                    SubscriptionState::Done,
                    vec![ActionResult::output("successfully processed batch of events")],
                ))
            }
        }
    }

    /// 🗑️ Forwards a user deletion to the partner. Without a hook there is nothing to do.
    pub async fn on_delete(
        &self,
        event: &Value,
        settings: &RawSettings,
        options: &EventOptions,
    ) -> Result<Value, ActionError> {
        self.validate_settings(settings)?;
        let Some(on_delete) = &self.definition.on_delete else {
            return Ok(json!({ "output": "no onDelete defined" }));
        };

        let mut payload = Map::new();
        for key in ["userId", "anonymousId"] {
            if let Some(id) = event.get(key).filter(|id| !id.is_null()) {
                payload.insert(key.to_string(), id.clone());
            }
        }
        let payload = Value::Object(payload);

        self.with_token_refresh(settings, options, |attempt| {
            let payload = payload.clone();
            async move {
                let input = ExecuteInput {
                    raw_data: event.clone(),
                    settings: get_destination_settings(&attempt).as_value(),
                    payload,
                    auth: Some(get_auth_data(&attempt)),
                    ..ExecuteInput::default()
                };
                let client = self.client_for(&input, options.responses.as_ref());
                Ok(on_delete.call(client, input).await?.into_value())
            }
        })
        .await
    }

    /// 🔐 Validates the settings, then runs the destination's own credential check.
    pub async fn test_authentication(&self, settings: &RawSettings) -> Result<(), ActionError> {
        self.validate_settings(settings)?;
        let Some(test) = self
            .definition
            .authentication
            .as_ref()
            .and_then(|auth| auth.test_authentication.as_ref())
        else {
            return Ok(());
        };

        let input = ExecuteInput {
            settings: get_destination_settings(settings).as_value(),
            auth: Some(get_auth_data(settings)),
            ..ExecuteInput::default()
        };
        let client = self.client_for(&input, None);
        match test.call(client, input).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let status = err.status();
                let detail = err.to_string();
                let message = if detail.is_empty() {
                    format!("Credentials are invalid: {status}")
                } else {
                    format!("Credentials are invalid: {status} {detail}")
                };
                Err(ActionError::integration(message, INVALID_AUTHENTICATION, 401))
            }
        }
    }

    /// 🔄 Runs the refresh hook. `Ok(None)` when the destination has none.
    pub async fn refresh_access_token(
        &self,
        settings: &DestinationSettings,
        oauth: OAuth2ClientCredentials,
    ) -> Result<Option<RefreshAccessTokenResult>, ActionError> {
        if self.scheme() != Some(AuthScheme::OAuth2) {
            return Err(ActionError::integration(
                "refreshAccessToken is only valid with oauth2 authentication scheme",
                NOT_IMPLEMENTED,
                501,
            ));
        }
        let Some(refresh) = self
            .definition
            .authentication
            .as_ref()
            .and_then(|auth| auth.refresh_access_token.as_ref())
        else {
            return Ok(None);
        };

        let input = ExecuteInput {
            settings: settings.as_value(),
            auth: Some(oauth.tokens.clone()),
            ..ExecuteInput::default()
        };
        let client = self.client_for(&input, None);
        Ok(Some(refresh.refresh(client, settings.clone(), oauth).await?))
    }

    /// Choices for one action's dynamic field. Unknown actions answer with an empty list.
    pub async fn execute_dynamic_field(
        &self,
        action_slug: &str,
        field: &str,
        input: ExecuteInput,
    ) -> Result<Value, ActionError> {
        match self.actions.get(action_slug) {
            Some(action) => action.execute_dynamic_field(field, input).await,
            None => Ok(json!([])),
        }
    }

    fn validate_settings(&self, settings: &RawSettings) -> Result<(), ActionError> {
        let Some(schema) = &self.settings_schema else {
            return Ok(());
        };
        let mut candidate = get_destination_settings(settings).as_value();
        validate_schema(
            &mut candidate,
            schema,
            &ValidationOptions::keyed(format!("{}:settings", self.definition.name)),
        )?;
        Ok(())
    }

    fn client_for(
        &self,
        input: &ExecuteInput,
        responses: Option<&ResponseSink>,
    ) -> RequestClient {
        dispatch_client(
            &self.request_defaults,
            self.definition.extend_request.as_ref(),
            input,
            responses,
        )
    }

    /// Runs `attempt` with the settings, refreshing the OAuth token after a 401.
    ///
    /// 🔑 Only oauth2 destinations refresh, and only once per call: after the refresh the
    /// next error goes straight back to the caller, 401 or not. `retry_attempts == 1` turns the
    /// refresh off entirely.
    async fn with_token_refresh<T, F, Fut>(
        &self,
        settings: &RawSettings,
        options: &EventOptions,
        mut attempt: F,
    ) -> Result<T, ActionError>
    where
        F: FnMut(RawSettings) -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        let mut settings = settings.clone();
        let mut refreshed = false;
        loop {
            let err = match attempt(settings.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let refreshable = err.status() == 401 && self.scheme() == Some(AuthScheme::OAuth2);
            // 🚪 one fresh token per call, then we stop knocking
            if !refreshable || refreshed || self.retry_attempts < 2 {
                return Err(err);
            }

            warn!(
                destination = %self.definition.name,
                "🔑 partner said 401, refreshing the access token"
            );
            let fresh = self
                .refresh_access_token(
                    &get_destination_settings(&settings),
                    get_oauth2_data(&settings),
                )
                .await?
                .ok_or_else(|| {
                    ActionError::invalid_authentication("Failed to refresh access token")
                })?;
            settings = update_oauth_settings(&settings, &fresh);
            if let Some(on_token_refresh) = &options.on_token_refresh {
                on_token_refresh(&fresh);
            }
            refreshed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn echo_action() -> ActionDefinition {
        ActionDefinition::new("Send Event", "")
            .field("event", Field::new("Event", FieldType::String))
            .perform(|_request, input| async move { Ok(PerformOutput::Json(input.payload)) })
    }

    fn destination() -> Destination {
        Destination::new(
            DestinationDefinition::new("Actions Test")
                .authentication(
                    Authentication::new(AuthScheme::Custom)
                        .field("apiSecret", Field::new("API Secret", FieldType::String).required()),
                )
                .action("send", echo_action()),
        )
    }

    fn settings_with(subscription: Value) -> RawSettings {
        RawSettings::from(json!({"apiSecret": "s3cr3t", "subscription": subscription}))
    }

    #[tokio::test]
    async fn the_one_where_a_missing_subscribe_is_invalid() {
        let results = destination()
            .on_event(
                &json!({"type": "track"}),
                &settings_with(json!({"partnerAction": "send", "mapping": {}})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 invalid subscriptions are not errors");
        assert_eq!(results, vec![ActionResult::output("invalid subscription")]);
    }

    #[tokio::test]
    async fn the_one_where_unparseable_fql_says_why() {
        let results = destination()
            .on_event(
                &json!({"type": "track"}),
                &settings_with(json!({"partnerAction": "send", "subscribe": "typo", "mapping": {}})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 invalid subscriptions are not errors");
        assert_eq!(
            results,
            vec![ActionResult::output(
                "invalid subscription : Operator token is missing"
            )]
        );
    }

    #[tokio::test]
    async fn the_one_where_the_event_is_not_subscribed() {
        let results = destination()
            .on_event(
                &json!({}),
                &settings_with(json!({"partnerAction": "send", "subscribe": "type = \"track\"", "mapping": {}})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 unmatched events are not errors");
        assert_eq!(results, vec![ActionResult::output("not subscribed")]);
    }

    #[tokio::test]
    async fn the_one_where_bad_settings_stop_everything() {
        let err = destination()
            .on_event(
                &json!({"type": "track"}),
                &RawSettings::from(json!({
                    "subscription": {"partnerAction": "send", "subscribe": "type = \"track\""},
                })),
                &EventOptions::default(),
            )
            .await
            .expect_err("💀 settings are required");
        assert_eq!(
            err.to_string(),
            "The root value is missing the required field 'apiSecret'."
        );
    }

    #[tokio::test]
    async fn the_one_where_a_matching_event_runs_the_action() {
        let stats = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&stats);
        let options = EventOptions::default().on_complete(move |stat| {
            recorded.lock().expect("💀 poisoned").push(stat);
        });

        let results = destination()
            .on_event(
                &json!({"type": "track", "event": "Opened", "properties": {"a": 1}}),
                &settings_with(json!({
                    "partnerAction": "send",
                    "subscribe": "type = \"track\"",
                    "mapping": {"event": {"@path": "$.event"}},
                })),
                &options,
            )
            .await
            .expect("💀 subscribed event should run");

        assert_eq!(
            results,
            vec![
                ActionResult::output("Mappings resolved"),
                ActionResult::output("Payload validated"),
                ActionResult::output(json!({"event": "Opened"})),
            ]
        );
        let stats = stats.lock().expect("💀 poisoned");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].state, SubscriptionState::Done);
        assert_eq!(stats[0].action, "send");
        assert_eq!(stats[0].input["settings"], json!({"apiSecret": "s3cr3t"}));
    }

    #[tokio::test]
    async fn the_one_where_batches_only_carry_matching_events() {
        let seen = Arc::new(Mutex::new(Value::Null));
        let captured = Arc::clone(&seen);
        let dest = Destination::new(
            DestinationDefinition::new("Batcher").action(
                "bulk",
                ActionDefinition::new("Bulk", "").perform_batch(move |_request, input| {
                    let captured = Arc::clone(&captured);
                    async move {
                        *captured.lock().expect("💀 poisoned") = input.payload;
                        Ok(PerformOutput::Nothing)
                    }
                }),
            ),
        );

        let results = dest
            .on_batch(
                &[
                    json!({"type": "track", "event": "a"}),
                    json!({"type": "page"}),
                    json!({"type": "track", "event": "b"}),
                ],
                &RawSettings::from(json!({"subscriptions": [
                    {"partnerAction": "bulk", "subscribe": "type = \"track\"", "mapping": {"e": {"@path": "$.event"}}},
                ]})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 batch should go out");

        assert_eq!(
            results,
            vec![ActionResult::output("successfully processed batch of events")]
        );
        assert_eq!(
            *seen.lock().expect("💀 poisoned"),
            json!([{"e": "a"}, {"e": "b"}])
        );
    }

    fn oauth_destination(server_uri: String, refreshes: Arc<AtomicUsize>) -> Destination {
        Destination::new(
            DestinationDefinition::new("OAuth Test")
                .authentication(Authentication::new(AuthScheme::OAuth2).refresh_access_token(
                    move |_request, _settings, _oauth| {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        async move { Ok(RefreshAccessTokenResult::new("fresh-token")) }
                    },
                ))
                .extend_request(|input| {
                    let token = input
                        .auth
                        .as_ref()
                        .and_then(|auth| auth.access_token.clone())
                        .unwrap_or_default();
                    RequestOptions::new().header("authorization", format!("Bearer {token}"))
                })
                .action(
                    "send",
                    ActionDefinition::new("Send", "").perform(move |request, _input| {
                        let url = format!("{server_uri}/events");
                        async move { Ok(PerformOutput::from(request.post(&url, RequestOptions::new()).await?)) }
                    }),
                ),
        )
    }

    fn oauth_settings() -> RawSettings {
        RawSettings::from(json!({
            "subscription": {"partnerAction": "send", "subscribe": "type = \"track\"", "mapping": {}},
            "oauth": {"access_token": "stale-token", "refresh_token": "r"},
        }))
    }

    #[tokio::test]
    async fn the_one_where_a_401_refreshes_the_token_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("authorization", "Bearer stale-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let refreshes = Arc::new(AtomicUsize::new(0));
        let dest = oauth_destination(server.uri(), Arc::clone(&refreshes));
        let refreshed = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&refreshed);
        let options = EventOptions::default().on_token_refresh(move |fresh| {
            *seen.lock().expect("💀 poisoned") = Some(fresh.clone());
        });

        let results = dest
            .on_event(&json!({"type": "track"}), &oauth_settings(), &options)
            .await
            .expect("💀 the retry should succeed");

        assert_eq!(results.last(), Some(&ActionResult::output(json!({"ok": true}))));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *refreshed.lock().expect("💀 poisoned"),
            Some(RefreshAccessTokenResult::new("fresh-token"))
        );
    }

    #[tokio::test]
    async fn the_one_where_a_second_401_is_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let refreshes = Arc::new(AtomicUsize::new(0));
        let dest = oauth_destination(server.uri(), Arc::clone(&refreshes));
        let err = dest
            .on_event(&json!({"type": "track"}), &oauth_settings(), &EventOptions::default())
            .await
            .expect_err("💀 two strikes");
        assert_eq!(err.status(), 401);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn the_one_where_only_oauth2_refreshes() {
        let err = destination()
            .refresh_access_token(&DestinationSettings::default(), OAuth2ClientCredentials::default())
            .await
            .expect_err("💀 custom auth cannot refresh");
        assert_eq!(
            err.to_string(),
            "refreshAccessToken is only valid with oauth2 authentication scheme"
        );
        assert_eq!(err.status(), 501);
        assert_eq!(err.code(), "NotImplemented");
    }

    #[tokio::test]
    async fn the_one_where_refresh_hands_back_the_new_token() {
        let dest = oauth_destination("http://unused".into(), Arc::new(AtomicUsize::new(0)));
        let fresh = dest
            .refresh_access_token(&DestinationSettings::default(), OAuth2ClientCredentials::default())
            .await
            .expect("💀 refresh should work");
        assert_eq!(fresh, Some(RefreshAccessTokenResult::new("fresh-token")));
        assert_eq!(
            serde_json::to_value(fresh).expect("💀 serialize"),
            json!({"accessToken": "fresh-token"})
        );
    }

    #[tokio::test]
    async fn the_one_where_on_delete_sends_only_the_ids() {
        let dest = Destination::new(
            DestinationDefinition::new("Deleter").on_delete(|_request, input| async move {
                Ok(PerformOutput::Json(input.payload))
            }),
        );
        let deleted = dest
            .on_delete(
                &json!({"userId": "u1", "anonymousId": "a1", "traits": {"x": 1}}),
                &RawSettings::default(),
                &EventOptions::default(),
            )
            .await
            .expect("💀 delete should run");
        assert_eq!(deleted, json!({"userId": "u1", "anonymousId": "a1"}));

        let nothing = destination()
            .on_delete(
                &json!({"userId": "u1"}),
                &RawSettings::from(json!({"apiSecret": "x"})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 no hook is fine");
        assert_eq!(nothing, json!({"output": "no onDelete defined"}));
    }

    #[tokio::test]
    async fn the_one_where_bad_credentials_are_reported_as_such() {
        let dest = Destination::new(
            DestinationDefinition::new("Checker").authentication(
                Authentication::new(AuthScheme::Basic)
                    .field("apiKey", Field::new("API Key", FieldType::String).required())
                    .test_authentication(|_request, input| async move {
                        if input.settings["apiKey"] == "good" {
                            Ok(PerformOutput::Nothing)
                        } else {
                            Err(ActionError::invalid_authentication("nope"))
                        }
                    }),
            ),
        );

        dest.test_authentication(&RawSettings::from(json!({"apiKey": "good"})))
            .await
            .expect("💀 good key should pass");
        let err = dest
            .test_authentication(&RawSettings::from(json!({"apiKey": "bad"})))
            .await
            .expect_err("💀 bad key should fail");
        assert_eq!(err.to_string(), "Credentials are invalid: 401 nope");
        assert_eq!(err.code(), INVALID_AUTHENTICATION);
    }

    #[tokio::test]
    async fn the_one_where_unknown_actions_have_no_dynamic_fields() {
        let choices = destination()
            .execute_dynamic_field("nope", "field", ExecuteInput::default())
            .await
            .expect("💀 unknown action is not an error");
        assert_eq!(choices, json!([]));
    }

    #[test]
    fn the_one_where_the_destination_hands_out_its_manifest() {
        let manifest = destination().manifest();
        assert_eq!(manifest.slug, "actions-test");
        assert_eq!(manifest.scheme, Some(AuthScheme::Custom));
        assert_eq!(manifest.actions.len(), 1);
        assert_eq!(manifest.actions[0].name, "Send Event");
        assert_eq!(manifest.settings[0].field_key, "apiSecret");
    }

    #[tokio::test]
    async fn the_one_where_three_retry_attempts_still_refresh_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let refreshes = Arc::new(AtomicUsize::new(0));
        let dest = oauth_destination(server.uri(), Arc::clone(&refreshes))
            .with_runtime(&RuntimeConfig { retry_attempts: 3 });
        let err = dest
            .on_event(&json!({"type": "track"}), &oauth_settings(), &EventOptions::default())
            .await
            .expect_err("💀 the partner hates every token we have");

        assert_eq!(err.status(), 401);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        let calls = server.received_requests().await.expect("💀 recording is on");
        assert_eq!(calls.len(), 2);
    }

    #[tokio::test]
    async fn the_one_where_a_single_attempt_never_refreshes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let refreshes = Arc::new(AtomicUsize::new(0));
        let dest = oauth_destination(server.uri(), Arc::clone(&refreshes))
            .with_runtime(&RuntimeConfig { retry_attempts: 1 });
        let err = dest
            .on_event(&json!({"type": "track"}), &oauth_settings(), &EventOptions::default())
            .await
            .expect_err("💀 one strike is all we get");
        assert_eq!(err.status(), 401);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    }

    /// 😴 Naps for `nap_ms`, signs `finished`, then echoes the payload or fails with `fail_with`.
    fn napping_action(
        name: &'static str,
        nap_ms: u64,
        finished: Arc<Mutex<Vec<&'static str>>>,
        fail_with: Option<&'static str>,
    ) -> ActionDefinition {
        ActionDefinition::new(name, "").perform(move |_request, input| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(nap_ms)).await;
                finished.lock().expect("💀 poisoned").push(name);
                match fail_with {
                    Some(message) => Err(ActionError::integration(message, "Boom", 400)),
                    None => Ok(PerformOutput::Json(input.payload)),
                }
            }
        })
    }

    #[tokio::test]
    async fn the_one_where_subscriptions_fan_out_and_come_back_in_order() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let dest = Destination::new(
            DestinationDefinition::new("Fan Out")
                .action("slow", napping_action("slow", 80, Arc::clone(&finished), None))
                .action("fast", napping_action("fast", 0, Arc::clone(&finished), None)),
        );

        let results = dest
            .on_event(
                &json!({"type": "track", "event": "Opened"}),
                &RawSettings::from(json!({"subscriptions": [
                    {"partnerAction": "slow", "subscribe": "type = \"track\"", "mapping": {"who": {"@literal": "slow"}}},
                    {"partnerAction": "fast", "subscribe": "type = \"track\"", "mapping": {"who": {"@literal": "fast"}}},
                ]})),
                &EventOptions::default(),
            )
            .await
            .expect("💀 both subscriptions should run");

        // 🏁 fast beat slow to the finish line, so they really did run side by side
        assert_eq!(*finished.lock().expect("💀 poisoned"), vec!["fast", "slow"]);
        // 📋 ...but the results still line up with the subscription list
        assert_eq!(
            results,
            vec![
                ActionResult::output("Mappings resolved"),
                ActionResult::output(json!({"who": "slow"})),
                ActionResult::output("Mappings resolved"),
                ActionResult::output(json!({"who": "fast"})),
            ]
        );
    }

    #[tokio::test]
    async fn the_one_where_the_first_error_in_line_wins_after_everyone_finishes() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let dest = Destination::new(
            DestinationDefinition::new("Fan Out")
                .action("late", napping_action("late", 60, Arc::clone(&finished), Some("late boom")))
                .action("early", napping_action("early", 0, Arc::clone(&finished), Some("early boom")))
                .action("fine", napping_action("fine", 20, Arc::clone(&finished), None)),
        );
        let stats = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&stats);
        let options = EventOptions::default().on_complete(move |stat| {
            recorded.lock().expect("💀 poisoned").push(stat.state);
        });

        let err = dest
            .on_event(
                &json!({"type": "track"}),
                &RawSettings::from(json!({"subscriptions": [
                    {"partnerAction": "late", "subscribe": "type = \"track\"", "mapping": {}},
                    {"partnerAction": "early", "subscribe": "type = \"track\"", "mapping": {}},
                    {"partnerAction": "fine", "subscribe": "type = \"track\"", "mapping": {}},
                ]})),
                &options,
            )
            .await
            .expect_err("💀 two of three blew up");

        assert_eq!(err.to_string(), "late boom");
        let mut finished = finished.lock().expect("💀 poisoned").clone();
        finished.sort_unstable();
        assert_eq!(finished, vec!["early", "fine", "late"]);
        let mut states = stats.lock().expect("💀 poisoned").clone();
        states.sort_by_key(|state| format!("{state:?}"));
        assert_eq!(
            states,
            vec![
                SubscriptionState::Done,
                SubscriptionState::Errored,
                SubscriptionState::Errored,
            ]
        );
    }

    #[tokio::test]
    async fn the_one_where_on_delete_survives_a_stale_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delete"))
            .and(header("authorization", "Bearer stale-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/delete"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": true})))
            .expect(1)
            .mount(&server)
            .await;

        let refreshes = Arc::new(AtomicUsize::new(0));
        let uri = server.uri();
        let mut definition = oauth_destination(uri.clone(), Arc::clone(&refreshes))
            .definition()
            .clone();
        definition = definition.on_delete(move |request, input| {
            let url = format!("{uri}/delete");
            async move {
                let sent = request
                    .post(&url, RequestOptions::new().json(input.payload))
                    .await?;
                Ok(PerformOutput::from(sent))
            }
        });

        let deleted = Destination::new(definition)
            .on_delete(&json!({"userId": "u1"}), &oauth_settings(), &EventOptions::default())
            .await
            .expect("💀 the refreshed delete should land");

        assert_eq!(deleted, json!({"deleted": true}));
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }
}
