//! 🎬 Actions: one partner operation, fed by a mapping and guarded by a schema.
//!
//! ```text
//!   event ──▶ transform(mapping) ──▶ clean ──▶ validate ──▶ cached fields ──▶ perform
//!                "Mappings resolved"        "Payload validated"                {output}
//! ```
//!
//! Every dispatch gets a fresh [`RequestClient`]: the configured defaults, then whatever the
//! destination's `extend_request` says for this input, then a response collector when the
//! caller asked for one.
//!
//! 🎭 An action is the actor of this little play. The mapping is its script and the schema is
//! the director who yells "cut" before anyone embarrasses themselves in front of a partner API.
//! The actor never improvises. 🦆

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::destination::AuthTokens;
use crate::errors::{ActionError, RequestError};
use crate::mapping::{transform, transform_batch};
use crate::request_client::{
    AfterResponse, RequestClient, RequestOptions, RequestSnapshot, Response,
};
use crate::schema::{
    Field, FieldMap, SchemaOptions, ValidationOptions, fields_to_schema, remove_empty_values,
    validate_schema,
};

/// Cached field entries per action before new keys stop being remembered.
pub const CACHED_FIELD_CAPACITY: usize = 1000;

/// Where collected responses go. Unbounded senders never drop a response.
pub type ResponseSink = async_channel::Sender<Response>;

/// Per-dispatch request options derived from the input, merged over the defaults.
pub type ExtendRequest = Arc<dyn Fn(&ExecuteInput) -> RequestOptions + Send + Sync>;

/// 📦 What a perform, dynamic field or cached field function gets to look at.
#[derive(Debug, Clone, Default)]
pub struct ExecuteInput {
    /// The event before mapping.
    pub raw_data: Value,
    pub raw_mapping: Value,
    /// Destination settings, subscriptions and oauth already stripped.
    pub settings: Value,
    /// The mapped, cleaned and validated payload. An array for batches.
    pub payload: Value,
    pub auth: Option<AuthTokens>,
    pub cached_fields: Map<String, Value>,
    /// Pagination cursor for dynamic fields.
    pub page: Option<String>,
}

/// What a request function hands back.
#[derive(Debug, Clone)]
pub enum PerformOutput {
    Response(Response),
    Json(Value),
    Nothing,
}

impl PerformOutput {
    pub fn into_value(self) -> Value {
        match self {
            PerformOutput::Response(response) => response.body_value(),
            PerformOutput::Json(value) => value,
            PerformOutput::Nothing => Value::Null,
        }
    }
}

impl From<Response> for PerformOutput {
    fn from(response: Response) -> Self {
        PerformOutput::Response(response)
    }
}

impl From<Value> for PerformOutput {
    fn from(value: Value) -> Self {
        PerformOutput::Json(value)
    }
}

impl From<()> for PerformOutput {
    fn from(_: ()) -> Self {
        PerformOutput::Nothing
    }
}

/// 🚀 A partner call: perform, perform_batch, dynamic fields, cached fields, test auth, delete.
#[async_trait]
pub trait RequestFn: Send + Sync {
    async fn call(
        &self,
        request: RequestClient,
        input: ExecuteInput,
    ) -> Result<PerformOutput, ActionError>;
}

#[async_trait]
impl<F, Fut> RequestFn for F
where
    F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PerformOutput, ActionError>> + Send,
{
    async fn call(
        &self,
        request: RequestClient,
        input: ExecuteInput,
    ) -> Result<PerformOutput, ActionError> {
        (self)(request, input).await
    }
}

/// One entry in an action's result log. Serializes as `{"output": ..}` or `{"error": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Output(Value),
    Error(Value),
}

impl ActionResult {
    pub fn output(value: impl Into<Value>) -> Self {
        ActionResult::Output(value.into())
    }

    /// `{"error": {"message": ..}}` for anything that went wrong.
    pub fn error(err: &ActionError) -> Self {
        ActionResult::Error(json!({ "message": err.to_string() }))
    }
}

/// 🗄️ A value fetched before perform and remembered per key for `ttl`.
#[derive(Clone)]
pub struct CachedFieldDefinition {
    pub key: Arc<dyn Fn(&ExecuteInput) -> String + Send + Sync>,
    pub ttl: Duration,
    pub value: Arc<dyn RequestFn>,
    /// Remember misses (404s) too.
    pub negative: bool,
}

impl CachedFieldDefinition {
    pub fn new<K, F, Fut>(ttl: Duration, key: K, value: F) -> Self
    where
        K: Fn(&ExecuteInput) -> String + Send + Sync + 'static,
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        Self {
            key: Arc::new(key),
            ttl,
            value: Arc::new(value),
            negative: false,
        }
    }

    pub fn negative(mut self) -> Self {
        self.negative = true;
        self
    }
}

impl fmt::Debug for CachedFieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFieldDefinition")
            .field("ttl", &self.ttl)
            .field("negative", &self.negative)
            .finish_non_exhaustive()
    }
}

/// 📋 Everything an action declares about itself.
#[derive(Clone, Default)]
pub struct ActionDefinition {
    pub title: String,
    pub description: String,
    /// FQL used by presets when the action is first enabled.
    pub default_subscription: Option<String>,
    pub hidden: bool,
    pub fields: FieldMap,
    pub perform: Option<Arc<dyn RequestFn>>,
    pub perform_batch: Option<Arc<dyn RequestFn>>,
    pub dynamic_fields: BTreeMap<String, Arc<dyn RequestFn>>,
    pub cached_fields: BTreeMap<String, CachedFieldDefinition>,
}

impl fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("title", &self.title)
            .field("default_subscription", &self.default_subscription)
            .field("hidden", &self.hidden)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("perform", &self.perform.is_some())
            .field("perform_batch", &self.perform_batch.is_some())
            .field("dynamic_fields", &self.dynamic_fields.keys().collect::<Vec<_>>())
            .field("cached_fields", &self.cached_fields)
            .finish()
    }
}

impl ActionDefinition {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn default_subscription(mut self, fql: impl Into<String>) -> Self {
        self.default_subscription = Some(fql.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn field(mut self, key: impl Into<String>, field: Field) -> Self {
        self.fields.insert(key.into(), field);
        self
    }

    pub fn perform<F, Fut>(mut self, perform: F) -> Self
    where
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        self.perform = Some(Arc::new(perform));
        self
    }

    pub fn perform_batch<F, Fut>(mut self, perform_batch: F) -> Self
    where
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        self.perform_batch = Some(Arc::new(perform_batch));
        self
    }

    pub fn dynamic_field<F, Fut>(mut self, field: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        self.dynamic_fields.insert(field.into(), Arc::new(fetch));
        self
    }

    pub fn cached_field(mut self, name: impl Into<String>, cached: CachedFieldDefinition) -> Self {
        self.cached_fields.insert(name.into(), cached);
        self
    }
}

/// One event on its way through an action.
#[derive(Debug, Clone, Default)]
pub struct ExecuteBundle {
    pub data: Value,
    /// `Value::Null` passes the event through unmapped.
    pub mapping: Value,
    pub settings: Value,
    pub auth: Option<AuthTokens>,
    pub responses: Option<ResponseSink>,
}

/// A batch on its way through an action.
#[derive(Debug, Clone, Default)]
pub struct BatchBundle {
    pub data: Vec<Value>,
    pub mapping: Value,
    pub settings: Value,
    pub auth: Option<AuthTokens>,
    pub responses: Option<ResponseSink>,
}

// (expires_at, value), None is a remembered miss
type CacheSlots = HashMap<String, (Instant, Option<Value>)>;

struct CachedField {
    name: String,
    definition: CachedFieldDefinition,
    slots: Mutex<CacheSlots>,
}

impl CachedField {
    async fn fetch(
        &self,
        client: RequestClient,
        input: &ExecuteInput,
    ) -> Result<Option<Value>, ActionError> {
        let key = (self.definition.key)(input);
        let now = Instant::now();
        if let Some((expires_at, cached)) = self.slots.lock().await.get(&key)
            && *expires_at > now
        {
            trace!(field = %self.name, %key, "🗄️ cached field hit");
            return Ok(cached.clone());
        }

        let fetched = match self.definition.value.call(client, input.clone()).await {
            Ok(output) => Some(output.into_value()),
            // 🤷 a 404 is an answer too. "nothing here" is still a fact worth knowing
            Err(ActionError::Request(err)) if err.response().is_some_and(|r| r.status == 404) => {
                None
            }
            Err(err) => return Err(err),
        };

        if fetched.is_some() || self.definition.negative {
            let mut slots = self.slots.lock().await;
            if slots.len() >= CACHED_FIELD_CAPACITY {
                // 🧹 spring cleaning, but only for things that already went bad
                slots.retain(|_, (expires_at, _)| *expires_at > now);
            }
            if slots.len() < CACHED_FIELD_CAPACITY || slots.contains_key(&key) {
                slots.insert(key, (now + self.definition.ttl, fetched.clone()));
            } else {
                debug!(field = %self.name, "🗄️ cached field is full, not remembering this one");
            }
        }
        Ok(fetched)
    }
}

/// 🎬 A live action: definition plus derived schema plus caches.
pub struct Action {
    destination_name: String,
    definition: ActionDefinition,
    schema: Option<Value>,
    extend_request: Option<ExtendRequest>,
    request_defaults: RequestOptions,
    cached_fields: Vec<CachedField>,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("destination_name", &self.destination_name)
            .field("definition", &self.definition)
            .field("has_schema", &self.schema.is_some())
            .finish_non_exhaustive()
    }
}

impl Action {
    pub fn new(
        destination_name: impl Into<String>,
        definition: ActionDefinition,
        extend_request: Option<ExtendRequest>,
    ) -> Self {
        let schema = (!definition.fields.is_empty())
            .then(|| fields_to_schema(&definition.fields, &SchemaOptions::default()));
        let cached_fields = definition
            .cached_fields
            .iter()
            .map(|(name, cached)| CachedField {
                name: name.clone(),
                definition: cached.clone(),
                slots: Mutex::new(HashMap::new()),
            })
            .collect();
        Self {
            destination_name: destination_name.into(),
            definition,
            schema,
            extend_request,
            request_defaults: RequestOptions::default(),
            cached_fields,
        }
    }

    /// Options every request of this action starts from, before `extend_request`.
    pub fn with_request_defaults(mut self, defaults: RequestOptions) -> Self {
        self.request_defaults = defaults;
        self
    }

    pub fn definition(&self) -> &ActionDefinition {
        &self.definition
    }

    pub fn title(&self) -> &str {
        &self.definition.title
    }

    /// The draft-07 schema derived from the fields, `None` when there are no fields.
    pub fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub fn has_batch_support(&self) -> bool {
        self.definition.perform_batch.is_some()
    }

    fn schema_key(&self) -> String {
        format!("{}:{}", self.destination_name, self.definition.title)
    }

    /// 🚀 Maps, validates and performs one event.
    pub async fn execute(&self, bundle: ExecuteBundle) -> Result<Vec<ActionResult>, ActionError> {
        let mapped = if bundle.mapping.is_null() {
            bundle.data.clone()
        } else {
            transform(&bundle.mapping, &bundle.data)?.unwrap_or_else(|| json!({}))
        };
        let mut results = vec![ActionResult::output("Mappings resolved")];

        let payload = match &self.schema {
            Some(schema) => {
                let mut cleaned = remove_empty_values(mapped, schema, true).unwrap_or(Value::Null);
                validate_schema(
                    &mut cleaned,
                    schema,
                    &ValidationOptions::keyed(self.schema_key()),
                )?;
                results.push(ActionResult::output("Payload validated"));
                cleaned
            }
            None => mapped,
        };

        let mut input = ExecuteInput {
            raw_data: bundle.data,
            raw_mapping: bundle.mapping,
            settings: bundle.settings,
            payload,
            auth: bundle.auth,
            ..ExecuteInput::default()
        };
        self.fill_cached_fields(&mut input, bundle.responses.as_ref())
            .await?;

        let output = match &self.definition.perform {
            Some(perform) => {
                let client = self.client_for(&input, bundle.responses.as_ref());
                perform.call(client, input).await?.into_value()
            }
            None => Value::Null,
        };
        debug!(
            destination = %self.destination_name,
            action = %self.definition.title,
            "🎬 action performed"
        );
        results.push(ActionResult::Output(output));
        Ok(results)
    }

    /// 📦 Maps every event, drops the ones that fail validation and performs the rest at once.
    ///
    /// `Ok(None)` means nothing survived and nothing was sent.
    pub async fn execute_batch(&self, bundle: BatchBundle) -> Result<Option<Value>, ActionError> {
        let Some(perform_batch) = &self.definition.perform_batch else {
            return Err(ActionError::not_implemented(
                "This action does not support batched requests.",
            ));
        };

        let mapped: Vec<Value> = if bundle.mapping.is_null() {
            bundle.data.clone()
        } else {
            transform_batch(&bundle.mapping, &bundle.data)?
                .into_iter()
                .map(|payload| payload.unwrap_or_else(|| json!({})))
                .collect()
        };

        let payloads = match &self.schema {
            Some(schema) => {
                let options = ValidationOptions::keyed(self.schema_key()).lenient();
                let mut kept = Vec::with_capacity(mapped.len());
                for (index, payload) in mapped.into_iter().enumerate() {
                    let Some(mut cleaned) = remove_empty_values(payload, schema, true) else {
                        continue;
                    };
                    if validate_schema(&mut cleaned, schema, &options)? {
                        kept.push(cleaned);
                    } else {
                        // 🚮 one bad apple does not get to spoil the whole batch
                        warn!(
                            action = %self.definition.title,
                            index,
                            "📦 dropping batch item that failed validation"
                        );
                    }
                }
                kept
            }
            None => mapped,
        };

        if payloads.is_empty() {
            debug!(action = %self.definition.title, "📦 nothing left in the batch to send");
            return Ok(None);
        }

        let mut input = ExecuteInput {
            raw_data: Value::Array(bundle.data),
            raw_mapping: bundle.mapping,
            settings: bundle.settings,
            payload: Value::Array(payloads),
            auth: bundle.auth,
            ..ExecuteInput::default()
        };
        self.fill_cached_fields(&mut input, bundle.responses.as_ref())
            .await?;
        let client = self.client_for(&input, bundle.responses.as_ref());
        Ok(Some(perform_batch.call(client, input).await?.into_value()))
    }

    /// Choices for a dynamic field. Unknown fields answer with an empty list and a 404 error.
    pub async fn execute_dynamic_field(
        &self,
        field: &str,
        input: ExecuteInput,
    ) -> Result<Value, ActionError> {
        let Some(fetch) = self.definition.dynamic_fields.get(field) else {
            return Ok(json!({
                "choices": [],
                "nextPage": "",
                "error": {
                    "code": "404",
                    "message": format!("No dynamic field named {field} found."),
                },
            }));
        };
        let client = self.client_for(&input, None);
        Ok(fetch.call(client, input).await?.into_value())
    }

    async fn fill_cached_fields(
        &self,
        input: &mut ExecuteInput,
        responses: Option<&ResponseSink>,
    ) -> Result<(), ActionError> {
        for cached in &self.cached_fields {
            let client = self.client_for(input, responses);
            let value = cached.fetch(client, input).await?;
            input
                .cached_fields
                .insert(cached.name.clone(), value.unwrap_or(Value::Null));
        }
        Ok(())
    }

    fn client_for(&self, input: &ExecuteInput, responses: Option<&ResponseSink>) -> RequestClient {
        dispatch_client(
            &self.request_defaults,
            self.extend_request.as_ref(),
            input,
            responses,
        )
    }
}

/// Defaults, then `extend_request(input)`, then a response collector.
pub(crate) fn dispatch_client(
    defaults: &RequestOptions,
    extend_request: Option<&ExtendRequest>,
    input: &ExecuteInput,
    responses: Option<&ResponseSink>,
) -> RequestClient {
    let mut options = defaults.clone();
    if let Some(extend) = extend_request {
        options = options.merge(&extend(input));
    }
    if let Some(sink) = responses {
        options = options.with_after_response(Arc::new(CollectResponses(sink.clone())));
    }
    RequestClient::new(options)
}

struct CollectResponses(ResponseSink);

#[async_trait]
impl AfterResponse for CollectResponses {
    async fn after_response(
        &self,
        _request: &RequestSnapshot,
        _options: &RequestOptions,
        response: Response,
    ) -> Result<Response, RequestError> {
        if let Err(err) = self.0.try_send(response.clone()) {
            trace!("📬 response sink is not taking responses: {err}");
        }
        Ok(response)
    }
}
