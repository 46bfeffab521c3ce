//! 📡 The request client: reqwest underneath, merged options, hooks and timeouts on top.
//!
//! ```text
//!   defaults ⊕ options ─▶ before hooks ─▶ build ─▶ send ⟂ timeout ⟂ signal ─▶ buffer
//!                                                                                 │
//!                          Response | RequestError::Http ◀── after hooks ◀────────┘
//! ```
//!
//! Every request owns its own `CancellationToken`. A caller `signal` becomes its parent, so
//! cancelling the caller's token aborts the request, and a timeout cancels only the request.
//!
//! 📡 Partner APIs are like cats. Sometimes they answer, sometimes they stare at you for 30
//! seconds and walk away. The timeout is how we stop waiting for the cat.

mod hooks;
mod options;
mod response;

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use reqwest::{Method, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::errors::RequestError;

pub use hooks::{AfterResponse, BeforeRequest};
pub use options::{DEFAULT_TIMEOUT, RequestOptions, Timeout, UNSET_HEADER};
pub use response::{RequestSnapshot, Response};

// one connection pool per process, clients only differ by their defaults
static HTTP: LazyLock<reqwest::Client> = LazyLock::new(reqwest::Client::new);

/// 📡 A cheap-to-clone handle carrying default options.
#[derive(Debug, Clone)]
pub struct RequestClient {
    http: reqwest::Client,
    defaults: Arc<RequestOptions>,
}

impl Default for RequestClient {
    fn default() -> Self {
        Self::new(RequestOptions::default())
    }
}

impl RequestClient {
    pub fn new(defaults: RequestOptions) -> Self {
        Self {
            http: HTTP.clone(),
            defaults: Arc::new(defaults),
        }
    }

    /// A new client whose defaults are ours merged with `more`.
    pub fn extend(&self, more: RequestOptions) -> Self {
        Self {
            http: self.http.clone(),
            defaults: Arc::new(self.defaults.merge(&more)),
        }
    }

    pub fn defaults(&self) -> &RequestOptions {
        &self.defaults
    }

    pub async fn get(&self, url: &str) -> Result<Response, RequestError> {
        self.request(url, RequestOptions::new().method("GET")).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<Response, RequestError> {
        self.request(url, options.method("POST")).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<Response, RequestError> {
        self.request(url, options.method("PUT")).await
    }

    pub async fn patch(&self, url: &str, options: RequestOptions) -> Result<Response, RequestError> {
        self.request(url, options.method("PATCH")).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<Response, RequestError> {
        self.request(url, options.method("DELETE")).await
    }

    /// Sends one request.
    ///
    /// Fails with `Http` on a non-2xx status unless `throw_http_errors` is off, `Timeout`
    /// when the limit passes first, `Aborted` when the caller's signal fires first.
    pub async fn request(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, RequestError> {
        let mut options = self.defaults.merge(&options);

        let before = options.before_request.clone();
        for hook in &before {
            if let Some(patch) = hook.before_request(&options).await? {
                trace!("🪝 before_request hook patched the options");
                options = options.merge(&patch);
            }
        }

        let (request, body) = self.build(url, &options)?;
        let snapshot = RequestSnapshot::of(&request, body);
        debug!(method = %snapshot.method, url = %snapshot.url, "📡 sending request");

        let token = options
            .signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let started = Instant::now();
        let exchange = async {
            let raw = self.http.execute(request).await?;
            Response::read(raw, snapshot.clone()).await
        };

        let outcome = match options.effective_timeout() {
            Timeout::After(limit) => tokio::select! {
                result = exchange => result,
                _ = token.cancelled() => Err(RequestError::Aborted {
                    request: Box::new(snapshot.clone()),
                }),
                _ = tokio::time::sleep(limit) => {
                    // ⏰ the cat has stared long enough
                    token.cancel();
                    Err(RequestError::Timeout {
                        request: Box::new(snapshot.clone()),
                        options: Box::new(options.clone()),
                    })
                }
            },
            Timeout::Disabled => tokio::select! {
                result = exchange => result,
                _ = token.cancelled() => Err(RequestError::Aborted {
                    request: Box::new(snapshot.clone()),
                }),
            },
        };
        let mut response = outcome?;
        debug!(
            status = response.status,
            elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
            url = %snapshot.url,
            "📬 response received"
        );

        for hook in &options.after_response {
            response = hook.after_response(&snapshot, &options, response).await?;
        }

        // 💀 after hooks saw it first, now it gets to be an error
        if !response.ok() && options.throw_http_errors.unwrap_or(true) {
            return Err(RequestError::Http {
                response: Box::new(response),
                request: Box::new(snapshot),
                options: Box::new(options),
            });
        }
        Ok(response)
    }

    fn build(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<(reqwest::Request, Option<String>), RequestError> {
        let method_name = options.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| RequestError::InvalidRequest(format!("unsupported method {method_name}")))?;

        let mut url = Url::parse(url)
            .map_err(|err| RequestError::InvalidRequest(format!("{url} is not a valid URL: {err}")))?;
        if let Some(params) = options.search_params.as_ref().filter(|p| !p.is_empty()) {
            url.set_query(None);
            url.query_pairs_mut()
                .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let mut builder = self.http.request(method, url);
        for (name, value) in options.outgoing_headers() {
            builder = builder.header(name, value);
        }
        if let Some(username) = &options.username {
            builder = builder.basic_auth(username, options.password.as_ref());
        }

        let body = match &options.json {
            Some(json) => {
                builder = builder.header(reqwest::header::CONTENT_TYPE, "application/json");
                Some(serde_json::to_string(json).map_err(|err| {
                    RequestError::InvalidRequest(format!("json body does not serialize: {err}"))
                })?)
            }
            None => options.body.clone(),
        };
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        Ok((builder.build()?, body))
    }
}
