//! ⚙️ Request options and how two sets of them merge.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::hooks::{AfterFn, AfterResponse, BeforeFn, BeforeRequest};
use super::response::{RequestSnapshot, Response};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Header value that removes the header instead of setting it.
pub const UNSET_HEADER: &str = "undefined";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Disabled,
}

/// ⚙️ Everything one request can be told.
///
/// Every scalar is optional so that a later set only overrides what it actually says.
/// Header names are stored lowercased.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Serialized as the body with `content-type: application/json`. Wins over `body`.
    pub json: Option<Value>,
    pub body: Option<String>,
    /// Replaces the query string of the URL entirely.
    pub search_params: Option<Vec<(String, String)>>,
    pub timeout: Option<Timeout>,
    pub throw_http_errors: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Caller-side cancellation. Cancelling it aborts the request.
    pub signal: Option<CancellationToken>,
    pub before_request: Vec<Arc<dyn BeforeRequest>>,
    pub after_response: Vec<Arc<dyn AfterResponse>>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("json", &self.json)
            .field("body", &self.body)
            .field("search_params", &self.search_params)
            .field("timeout", &self.timeout)
            .field("throw_http_errors", &self.throw_http_errors)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("signal", &self.signal.is_some())
            .field("before_request", &self.before_request.len())
            .field("after_response", &self.after_response.len())
            .finish()
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn search_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        upsert_param(
            self.search_params.get_or_insert_with(Vec::new),
            key.into(),
            value.to_string(),
        );
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(Timeout::After(limit));
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(Timeout::Disabled);
        self
    }

    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = Some(throw);
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn signal(mut self, token: CancellationToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Runs before the request goes out. Returned options are merged into the current ones.
    pub fn on_before_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestOptions) -> Option<RequestOptions> + Send + Sync + 'static,
    {
        self.before_request.push(Arc::new(BeforeFn(hook)));
        self
    }

    /// Runs once the response is buffered. Whatever it returns becomes the response.
    pub fn on_after_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestSnapshot, &RequestOptions, Response) -> Response + Send + Sync + 'static,
    {
        self.after_response.push(Arc::new(AfterFn(hook)));
        self
    }

    pub fn with_before_request(mut self, hook: Arc<dyn BeforeRequest>) -> Self {
        self.before_request.push(hook);
        self
    }

    pub fn with_after_response(mut self, hook: Arc<dyn AfterResponse>) -> Self {
        self.after_response.push(hook);
        self
    }

    /// `self` overlaid with `other`.
    ///
    /// Scalars from `other` replace ours when set. Headers merge by name, with
    /// [`UNSET_HEADER`] deleting. Search params merge by key. Hook lists concatenate, ours
    /// first.
    pub fn merge(&self, other: &RequestOptions) -> RequestOptions {
        let mut merged = self.clone();

        for (name, value) in &other.headers {
            let name = name.to_ascii_lowercase();
            if value == UNSET_HEADER {
                merged.headers.remove(&name);
            } else {
                merged.headers.insert(name, value.clone());
            }
        }

        if let Some(params) = &other.search_params {
            let target = merged.search_params.get_or_insert_with(Vec::new);
            for (key, value) in params {
                upsert_param(target, key.clone(), value.clone());
            }
        }

        replace(&mut merged.method, &other.method);
        replace(&mut merged.json, &other.json);
        replace(&mut merged.body, &other.body);
        replace(&mut merged.timeout, &other.timeout);
        replace(&mut merged.throw_http_errors, &other.throw_http_errors);
        replace(&mut merged.username, &other.username);
        replace(&mut merged.password, &other.password);
        replace(&mut merged.signal, &other.signal);

        merged
            .before_request
            .extend(other.before_request.iter().cloned());
        merged
            .after_response
            .extend(other.after_response.iter().cloned());
        merged
    }

    pub(crate) fn effective_timeout(&self) -> Timeout {
        self.timeout.unwrap_or(Timeout::After(DEFAULT_TIMEOUT))
    }

    /// Headers that will actually be sent.
    pub(crate) fn outgoing_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .filter(|(_, value)| value.as_str() != UNSET_HEADER)
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

fn replace<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if let Some(value) = source {
        *target = Some(value.clone());
    }
}

fn upsert_param(params: &mut Vec<(String, String)>, key: String, value: String) {
    match params.iter_mut().find(|(k, _)| *k == key) {
        Some(existing) => existing.1 = value,
        None => params.push((key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_later_scalars_win() {
        let base = RequestOptions::new().method("get").timeout(Duration::from_secs(1));
        let merged = base.merge(&RequestOptions::new().method("post").json(json!({"a": 1})));
        assert_eq!(merged.method.as_deref(), Some("post"));
        assert_eq!(merged.timeout, Some(Timeout::After(Duration::from_secs(1))));
        assert_eq!(merged.json, Some(json!({"a": 1})));
        assert_eq!(merged.throw_http_errors, None);
    }

    #[test]
    fn the_one_where_headers_dedupe_and_undefined_deletes() {
        let base = RequestOptions::new()
            .header("X-Foo", "1")
            .header("Authorization", "Bearer abc");
        let merged = base.merge(
            &RequestOptions::new()
                .header("x-foo", "2")
                .header("AUTHORIZATION", UNSET_HEADER),
        );
        assert_eq!(merged.headers.len(), 1);
        assert_eq!(merged.headers.get("x-foo").map(String::as_str), Some("2"));
    }

    #[test]
    fn the_one_where_search_params_merge_by_key() {
        let base = RequestOptions::new().search_param("a", 1).search_param("b", "x");
        let merged = base.merge(&RequestOptions::new().search_param("b", "y").search_param("c", true));
        assert_eq!(
            merged.search_params,
            Some(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "y".to_string()),
                ("c".to_string(), "true".to_string()),
            ])
        );
    }

    #[test]
    fn the_one_where_hooks_pile_up_in_order() {
        let base = RequestOptions::new().on_before_request(|_| None);
        let merged = base.merge(
            &RequestOptions::new()
                .on_before_request(|_| None)
                .on_after_response(|_, _, response| response),
        );
        assert_eq!(merged.before_request.len(), 2);
        assert_eq!(merged.after_response.len(), 1);
        assert_eq!(merged.effective_timeout(), Timeout::After(DEFAULT_TIMEOUT));
    }
}
