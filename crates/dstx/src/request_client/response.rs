//! 📬 Fully buffered responses and the request that produced them.

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::errors::RequestError;

/// What actually went over the wire, kept for logs and error reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

impl RequestSnapshot {
    pub(crate) fn of(request: &reqwest::Request, body: Option<String>) -> Self {
        Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers: header_map(request.headers()),
            body,
        }
    }
}

/// 📬 A response with its body already read.
///
/// `data` holds the parsed body when it was JSON, `content` always holds the raw text.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub content: String,
    pub data: Option<Value>,
    pub request: Option<RequestSnapshot>,
}

impl Response {
    pub(crate) async fn read(
        raw: reqwest::Response,
        request: RequestSnapshot,
    ) -> Result<Self, RequestError> {
        let status = raw.status();
        let url = raw.url().to_string();
        let headers = header_map(raw.headers());
        let content = raw.text().await?;
        let data = if content.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&content).ok()
        };
        Ok(Self {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            url,
            headers,
            content,
            data,
            request: Some(request),
        })
    }

    /// 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parsed body when there is one, raw text otherwise.
    pub fn body_value(&self) -> Value {
        self.data
            .clone()
            .unwrap_or_else(|| Value::String(self.content.clone()))
    }
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}
