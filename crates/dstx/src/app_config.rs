//! 🔧 App Configuration: TOML file and `DSTX_*` env vars, folded into one struct by Figment.
//!
//! ```toml
//! [request]
//! timeout_ms = 5000          # 0 disables the timeout
//! throw_http_errors = true
//! user_agent = "dstx/0.1"
//! headers = { x-team = "growth" }
//!
//! [runtime]
//! retry_attempts = 2         # 1 = never refresh, 2 (or more) = one refresh and one more try
//! ```
//!
//! Env vars nest with a double underscore: `DSTX_REQUEST__TIMEOUT_MS=2500`.
//!
//! 📡 "It worked on my machine." Sure it did. Your machine had `DSTX_REQUEST__TIMEOUT_MS=0` set
//! since 2019 and you forgot. Figment did not forget. Figment never forgets. 🐘

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::request_client::RequestOptions;

/// 📦 Everything configurable, with defaults for every field.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 📡 Defaults for every outgoing partner request.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Milliseconds. `0` means never time out.
    pub timeout_ms: u64,
    pub throw_http_errors: bool,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            throw_http_errors: true,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

/// Hard ceiling on attempts per call: the first try, plus the one after an OAuth refresh.
pub const MAX_ATTEMPTS: usize = 2;

/// 🔁 How hard a destination tries before giving up on an event.
///
/// 🧊 There is exactly one thing worth retrying (a 401 on an oauth2 destination, fixed by a fresh
/// token) and it only gets fixed once. If the partner still says 401 with a brand new token, a
/// third try is just us knocking louder on a locked door. So `retry_attempts` is clamped to
/// `1..=MAX_ATTEMPTS`: `1` turns the refresh off, anything bigger than 2 behaves like 2.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Total attempts per event, the first one included. See [`RuntimeConfig::attempts`].
    #[serde(alias = "retries")]
    pub retry_attempts: usize,
}

impl RuntimeConfig {
    /// `retry_attempts`, clamped to what a destination will actually do.
    pub fn attempts(&self) -> usize {
        self.retry_attempts.clamp(1, MAX_ATTEMPTS)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { retry_attempts: 2 }
    }
}

impl RequestConfig {
    /// The request defaults this config describes.
    pub fn to_request_options(&self) -> RequestOptions {
        let mut options = RequestOptions::new().throw_http_errors(self.throw_http_errors);
        options = match self.timeout_ms {
            0 => options.no_timeout(),
            ms => options.timeout(Duration::from_millis(ms)),
        };
        if let Some(user_agent) = &self.user_agent {
            options = options.header("user-agent", user_agent.clone());
        }
        for (name, value) in &self.headers {
            options = options.header(name, value.clone());
        }
        options
    }
}

/// 🚀 Loads the config from `DSTX_*` env vars, with an optional TOML file layered on top.
///
/// 💀 Fails with the file name in the context when either source does not parse.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("DSTX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (DSTX_*).",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (DSTX_*).".to_string(),
    };
    config.extract().context(context_msg)
}
