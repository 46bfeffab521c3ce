//! 🔐 How a destination authenticates, and how it gets a new token when the old one dies.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::settings::{DestinationSettings, OAuth2ClientCredentials, RefreshAccessTokenResult};
use crate::action::{ExecuteInput, PerformOutput, RequestFn};
use crate::errors::ActionError;
use crate::request_client::RequestClient;
use crate::schema::{Field, FieldMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    Custom,
    #[serde(rename = "oauth2")]
    OAuth2,
}

/// 🔄 Trades the refresh token for a fresh access token.
#[async_trait]
pub trait RefreshAccessToken: Send + Sync {
    async fn refresh(
        &self,
        request: RequestClient,
        settings: DestinationSettings,
        oauth: OAuth2ClientCredentials,
    ) -> Result<RefreshAccessTokenResult, ActionError>;
}

#[async_trait]
impl<F, Fut> RefreshAccessToken for F
where
    F: Fn(RequestClient, DestinationSettings, OAuth2ClientCredentials) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RefreshAccessTokenResult, ActionError>> + Send,
{
    async fn refresh(
        &self,
        request: RequestClient,
        settings: DestinationSettings,
        oauth: OAuth2ClientCredentials,
    ) -> Result<RefreshAccessTokenResult, ActionError> {
        (self)(request, settings, oauth).await
    }
}

/// 🔐 Scheme, the settings fields it needs and the optional hooks.
#[derive(Clone)]
pub struct Authentication {
    pub scheme: AuthScheme,
    /// Destination settings schema. Validated before anything runs.
    pub fields: FieldMap,
    pub test_authentication: Option<Arc<dyn RequestFn>>,
    pub refresh_access_token: Option<Arc<dyn RefreshAccessToken>>,
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("scheme", &self.scheme)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("test_authentication", &self.test_authentication.is_some())
            .field("refresh_access_token", &self.refresh_access_token.is_some())
            .finish()
    }
}

impl Authentication {
    pub fn new(scheme: AuthScheme) -> Self {
        Self {
            scheme,
            fields: FieldMap::new(),
            test_authentication: None,
            refresh_access_token: None,
        }
    }

    pub fn field(mut self, key: impl Into<String>, field: Field) -> Self {
        self.fields.insert(key.into(), field);
        self
    }

    pub fn test_authentication<F, Fut>(mut self, test: F) -> Self
    where
        F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PerformOutput, ActionError>> + Send + 'static,
    {
        self.test_authentication = Some(Arc::new(test));
        self
    }

    pub fn refresh_access_token<F, Fut>(mut self, refresh: F) -> Self
    where
        F: Fn(RequestClient, DestinationSettings, OAuth2ClientCredentials) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<RefreshAccessTokenResult, ActionError>> + Send + 'static,
    {
        self.refresh_access_token = Some(Arc::new(refresh));
        self
    }
}
