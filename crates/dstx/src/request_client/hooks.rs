//! 🪝 Request lifecycle hooks.
//!
//! Trait objects so hooks can hold state (a response sink, a token store). Plain closures
//! are wrapped by [`RequestOptions::on_before_request`] and
//! [`RequestOptions::on_after_response`].

use async_trait::async_trait;

use super::options::RequestOptions;
use super::response::{RequestSnapshot, Response};
use crate::errors::RequestError;

#[async_trait]
pub trait BeforeRequest: Send + Sync {
    /// `Some` options get merged into the ones about to be used.
    async fn before_request(
        &self,
        options: &RequestOptions,
    ) -> Result<Option<RequestOptions>, RequestError>;
}

#[async_trait]
pub trait AfterResponse: Send + Sync {
    async fn after_response(
        &self,
        request: &RequestSnapshot,
        options: &RequestOptions,
        response: Response,
    ) -> Result<Response, RequestError>;
}

pub(crate) struct BeforeFn<F>(pub(crate) F);

#[async_trait]
impl<F> BeforeRequest for BeforeFn<F>
where
    F: Fn(&RequestOptions) -> Option<RequestOptions> + Send + Sync,
{
    async fn before_request(
        &self,
        options: &RequestOptions,
    ) -> Result<Option<RequestOptions>, RequestError> {
        Ok((self.0)(options))
    }
}

pub(crate) struct AfterFn<F>(pub(crate) F);

#[async_trait]
impl<F> AfterResponse for AfterFn<F>
where
    F: Fn(&RequestSnapshot, &RequestOptions, Response) -> Response + Send + Sync,
{
    async fn after_response(
        &self,
        request: &RequestSnapshot,
        options: &RequestOptions,
        response: Response,
    ) -> Result<Response, RequestError> {
        Ok((self.0)(request, options, response))
    }
}
