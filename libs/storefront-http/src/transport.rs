use crate::config::BreakerPolicy;
use crate::error::ApiError;
use crate::request::ApiRequest;
use crate::resilience::ResilienceService;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// One network call, no caching and no retries.
///
/// Dropping the returned future must abort the underlying request; the
/// optimizer relies on that for supersession.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` and decode the JSON payload.
    ///
    /// # Errors
    /// Transport, status, body and decoding failures.
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        (**self).send(request).await
    }
}

/// Transport decorator that routes every call through a per-endpoint circuit breaker.
///
/// The endpoint key is `METHOD url-without-query`, so a failing product
/// search does not trip the cart endpoint.
pub struct ResilientTransport<T> {
    inner: T,
    resilience: ResilienceService,
    policy: BreakerPolicy,
}

impl<T: Transport> ResilientTransport<T> {
    #[must_use]
    pub fn new(inner: T, resilience: ResilienceService, policy: BreakerPolicy) -> Self {
        Self {
            inner,
            resilience,
            policy,
        }
    }

    #[must_use]
    pub fn endpoint_key(request: &ApiRequest) -> String {
        let path = request
            .url
            .split_once('?')
            .map_or(request.url.as_str(), |(path, _)| path);
        format!("{} {path}", request.method)
    }
}

#[async_trait]
impl<T: Transport> Transport for ResilientTransport<T> {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let endpoint = Self::endpoint_key(request);
        self.resilience
            .execute_with_circuit_breaker(&endpoint, || self.inner.send(request), &self.policy)
            .await
    }
}
