use crate::batch::Batcher;
use crate::breaker::{CircuitBreakers, CircuitState};
use crate::config::{BatchPolicy, BreakerPolicy, RetryPolicy};
use crate::error::ApiError;
use crate::retry;
use std::future::Future;
use std::sync::Arc;

/// Retry, circuit breaking and micro-batching behind one handle.
///
/// Clones share breaker state and batch queues; construct one per
/// application and pass it to whatever needs it.
#[derive(Debug, Clone, Default)]
pub struct ResilienceService {
    breakers: Arc<CircuitBreakers>,
    batcher: Arc<Batcher>,
}

impl ResilienceService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`retry::execute_with_retry`].
    ///
    /// # Errors
    /// The first non-retryable error, or the last error once retries run out.
    #[allow(clippy::unused_self)]
    pub async fn execute_with_retry<T, F, Fut>(&self, op: F, policy: &RetryPolicy) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        retry::execute_with_retry(policy, op).await
    }

    /// Run `op` under the circuit breaker for `endpoint`.
    ///
    /// # Errors
    /// `ApiError::CircuitOpen` / `ApiError::HalfOpenSaturated` when the call
    /// is shed, otherwise the result of `op`.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        endpoint: &str,
        op: F,
        policy: &BreakerPolicy,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.breakers.execute(endpoint, policy, op).await
    }

    /// Queue `item` under `key`; resolves with its positional batch result.
    ///
    /// # Errors
    /// See [`Batcher::execute`].
    pub async fn execute_batch<I, R, F, Fut>(
        &self,
        key: &str,
        item: I,
        op: F,
        policy: &BatchPolicy,
    ) -> Result<R, ApiError>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, ApiError>> + Send + 'static,
    {
        self.batcher.execute(key, item, op, policy).await
    }

    #[must_use]
    pub fn circuit_state(&self, endpoint: &str) -> Option<CircuitState> {
        self.breakers.state(endpoint)
    }

    #[must_use]
    pub fn reset_circuit(&self, endpoint: &str) -> bool {
        self.breakers.reset(endpoint)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::breaker::CircuitStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clones_share_breaker_state() {
        let service = ResilienceService::new();
        let clone = service.clone();
        let policy = BreakerPolicy {
            failure_threshold: 1,
            ..BreakerPolicy::default()
        };

        let result: Result<(), _> = service
            .execute_with_circuit_breaker(
                "POST /graphql",
                || async { Err(ApiError::Timeout(Duration::from_secs(1))) },
                &policy,
            )
            .await;
        assert!(result.is_err());

        assert_eq!(
            clone.circuit_state("POST /graphql").map(|s| s.status),
            Some(CircuitStatus::Open)
        );
        assert!(clone.reset_circuit("POST /graphql"));
        assert!(service.circuit_state("POST /graphql").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_inside_breaker_counts_once() {
        let service = ResilienceService::new();
        let breaker = BreakerPolicy {
            failure_threshold: 2,
            ..BreakerPolicy::default()
        };
        let retry = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::fast()
        };

        let result: Result<(), _> = service
            .execute_with_circuit_breaker(
                "GET /products",
                || {
                    service.execute_with_retry(
                        || async { Err(ApiError::Timeout(Duration::from_secs(1))) },
                        &retry,
                    )
                },
                &breaker,
            )
            .await;

        assert!(matches!(result, Err(ApiError::Timeout(_))));
        let state = service.circuit_state("GET /products").unwrap();
        assert_eq!(state.failures, 1);
        assert_eq!(state.status, CircuitStatus::Closed);
    }
}
