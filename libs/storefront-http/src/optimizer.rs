//! Response caching, request coalescing and supersession.
//!
//! All bookkeeping (cache entries, in-flight calls, generations) sits behind
//! one mutex that is never held across an `.await`. Each transport call runs
//! in its own task under a per-key [`CancellationToken`]; callers await a
//! shared handle to it. Only the call holding the key's current generation
//! may write the cache or clear the in-flight slot.

use crate::cache::{CacheStats, Lookup, ResponseCache};
use crate::config::CacheConfig;
use crate::error::ApiError;
use crate::request::{ApiRequest, CacheKey};
use crate::transport::Transport;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type SharedResponse = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    response: SharedResponse,
}

#[derive(Default)]
struct State {
    cache: ResponseCache,
    in_flight: HashMap<CacheKey, InFlight>,
    next_generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: Mutex<State>,
    shutdown: CancellationToken,
    config: CacheConfig,
}

impl Inner {
    /// Record the outcome of call `generation` for `key`; a superseded call
    /// changes nothing.
    fn settle(&self, key: &CacheKey, generation: u64, request: &ApiRequest, result: &Result<Value, ApiError>) {
        let mut state = self.state.lock();
        let current = state
            .in_flight
            .get(key)
            .is_some_and(|call| call.generation == generation);
        if !current {
            tracing::debug!(%key, generation, "discarding superseded response");
            return;
        }
        state.in_flight.remove(key);

        match result {
            Ok(data) => {
                if let Some(policy) = request.cache_policy() {
                    state
                        .cache
                        .insert(key.clone(), data.clone(), policy, Instant::now());
                }
            }
            Err(ApiError::Cancelled) => {}
            Err(err) => {
                tracing::error!(%key, error = %err, "storefront request failed");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Caching, deduplicating front door to a [`Transport`].
///
/// Cheap to clone; clones share the cache and in-flight map. The service
/// never retries: wrap calls in [`crate::retry::execute_with_retry`] (as
/// [`crate::query::Query`] does) when needed.
#[derive(Clone)]
pub struct ApiOptimizationService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ApiOptimizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ApiOptimizationService")
            .field("cached", &state.cache.len())
            .field("in_flight", &state.in_flight.len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ApiOptimizationService {
    /// Create the service and, when called inside a tokio runtime and
    /// `config.sweep_interval` is non-zero, start the background sweeper.
    #[must_use]
    pub fn new<T: Transport>(transport: T, config: CacheConfig) -> Self {
        let inner = Arc::new(Inner {
            transport: Arc::new(transport),
            state: Mutex::new(State::default()),
            shutdown: CancellationToken::new(),
            config,
        });
        spawn_sweeper(&inner);
        Self { inner }
    }

    #[must_use]
    pub fn with_defaults<T: Transport>(transport: T) -> Self {
        Self::new(transport, CacheConfig::default())
    }

    /// Fetch `request` and decode the payload into `T`.
    ///
    /// # Errors
    /// Whatever the transport returns, `ApiError::Cancelled` when the call
    /// was superseded, `ApiError::Json` when decoding into `T` fails.
    pub async fn request<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let value = self.request_value(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Cache lookup, then join an identical in-flight call, then a new call.
    ///
    /// # Errors
    /// See [`Self::request`].
    pub async fn request_value(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let key = request.cache_key();
        let response = {
            let mut state = self.inner.state.lock();

            if let Some(policy) = request.cache_policy() {
                match state.cache.lookup(&key, policy, Instant::now()) {
                    Lookup::Hit { data, revalidate } => {
                        tracing::debug!(%key, revalidate, "cache hit");
                        if revalidate {
                            self.revalidate(&mut state, key, request);
                        }
                        return Ok(data);
                    }
                    Lookup::Miss => tracing::debug!(%key, "cache miss"),
                }
            }

            if let Some(call) = state.in_flight.get(&key) {
                tracing::debug!(%key, "joining in-flight request");
                call.response.clone()
            } else {
                self.start_call(&mut state, key, request)
            }
        };
        response.await
    }

    /// Skip the cache and supersede any in-flight call for the same key.
    ///
    /// The previous call is cancelled before the replacement is issued; its
    /// callers receive `ApiError::Cancelled` and its result is never cached.
    ///
    /// # Errors
    /// See [`Self::request`].
    pub async fn refetch<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let value = self.refetch_value(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// # Errors
    /// See [`Self::request`].
    pub async fn refetch_value(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let key = request.cache_key();
        let response = {
            let mut state = self.inner.state.lock();
            if let Some(previous) = state.in_flight.remove(&key) {
                tracing::debug!(%key, generation = previous.generation, "superseding in-flight request");
                previous.cancel.cancel();
            }
            self.start_call(&mut state, key, request)
        };
        response.await
    }

    /// Abort the in-flight call for `key`; returns whether there was one.
    #[must_use]
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let Some(call) = self.inner.state.lock().in_flight.remove(key) else {
            return false;
        };
        call.cancel.cancel();
        tracing::debug!(%key, "in-flight request cancelled");
        true
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().in_flight.contains_key(key)
    }

    #[must_use]
    pub fn remove_cache_entry(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().cache.remove(key)
    }

    pub fn clear_cache(&self) {
        self.inner.state.lock().cache.clear();
        tracing::debug!("response cache cleared");
    }

    /// Drop every cached entry labelled `tag`.
    #[must_use]
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let removed = self.inner.state.lock().cache.invalidate_tag(tag);
        tracing::debug!(tag, removed, "cache tag invalidated");
        removed
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.state.lock().cache.stats()
    }

    /// Remove entries older than `max_entry_age`. The background sweeper
    /// calls this on every tick.
    #[must_use]
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.inner)
    }

    /// Stop the sweeper and cancel every in-flight call. Later calls fail
    /// with `ApiError::Cancelled`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn start_call(&self, state: &mut State, key: CacheKey, request: &ApiRequest) -> SharedResponse {
        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = self.inner.shutdown.child_token();

        let transport = Arc::clone(&self.inner.transport);
        let owner = Arc::downgrade(&self.inner);
        let token = cancel.clone();
        let task_key = key.clone();
        let request = request.clone();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(ApiError::Cancelled),
                result = transport.send(&request) => result,
            };
            if let Some(inner) = owner.upgrade() {
                inner.settle(&task_key, generation, &request, &result);
            }
            result
        });

        let response = async move {
            handle.await.unwrap_or_else(|err| {
                tracing::error!(error = %err, "request task failed");
                Err(ApiError::ServiceClosed)
            })
        }
        .boxed()
        .shared();

        tracing::debug!(%key, generation, "request issued");
        state.in_flight.insert(
            key,
            InFlight {
                generation,
                cancel,
                response: response.clone(),
            },
        );
        response
    }

    /// Background refresh after a stale-while-revalidate hit. Joins an
    /// in-flight call for the key rather than superseding it.
    fn revalidate(&self, state: &mut State, key: CacheKey, request: &ApiRequest) {
        let response = match state.in_flight.get(&key) {
            Some(call) => call.response.clone(),
            None => self.start_call(state, key.clone(), request),
        };
        let owner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            match response.await {
                Ok(_) => tracing::debug!(%key, "background revalidation completed"),
                Err(ApiError::Cancelled) => tracing::debug!(%key, "background revalidation cancelled"),
                Err(err) => tracing::warn!(%key, error = %err, "background revalidation failed; keeping cached entry"),
            }
            if let Some(inner) = owner.upgrade() {
                inner.state.lock().cache.end_revalidation(&key);
            }
        });
    }
}

fn sweep(inner: &Inner) -> usize {
    let removed = inner
        .state
        .lock()
        .cache
        .sweep(inner.config.max_entry_age, Instant::now());
    if removed > 0 {
        tracing::debug!(removed, "expired cache entries swept");
    }
    removed
}

fn spawn_sweeper(inner: &Arc<Inner>) {
    let period = inner.config.sweep_interval;
    if period.is_zero() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("no tokio runtime; cache sweeper not started");
        return;
    };

    let owner: Weak<Inner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = owner.upgrade() else { break };
                    sweep(&inner);
                }
            }
        }
        tracing::debug!("cache sweeper stopped");
    });
}
