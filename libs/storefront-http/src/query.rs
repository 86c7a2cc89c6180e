//! Consumer handle exposing `{data, error, is_loading, is_validating}` for one
//! request.
//!
//! A small actor task owns the fetch lifecycle. The handle talks to it over
//! an unbounded channel and observes state through a `watch` channel, so UI
//! code can either poll [`Query::state`] or await [`Query::changed`].

use crate::config::RetryPolicy;
use crate::error::ApiError;
use crate::optimizer::ApiOptimizationService;
use crate::request::ApiRequest;
use crate::retry;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Snapshot published after every transition.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    /// Last successfully decoded payload; kept across later failures
    pub data: Option<T>,
    /// Error of the most recent fetch, cleared by the next success
    pub error: Option<ApiError>,
    /// Fetching with no data to show yet
    pub is_loading: bool,
    /// Any fetch in progress, including background refreshes
    pub is_validating: bool,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            is_validating: false,
        }
    }
}

impl<T> QueryState<T> {
    fn begin_fetch(&mut self) {
        self.is_validating = true;
        self.is_loading = self.data.is_none();
    }

    fn end_fetch(&mut self) {
        self.is_loading = false;
        self.is_validating = false;
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Retry policy for each fetch; `None` fails on the first error
    pub retry: Option<RetryPolicy>,
    /// Collapse request changes arriving within this window into one fetch
    pub debounce: Option<Duration>,
    /// When false nothing is fetched until `mutate` or `refresh`
    pub enabled: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            retry: Some(RetryPolicy::default()),
            debounce: None,
            enabled: true,
        }
    }
}

#[derive(Debug)]
enum Command {
    SetRequest(ApiRequest),
    Mutate,
    Refresh,
}

/// Live query bound to an [`ApiOptimizationService`].
///
/// Dropping the handle stops the actor; an in-flight transport call keeps
/// running and still populates the cache.
pub struct Query<T> {
    commands: mpsc::UnboundedSender<Command>,
    publisher: Arc<watch::Sender<QueryState<T>>>,
    state: watch::Receiver<QueryState<T>>,
    enabled: bool,
    task: JoinHandle<()>,
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl<T> Query<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start the query; the first fetch begins immediately when enabled.
    #[must_use]
    pub fn new(service: ApiOptimizationService, request: ApiRequest, options: QueryOptions) -> Self {
        let mut initial = QueryState::default();
        if options.enabled {
            initial.begin_fetch();
        }
        let (publisher, state) = watch::channel(initial);
        let publisher = Arc::new(publisher);
        let (commands, inbox) = mpsc::unbounded_channel();
        let enabled = options.enabled;

        let actor = Actor {
            service,
            request,
            options,
            publisher: Arc::clone(&publisher),
        };
        let task = tokio::spawn(actor.run(inbox));

        Self {
            commands,
            publisher,
            state,
            enabled,
            task,
        }
    }

    /// Switch to a new request, e.g. when a search term changes.
    ///
    /// # Errors
    /// `ApiError::ServiceClosed` if the actor has stopped.
    pub fn set_request(&self, request: ApiRequest) -> Result<(), ApiError> {
        if self.enabled {
            self.publisher.send_modify(QueryState::begin_fetch);
        }
        self.send(Command::SetRequest(request))
    }

    /// Drop the cached entry and refetch, superseding any in-flight call.
    ///
    /// # Errors
    /// `ApiError::ServiceClosed` if the actor has stopped.
    pub fn mutate(&self) -> Result<(), ApiError> {
        self.publisher.send_modify(QueryState::begin_fetch);
        self.send(Command::Mutate)
    }

    /// Refetch without dropping the cached entry.
    ///
    /// # Errors
    /// `ApiError::ServiceClosed` if the actor has stopped.
    pub fn refresh(&self) -> Result<(), ApiError> {
        self.publisher.send_modify(QueryState::begin_fetch);
        self.send(Command::Refresh)
    }

    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.state.clone()
    }

    /// Wait for the next published state.
    ///
    /// # Errors
    /// `ApiError::ServiceClosed` if the state channel closed.
    pub async fn changed(&mut self) -> Result<QueryState<T>, ApiError> {
        self.state
            .changed()
            .await
            .map_err(|_| ApiError::ServiceClosed)?;
        Ok(self.state.borrow_and_update().clone())
    }

    /// Wait until no fetch is pending and return that state.
    ///
    /// # Errors
    /// `ApiError::ServiceClosed` if the state channel closed.
    pub async fn settled(&mut self) -> Result<QueryState<T>, ApiError> {
        let state = self
            .state
            .wait_for(|s| !s.is_loading && !s.is_validating)
            .await
            .map_err(|_| ApiError::ServiceClosed)?;
        Ok(state.clone())
    }

    fn send(&self, command: Command) -> Result<(), ApiError> {
        self.commands
            .send(command)
            .map_err(|_| ApiError::ServiceClosed)
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Actor<T> {
    service: ApiOptimizationService,
    request: ApiRequest,
    options: QueryOptions,
    publisher: Arc<watch::Sender<QueryState<T>>>,
}

type Fetch = BoxFuture<'static, Result<Value, ApiError>>;

impl<T> Actor<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        let mut fetch: Option<Fetch> = self.options.enabled.then(|| self.fetch(false));
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                command = inbox.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::SetRequest(request) => {
                            self.request = request;
                            fetch = None;
                            deadline = None;
                            if !self.options.enabled {
                                continue;
                            }
                            match self.options.debounce {
                                Some(window) => deadline = Some(Instant::now() + window),
                                None => fetch = Some(self.fetch(false)),
                            }
                        }
                        Command::Mutate => {
                            deadline = None;
                            let key = self.request.cache_key();
                            if self.service.remove_cache_entry(&key) {
                                tracing::trace!(%key, "cache entry dropped for mutate");
                            }
                            fetch = Some(self.fetch(true));
                        }
                        Command::Refresh => {
                            deadline = None;
                            fetch = Some(self.fetch(true));
                        }
                    }
                }
                () = wait_until(deadline) => {
                    deadline = None;
                    fetch = Some(self.fetch(false));
                }
                result = poll_fetch(&mut fetch) => {
                    fetch = None;
                    if matches!(result, Err(ApiError::Cancelled))
                        && self.service.is_in_flight(&self.request.cache_key())
                    {
                        tracing::debug!(url = %self.request.url, "fetch superseded, joining replacement");
                        fetch = Some(self.fetch(false));
                        continue;
                    }
                    self.apply(result);
                }
            }
        }
        tracing::trace!(url = %self.request.url, "query stopped");
    }

    /// Build the fetch for the current request. With `supersede` the first
    /// attempt replaces any in-flight call; retries join like normal requests.
    fn fetch(&self, supersede: bool) -> Fetch {
        let service = self.service.clone();
        let request = self.request.clone();
        let policy = self
            .options
            .retry
            .clone()
            .unwrap_or_else(RetryPolicy::disabled);
        self.publisher.send_if_modified(|state| {
            let before = (state.is_loading, state.is_validating);
            state.begin_fetch();
            before != (state.is_loading, state.is_validating)
        });

        async move {
            let mut supersede = supersede;
            retry::execute_with_retry(&policy, || {
                let first = std::mem::take(&mut supersede);
                let service = service.clone();
                let request = request.clone();
                async move {
                    if first {
                        service.refetch_value(&request).await
                    } else {
                        service.request_value(&request).await
                    }
                }
            })
            .await
        }
        .boxed()
    }

    fn apply(&self, result: Result<Value, ApiError>) {
        let outcome = result.and_then(|value| serde_json::from_value::<T>(value).map_err(ApiError::from));
        if let Err(err) = &outcome {
            tracing::debug!(url = %self.request.url, error = %err, "query fetch failed");
        }
        self.publisher.send_modify(|state| {
            match outcome {
                Ok(data) => {
                    state.data = Some(data);
                    state.error = None;
                }
                // cancelled with no replacement; keep what we have
                Err(ApiError::Cancelled) => {}
                Err(err) => state.error = Some(err),
            }
            state.end_fetch();
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}

async fn poll_fetch(fetch: &mut Option<Fetch>) -> Result<Value, ApiError> {
    match fetch.as_mut() {
        Some(fetch) => fetch.await,
        None => pending().await,
    }
}
