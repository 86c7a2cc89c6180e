//! Shared helpers for the storefront-http integration tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use storefront_http::{ApiError, ApiRequest, Transport};

type Responder = Box<dyn Fn(&ApiRequest, usize) -> Result<Value, ApiError> + Send + Sync>;

/// In-memory transport that counts calls and detects aborted calls.
///
/// Call numbers start at 1. A call whose future is dropped before the
/// configured delay elapses counts as aborted.
pub struct MockTransport {
    calls: AtomicUsize,
    aborted: AtomicUsize,
    delay: Duration,
    responder: Responder,
}

impl MockTransport {
    pub fn new<F>(delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest, usize) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            aborted: AtomicUsize::new(0),
            delay,
            responder: Box::new(responder),
        })
    }

    /// Answers `{"url": .., "call": n}`.
    pub fn echo(delay: Duration) -> Arc<Self> {
        Self::new(delay, |request, call| Ok(json!({ "url": request.url, "call": call })))
    }

    /// Fails the first `failures` calls with `err`, then echoes.
    pub fn failing_first(delay: Duration, failures: usize, err: ApiError) -> Arc<Self> {
        Self::new(delay, move |request, call| {
            if call <= failures {
                Err(err.clone())
            } else {
                Ok(json!({ "url": request.url, "call": call }))
            }
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct AbortGuard<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut guard = AbortGuard {
            counter: &self.aborted,
            armed: true,
        };
        tokio::time::sleep(self.delay).await;
        guard.armed = false;
        (self.responder)(request, call)
    }
}

pub fn unavailable() -> ApiError {
    ApiError::HttpStatus {
        status: http::StatusCode::SERVICE_UNAVAILABLE,
        body_preview: "upstream unavailable".to_owned(),
        retry_after: None,
    }
}

pub fn call_number(value: &Value) -> u64 {
    value["call"].as_u64().unwrap()
}
