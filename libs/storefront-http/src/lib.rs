#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Request-optimization layer for the storefront backend.
//!
//! This crate sits between UI-facing code and the GraphQL/REST backend and
//! provides:
//! - Response caching with max-age freshness and stale-while-revalidate
//! - Coalescing of identical in-flight requests
//! - Supersession: a newer call for a key cancels the older one
//! - Tag-based invalidation and a periodic sweep of entries older than 24h
//! - Retry with exponential backoff (one retry authority, see [`retry`])
//! - Per-endpoint circuit breakers
//! - Micro-batching of same-key calls
//! - A [`Query`] handle exposing `data / error / is_loading / is_validating`
//!
//! The network side is the [`Transport`] trait; [`HttpTransport`] is the
//! hyper + rustls implementation and [`ResilientTransport`] adds a circuit
//! breaker around any transport.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use storefront_http::{
//!     ApiOptimizationService, ApiRequest, CachePolicy, HttpTransport, Query, QueryOptions,
//!     StorefrontHttpConfig,
//! };
//!
//! let config = StorefrontHttpConfig::load(Some("storefront.yaml".as_ref()))?;
//! let transport = HttpTransport::builder()
//!     .base_url("https://api.candles.example")
//!     .build()?;
//! let service = ApiOptimizationService::new(transport, config.cache);
//!
//! let request = ApiRequest::get("/products?collection=soy")
//!     .cache(CachePolicy::max_age(Duration::from_secs(60)).stale_while_revalidate());
//! let mut products: Query<Vec<Product>> = Query::new(service, request, QueryOptions::default());
//! let state = products.settled().await?;
//! ```

mod batch;
mod breaker;
mod builder;
mod cache;
mod client;
mod config;
mod error;
mod humantime_serde;
mod optimizer;
mod query;
mod request;
mod resilience;
mod response;
pub mod retry;
pub mod telemetry;
mod tls;
mod transport;

pub use batch::Batcher;
pub use breaker::{CircuitBreakers, CircuitState, CircuitStatus};
pub use builder::HttpTransportBuilder;
pub use cache::{CacheEntry, CacheStats, Lookup, ResponseCache};
pub use client::{HttpTransport, TransportService};
pub use config::{
    BatchPolicy, BreakerPolicy, CacheConfig, DEFAULT_RETRYABLE_STATUSES, DEFAULT_USER_AGENT,
    ENV_PREFIX, LogFormat, LoggingConfig, RetryPolicy, StorefrontHttpConfig, TlsRootConfig,
    TransportConfig, TransportSecurity,
};
pub use error::{ApiError, InvalidUriKind, SharedError};
pub use optimizer::ApiOptimizationService;
pub use query::{Query, QueryOptions, QueryState};
pub use request::{ApiRequest, CacheKey, CachePolicy};
pub use resilience::ResilienceService;
pub use response::{ERROR_BODY_PREVIEW_LIMIT, ResponseBody, parse_retry_after};
pub use transport::{ResilientTransport, Transport};
