//! Configuration for the storefront request-optimization layer.
//!
//! Every section uses `#[serde(default, deny_unknown_fields)]` so partial YAML
//! files work and typos fail loudly. Durations are humantime strings.
//!
//! [`StorefrontHttpConfig::load`] layers:
//! 1) defaults -> 2) YAML (if provided) -> 3) env (`STOREFRONT__*`)

use crate::error::ApiError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default User-Agent header value
pub const DEFAULT_USER_AGENT: &str = concat!("storefront-http/", env!("CARGO_PKG_VERSION"));

/// Environment variable prefix; nested keys are separated by `__`
/// (`STOREFRONT__RETRY__MAX_RETRIES=5`).
pub const ENV_PREFIX: &str = "STOREFRONT__";

/// Statuses retried by default: request timeout, rate limiting and gateway failures.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport security configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// Require TLS for all connections (HTTPS only)
    #[default]
    TlsOnly,
    /// Allow plain HTTP; meant for local mock backends only
    AllowInsecureHttp,
}

/// HTTP transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Base URL that relative request URLs are joined onto
    pub base_url: Option<String>,

    /// Per-attempt timeout
    #[serde(with = "crate::humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum (decompressed) response body size in bytes
    pub max_body_size: usize,

    pub user_agent: String,

    pub security: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Idle pooled connections are closed after this long; `None` keeps hyper's default
    #[serde(with = "crate::humantime_serde::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Setting this to `0` disables connection reuse entirely
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Response cache housekeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How often the background sweep runs; `0s` disables it
    #[serde(default = "default_sweep_interval", with = "crate::humantime_serde")]
    pub sweep_interval: Duration,

    /// Hard ceiling on entry age, independent of any per-request `max_age`
    #[serde(default = "default_max_entry_age", with = "crate::humantime_serde")]
    pub max_entry_age: Duration,
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_entry_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
            max_entry_age: default_max_entry_age(),
        }
    }
}

/// Retry policy with exponential backoff
///
/// Computes delay as `min(initial_delay * backoff_factor^attempt, max_delay)`
/// with optional jitter. Total attempts = 1 (initial) + `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = no retries)
    pub max_retries: usize,

    #[serde(with = "crate::humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "crate::humantime_serde")]
    pub max_delay: Duration,

    pub backoff_factor: f64,

    /// HTTP statuses worth retrying; timeouts and transport errors always are
    pub retryable_statuses: Vec<u16>,

    /// Add 0-25% random delay to each backoff
    pub jitter: bool,

    /// Honor `Retry-After` on status errors (capped at `max_delay`)
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            jitter: false,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Fast policy for tests and latency-sensitive lookups (1ms initial, 100ms max)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

/// Circuit breaker thresholds, applied per endpoint key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Cooldown after the last failure before a half-open trial is allowed
    #[serde(with = "crate::humantime_serde")]
    pub reset_timeout: Duration,

    /// Concurrent trial calls admitted while half-open (minimum 1)
    pub half_open_requests: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        }
    }
}

/// Micro-batching window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchPolicy {
    /// Flush as soon as this many items are queued (minimum 1)
    pub max_batch_size: usize,

    /// Flush after the queue has been idle this long
    #[serde(with = "crate::humantime_serde")]
    pub max_wait: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait: Duration::from_millis(50),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings consumed by [`crate::telemetry::init_logging`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Text,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorefrontHttpConfig {
    pub transport: TransportConfig,
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: BreakerPolicy,
    pub batch: BatchPolicy,
    pub logging: LoggingConfig,
}

impl StorefrontHttpConfig {
    /// Load layered configuration: defaults, then the YAML file (if given),
    /// then `STOREFRONT__*` environment variables.
    ///
    /// # Errors
    /// Returns `ApiError::Config` if the file does not exist or a layer fails
    /// to parse into the schema.
    pub fn load(path: Option<&Path>) -> Result<Self, ApiError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ApiError::Config(format!(
                    "config file does not exist: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        tracing::debug!(
            base_url = ?config.transport.base_url,
            max_retries = config.retry.max_retries,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "storefront http configuration loaded"
        );
        Ok(config)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StorefrontHttpConfig::default();
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.cache.max_entry_age, Duration::from_secs(86_400));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retryable_statuses, vec![408, 429, 500, 502, 503, 504]);
        assert_eq!(config.circuit_breaker.half_open_requests, 1);
        assert_eq!(config.batch.max_wait, Duration::from_millis(50));
        assert_eq!(config.transport.security, TransportSecurity::TlsOnly);
        assert!(config.transport.user_agent.starts_with("storefront-http/"));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
retry:
  max_retries: 5
  initial_delay: "100ms"
batch:
  max_wait: "20ms"
transport:
  security: allow_insecure_http
  base_url: "http://localhost:8080/graphql"
"#;
        let config: StorefrontHttpConfig = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(100));
        assert_eq!(config.retry.max_delay, Duration::from_secs(10));
        assert_eq!(config.batch.max_wait, Duration::from_millis(20));
        assert_eq!(config.batch.max_batch_size, 10);
        assert_eq!(config.transport.security, TransportSecurity::AllowInsecureHttp);
        assert_eq!(
            config.transport.base_url.as_deref(),
            Some("http://localhost:8080/graphql")
        );
    }

    #[test]
    fn test_reject_unknown_fields() {
        let yaml = r#"
circuit_breaker:
  failure_threshold: 3
  trip_after: "1s"
"#;
        let result: Result<StorefrontHttpConfig, _> = serde_saphyr::from_str(yaml);
        assert!(
            result.is_err(),
            "Config should reject unknown fields due to deny_unknown_fields"
        );
    }

    #[test]
    fn test_load_defaults_without_file() {
        temp_env::with_vars_unset(
            ["STOREFRONT__RETRY__MAX_RETRIES", "STOREFRONT__CACHE__SWEEP_INTERVAL"],
            || {
                let config = StorefrontHttpConfig::load(None).unwrap();
                assert_eq!(config, StorefrontHttpConfig::default());
            },
        );
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.yaml");
        let err = StorefrontHttpConfig::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ApiError::Config(msg) if msg.contains("does not exist")));
    }

    #[test]
    fn test_env_overrides_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "retry:\n  max_retries: 2\ncache:\n  sweep_interval: \"1m\"\ncircuit_breaker:\n  failure_threshold: 7"
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("STOREFRONT__RETRY__MAX_RETRIES", Some("9")),
                ("STOREFRONT__BATCH__MAX_WAIT", Some("75ms")),
            ],
            || {
                let config = StorefrontHttpConfig::load(Some(file.path())).unwrap();
                assert_eq!(config.retry.max_retries, 9);
                assert_eq!(config.batch.max_wait, Duration::from_millis(75));
                assert_eq!(config.cache.sweep_interval, Duration::from_secs(60));
                assert_eq!(config.circuit_breaker.failure_threshold, 7);
            },
        );
    }
}
