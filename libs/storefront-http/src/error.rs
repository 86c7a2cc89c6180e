use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable error source.
///
/// Coalesced callers all receive the same failure, so sources are reference
/// counted instead of boxed.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Match on the kind, not on the diagnostic `reason` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is relative and no base URL is configured
    MissingScheme,
}

/// Errors surfaced by the request-optimization layer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ApiError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[source] Arc<http::Error>),

    /// Header name or value rejected
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Single request attempt timed out
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] SharedError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] SharedError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// HTTP non-2xx status
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        /// Parsed `Retry-After` header value, if present and valid
        retry_after: Option<Duration>,
    },

    /// JSON encoding or decoding failed
    #[error("JSON parsing failed: {0}")]
    Json(#[source] Arc<serde_json::Error>),

    /// The GraphQL endpoint answered with a non-empty `errors` array
    #[error("GraphQL request failed: {}", .messages.join("; "))]
    GraphQl { messages: Vec<String> },

    /// Endpoint circuit is open; the operation was not invoked
    #[error("Circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    /// Endpoint circuit is half-open and all trial slots are taken
    #[error("Circuit half-open for endpoint '{endpoint}': trial limit reached")]
    HalfOpenSaturated { endpoint: String },

    /// The batch operation failed; every caller in the flush receives this
    #[error("Batch of {size} items failed: {source}")]
    Batch {
        size: usize,
        #[source]
        source: Arc<ApiError>,
    },

    /// The batch operation returned a different number of results than items
    #[error("Batch returned {actual} results for {expected} items")]
    BatchSizeMismatch { expected: usize, actual: usize },

    /// The in-flight call was superseded or cancelled explicitly
    #[error("Request cancelled")]
    Cancelled,

    /// Internal service failure (worker task died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// Invalid URL
    ///
    /// The `reason` field is a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// Caller misuse, e.g. one batch key used with two item types
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or applied
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether a retry may succeed where this attempt failed.
    ///
    /// Status errors are retryable when their code is listed in
    /// `retryable_statuses`; timeouts and transport failures always are.
    #[must_use]
    pub fn is_retryable(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            ApiError::HttpStatus { status, .. } => retryable_statuses.contains(&status.as_u16()),
            ApiError::Timeout(_) | ApiError::Transport(_) => true,
            ApiError::Batch { source, .. } => source.is_retryable(retryable_statuses),
            _ => false,
        }
    }

    /// Server-provided retry hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::HttpStatus { retry_after, .. } => *retry_after,
            ApiError::Batch { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Json(Arc::new(err))
    }
}

impl From<http::Error> for ApiError {
    fn from(err: http::Error) -> Self {
        ApiError::RequestBuild(Arc::new(err))
    }
}

impl From<http::header::InvalidHeaderName> for ApiError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        ApiError::InvalidHeader(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for ApiError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        ApiError::InvalidHeader(err.to_string())
    }
}

impl From<hyper::Error> for ApiError {
    fn from(err: hyper::Error) -> Self {
        ApiError::Transport(Arc::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for ApiError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ApiError::Transport(Arc::new(err))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    const STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

    fn status_error(code: u16) -> ApiError {
        ApiError::HttpStatus {
            status: http::StatusCode::from_u16(code).unwrap(),
            body_preview: String::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_transport_error_preserves_source_across_clones() {
        let err = ApiError::Transport(Arc::new(TestError("connection refused")));
        let cloned = err.clone();

        let source = cloned.source().expect("Transport error should have a source");
        assert_eq!(source.to_string(), "connection refused");
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(status_error(code).is_retryable(STATUSES), "{code}");
        }
        for code in [400, 401, 404, 409, 501] {
            assert!(!status_error(code).is_retryable(STATUSES), "{code}");
        }
    }

    #[test]
    fn test_transport_and_timeout_are_retryable() {
        assert!(ApiError::Timeout(Duration::from_secs(1)).is_retryable(&[]));
        assert!(ApiError::Transport(Arc::new(TestError("reset"))).is_retryable(&[]));
        assert!(!ApiError::Cancelled.is_retryable(STATUSES));
        assert!(
            !ApiError::CircuitOpen {
                endpoint: "api".to_owned()
            }
            .is_retryable(STATUSES)
        );
    }

    #[test]
    fn test_batch_error_delegates_classification() {
        let err = ApiError::Batch {
            size: 3,
            source: Arc::new(ApiError::HttpStatus {
                status: http::StatusCode::SERVICE_UNAVAILABLE,
                body_preview: String::new(),
                retry_after: Some(Duration::from_secs(2)),
            }),
        };
        assert!(err.is_retryable(STATUSES));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.to_string().starts_with("Batch of 3 items failed"));
    }

    #[test]
    fn test_graphql_message_joined() {
        let err = ApiError::GraphQl {
            messages: vec!["first".to_owned(), "second".to_owned()],
        };
        assert_eq!(err.to_string(), "GraphQL request failed: first; second");
    }
}
