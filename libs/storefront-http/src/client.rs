use crate::builder::HttpTransportBuilder;
use crate::config::TransportSecurity;
use crate::error::{ApiError, InvalidUriKind};
use crate::request::ApiRequest;
use crate::response::{ResponseBody, json_payload};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use http::{Request, Response, Uri};
use http_body_util::Full;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

/// Type-erased tower stack produced by [`HttpTransportBuilder::build`].
pub type TransportService =
    BoxCloneSyncService<Request<Full<Bytes>>, Response<ResponseBody>, ApiError>;

const APPLICATION_JSON: &str = "application/json";

/// JSON-over-HTTP transport backed by hyper, rustls and tower.
///
/// Cheap to clone; clones share the connection pool.
///
/// ```ignore
/// let transport = HttpTransport::builder()
///     .base_url("https://api.candles.example/graphql")
///     .build()?;
/// let value = transport.send(&ApiRequest::graphql("", QUERY, vars)).await?;
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    pub(crate) service: TransportService,
    pub(crate) base_url: Option<Arc<str>>,
    pub(crate) user_agent: HeaderValue,
    pub(crate) max_body_size: usize,
    pub(crate) security: TransportSecurity,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("max_body_size", &self.max_body_size)
            .field("security", &self.security)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Transport with default configuration (TLS only, webpki roots).
    ///
    /// # Errors
    /// See [`HttpTransportBuilder::build`].
    pub fn new() -> Result<Self, ApiError> {
        HttpTransportBuilder::new().build()
    }

    #[must_use]
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    /// Resolve `url` against the base URL and validate it for the
    /// configured transport security.
    ///
    /// # Errors
    /// `ApiError::InvalidUri` for malformed or host-less URLs and relative
    /// URLs without a base, `ApiError::InvalidScheme` for plain HTTP under
    /// `TlsOnly` or a non-HTTP scheme.
    pub fn resolve_url(&self, url: &str) -> Result<Uri, ApiError> {
        let absolute = if url.contains("://") {
            url.to_owned()
        } else if let Some(base) = &self.base_url {
            if url.is_empty() {
                base.to_string()
            } else {
                format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    url.trim_start_matches('/')
                )
            }
        } else {
            return Err(ApiError::InvalidUri {
                url: url.to_owned(),
                kind: InvalidUriKind::MissingScheme,
                reason: "relative URL and no base URL configured".to_owned(),
            });
        };

        let uri: Uri = absolute.parse().map_err(|e: http::uri::InvalidUri| ApiError::InvalidUri {
            url: absolute.clone(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

        if uri.authority().is_none() {
            return Err(ApiError::InvalidUri {
                url: absolute,
                kind: InvalidUriKind::MissingAuthority,
                reason: "URL has no host".to_owned(),
            });
        }

        match (uri.scheme_str(), self.security) {
            (Some("https"), _) | (Some("http"), TransportSecurity::AllowInsecureHttp) => Ok(uri),
            (Some("http"), TransportSecurity::TlsOnly) => Err(ApiError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "transport requires TLS".to_owned(),
            }),
            (scheme, _) => Err(ApiError::InvalidScheme {
                scheme: scheme.unwrap_or_default().to_owned(),
                reason: "only http and https are supported".to_owned(),
            }),
        }
    }

    fn build_request(&self, request: &ApiRequest) -> Result<Request<Full<Bytes>>, ApiError> {
        let uri = self.resolve_url(&request.url)?;

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .header(ACCEPT, HeaderValue::from_static(APPLICATION_JSON))
            .header(USER_AGENT, self.user_agent.clone());

        let body = match &request.body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
                Bytes::from(serde_json::to_vec(value)?)
            }
            None => Bytes::new(),
        };

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let value = HeaderValue::from_str(value)?;
            builder = builder.header(name, value);
        }

        Ok(builder.body(Full::new(body))?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let http_request = self.build_request(request)?;
        let response = self.service.clone().oneshot(http_request).await?;
        tracing::trace!(
            method = %request.method,
            url = %request.url,
            status = response.status().as_u16(),
            "storefront response received"
        );
        json_payload(response, self.max_body_size).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn transport(base: Option<&str>, security: TransportSecurity) -> HttpTransport {
        let mut builder = HttpTransport::builder().security(security);
        if let Some(base) = base {
            builder = builder.base_url(base);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_relative_against_base() {
        let t = transport(Some("https://api.candles.example/v1/"), TransportSecurity::TlsOnly);
        let uri = t.resolve_url("/products?page=2").unwrap();
        assert_eq!(uri.to_string(), "https://api.candles.example/v1/products?page=2");

        let root = t.resolve_url("").unwrap();
        assert_eq!(root.to_string(), "https://api.candles.example/v1/");
    }

    #[tokio::test]
    async fn test_resolve_relative_without_base() {
        let t = transport(None, TransportSecurity::TlsOnly);
        match t.resolve_url("/products") {
            Err(ApiError::InvalidUri { kind, .. }) => assert_eq!(kind, InvalidUriKind::MissingScheme),
            other => panic!("expected InvalidUri, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_rejected_with_tls_only() {
        let t = transport(None, TransportSecurity::TlsOnly);
        assert!(matches!(
            t.resolve_url("http://localhost:8080/graphql"),
            Err(ApiError::InvalidScheme { .. })
        ));

        let insecure = transport(None, TransportSecurity::AllowInsecureHttp);
        assert!(insecure.resolve_url("http://localhost:8080/graphql").is_ok());
    }

    #[tokio::test]
    async fn test_build_request_headers_and_body() {
        let t = transport(Some("https://api.candles.example"), TransportSecurity::TlsOnly);
        let request = ApiRequest::post("/cart", serde_json::json!({"sku": "SOY-8OZ"}))
            .header("x-cart-id", "c-1");
        let built = t.build_request(&request).unwrap();
        assert_eq!(built.method(), http::Method::POST);
        assert_eq!(built.headers()[CONTENT_TYPE], "application/json");
        assert_eq!(built.headers()[ACCEPT], "application/json");
        assert_eq!(built.headers()["x-cart-id"], "c-1");
        assert!(built.headers().contains_key(USER_AGENT));
    }

    #[tokio::test]
    async fn test_build_request_rejects_bad_header() {
        let t = transport(Some("https://api.candles.example"), TransportSecurity::TlsOnly);
        let request = ApiRequest::get("/cart").header("bad header", "v");
        assert!(matches!(
            t.build_request(&request),
            Err(ApiError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpTransport>();
    }
}
