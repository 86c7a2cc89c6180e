use crate::client::{HttpTransport, TransportService};
use crate::config::{TlsRootConfig, TransportConfig, TransportSecurity};
use crate::error::ApiError;
use crate::response::ResponseBody;
use crate::tls;
use bytes::Bytes;
use http::{HeaderValue, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

/// Builder for [`HttpTransport`].
#[derive(Debug, Clone, Default)]
pub struct HttpTransportBuilder {
    config: TransportConfig,
}

impl HttpTransportBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Base URL that relative request URLs are joined onto
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    #[must_use]
    pub fn security(mut self, security: TransportSecurity) -> Self {
        self.config.security = security;
        self
    }

    /// Allow plain HTTP, for local mock backends.
    ///
    /// Only compiled into debug builds unless the `allow-insecure-http`
    /// feature is enabled.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        self.config.security = TransportSecurity::AllowInsecureHttp;
        self
    }

    /// Build the transport.
    ///
    /// Stack (outer to inner): Timeout -> Decompression -> hyper client.
    /// Every status is passed through; the client turns non-2xx into errors.
    ///
    /// # Errors
    /// `ApiError::Tls` if the trust store cannot be loaded,
    /// `ApiError::InvalidHeader` for an unusable user agent.
    pub fn build(self) -> Result<HttpTransport, ApiError> {
        if self.config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let timeout = self.config.request_timeout;
        let user_agent = HeaderValue::from_str(&self.config.user_agent)?;
        let https = build_https_connector(self.config.tls_roots, self.config.security)?;

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_idle_timeout is ignored without a pool timer
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host);
        if let Some(idle) = self.config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle);
        }
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(DecompressionLayer::new())
            .service(hyper_client)
            .map_response(box_response_body)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));
        let service: TransportService = BoxCloneSyncService::new(service);

        Ok(HttpTransport {
            service,
            base_url: self.config.base_url.map(Arc::from),
            user_agent,
            max_body_size: self.config.max_body_size,
            security: self.config.security,
        })
    }
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return ApiError::Timeout(timeout);
    }
    match err.downcast::<ApiError>() {
        Ok(api_err) => *api_err,
        Err(other) => ApiError::Transport(other.into()),
    }
}

fn box_response_body<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// HTTPS connector; h2 and http/1.1 are both advertised via ALPN.
fn build_https_connector(
    tls_roots: TlsRootConfig,
    security: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, ApiError> {
    let builder = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(tls::crypto_provider())
            .map_err(|e| ApiError::Tls(Arc::new(e)))?,
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls::native_roots_client_config()?),
    };
    let connector = if security == TransportSecurity::AllowInsecureHttp {
        builder.https_or_http().enable_all_versions().build()
    } else {
        builder.https_only().enable_all_versions().build()
    };
    Ok(connector)
}
