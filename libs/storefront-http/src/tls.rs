//! TLS setup for [`crate::HttpTransport`].
//!
//! Native root certificates are loaded once per process; OS store lookups can
//! be slow on some platforms.

use crate::error::ApiError;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_roots() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }
    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// Cached native roots (possibly empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(load_native_roots).as_slice()
}

/// The process-wide default provider when one is installed, otherwise a
/// fresh aws-lc-rs provider. Never installs a global default.
#[must_use]
pub fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Client config trusting the OS certificate store.
///
/// # Errors
/// `ApiError::Tls` when the store yields no parsable root, so a broken
/// trust store fails at construction instead of at the first handshake.
pub fn native_roots_client_config() -> Result<rustls::ClientConfig, ApiError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(tls_error(
            "no native root CA certificates found in OS certificate store".to_owned(),
        ));
    }

    let mut roots = rustls::RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(tls_error(format!(
            "no valid native root CA certificates parsed (all {ignored} failed)"
        )));
    }

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ApiError::Tls(Arc::new(e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

fn tls_error(message: String) -> ApiError {
    ApiError::Tls(Arc::new(std::io::Error::other(message)))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_native_roots_are_cached() {
        let first = native_root_certs();
        let second = native_root_certs();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_crypto_provider_has_cipher_suites() {
        let provider = crypto_provider();
        assert!(!provider.cipher_suites.is_empty());
    }

    #[test]
    fn test_native_config_matches_store_contents() {
        let result = native_roots_client_config();
        if native_root_certs().is_empty() {
            assert!(matches!(result, Err(ApiError::Tls(_))));
        } else {
            assert!(result.is_ok(), "OS roots present but config failed: {result:?}");
        }
    }
}
