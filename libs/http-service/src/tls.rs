//! HTTPS connector construction.
//!
//! Native root certificates are loaded from the OS store once per process
//! and cached; lookups can be slow on some platforms.

use crate::config::TlsRootConfig;
use crate::error::HttpError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(|| {
        let result = rustls_native_certs::load_native_certs();
        for err in &result.errors {
            tracing::warn!(error = %err, "error loading native root certificate");
        }
        if result.certs.is_empty() {
            tracing::warn!("no native root CA certificates found");
        }
        result.certs
    })
}

/// Installed default provider if any, aws-lc-rs otherwise (never installed globally).
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_roots_client_config() -> Result<rustls::ClientConfig, HttpError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(HttpError::Tls(
            "no native root CA certificates found in OS certificate store".into(),
        ));
    }

    let mut root_store = rustls::RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());
    if added == 0 {
        return Err(HttpError::Tls(
            format!("none of {ignored} native root CA certificates could be parsed").into(),
        ));
    }

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(Box::new(e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// Builds an HTTP/HTTPS connector (ALPN offers h2 and http/1.1).
///
/// # Errors
///
/// Returns `HttpError::Tls` if the roots cannot be loaded.
pub fn https_connector(
    tls_roots: TlsRootConfig,
    connect_timeout: Option<Duration>,
) -> Result<HttpsConnector<HttpConnector>, HttpError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(connect_timeout);

    let connector = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| HttpError::Tls(Box::new(e)))?
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http),
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(native_roots_client_config()?)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http),
    };
    Ok(connector)
}
