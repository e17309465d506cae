//! TLS configuration for both legs of an intercepted tunnel
//!
//! - Client-facing (proxy as server): one `ServerConfig` per issued
//!   certificate and ALPN list
//! - Upstream (proxy as client): webpki roots or a custom root set, with
//!   the ALPN list chosen per connection
//!
//! TLS 1.2 and 1.3 only.

use super::certificate_authority::ServerCertificate;
use super::error::MitmError;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::version::TLS13;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use webpki_roots::TLS_SERVER_ROOTS;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

impl From<TlsConfigError> for MitmError {
    fn from(err: TlsConfigError) -> Self {
        MitmError::TlsConfigFailed(err.to_string())
    }
}

/// TLS version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12And13,
    /// TLS 1.3 only
    Tls13Only,
}

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12And13 => rustls::ALL_VERSIONS,
            TlsVersion::Tls13Only => TLS13_ONLY,
        }
    }
}

/// Build the server-role config presented to the client for one host.
///
/// `alpn` is offered in order; an empty list disables ALPN.
pub fn server_config(
    certificate: &ServerCertificate,
    alpn: &[Vec<u8>],
    tls_version: TlsVersion,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let mut config = ServerConfig::builder_with_protocol_versions(tls_version.protocol_versions())
        .with_no_client_auth()
        .with_single_cert(certificate.chain().to_vec(), certificate.private_key())
        .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;

    config.alpn_protocols = alpn.to_vec();

    debug!(
        subject = %certificate.subject(),
        alpn = ?alpn_names(alpn),
        "Client-facing TLS config created"
    );

    Ok(Arc::new(config))
}

/// Upstream TLS config (proxy acts as client with real verification)
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Verify upstreams against the Mozilla root bundle
    pub fn new() -> Self {
        Self::new_with_options(TlsVersion::default())
    }

    pub fn new_with_options(tls_version: TlsVersion) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(TLS_SERVER_ROOTS.iter().cloned());

        info!(
            tls_version = ?tls_version,
            roots_count = TLS_SERVER_ROOTS.len(),
            "Upstream TLS config created"
        );
        Self::from_root_store(roots, tls_version)
    }

    /// Verify upstreams against `roots` only (private PKI, tests).
    pub fn with_root_certificates(
        roots: Vec<CertificateDer<'static>>,
        tls_version: TlsVersion,
    ) -> Result<Self, TlsConfigError> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store
                .add(root)
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }

        info!(roots_count = store.len(), "Upstream TLS config created with custom roots");
        Ok(Self::from_root_store(store, tls_version))
    }

    fn from_root_store(roots: RootCertStore, tls_version: TlsVersion) -> Self {
        let config = ClientConfig::builder_with_protocol_versions(tls_version.protocol_versions())
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            config: Arc::new(config),
        }
    }

    /// Client config without ALPN
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Client config offering `alpn` to the upstream
    pub fn client_config_with_alpn(&self, alpn: &[Vec<u8>]) -> Arc<ClientConfig> {
        if alpn.is_empty() {
            return self.client_config();
        }
        let mut config = (*self.config).clone();
        config.alpn_protocols = alpn.to_vec();
        Arc::new(config)
    }
}

impl Default for UpstreamTlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a CONNECT host into the name sent as SNI and verified.
///
/// IP literals are accepted.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsConfigError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|e| TlsConfigError::InvalidServerName(format!("{}: {}", host, e)))
}

/// ALPN protocol ids as strings, for logs
pub fn alpn_names(alpn: &[Vec<u8>]) -> Vec<String> {
    alpn.iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_default() {
        assert_eq!(TlsVersion::default(), TlsVersion::Tls12And13);
        assert_eq!(TlsVersion::Tls13Only.protocol_versions().len(), 1);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("192.168.1.1").is_ok());
        assert!(server_name("[::1]").is_ok());
        assert!(server_name("").is_err());
    }

    #[test]
    fn test_upstream_alpn_is_per_connection() {
        let upstream = UpstreamTlsConfig::new();
        assert!(upstream.client_config().alpn_protocols.is_empty());

        let with_h2 = upstream.client_config_with_alpn(&[b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(with_h2.alpn_protocols.len(), 2);
        // the shared config is untouched
        assert!(upstream.client_config().alpn_protocols.is_empty());
    }

    #[test]
    fn test_alpn_names() {
        assert_eq!(
            alpn_names(&[b"h2".to_vec(), b"http/1.1".to_vec()]),
            vec!["h2".to_string(), "http/1.1".to_string()]
        );
    }
}
