//! Certificate Authority - per-host certificates for intercepted tunnels
//!
//! The CA is loaded from PEM files or generated (and saved) on first start.
//! Leaf certificates are issued on demand, kept in an LRU cache with a TTL,
//! and handed to the negotiator through the `CertificateProvider` trait.

use super::error::{MitmError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A certificate chain and key ready for a server-role handshake
pub struct ServerCertificate {
    subject: String,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl ServerCertificate {
    pub fn new(
        subject: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            subject: subject.into(),
            chain,
            key,
        }
    }

    /// Name the certificate was issued for (used in handshake errors)
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
}

impl fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCertificate")
            .field("subject", &self.subject)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Source of server certificates for the client-facing handshake.
///
/// Must tolerate concurrent calls for the same name.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn acquire_server_certificate(&self, name: &str) -> Result<Arc<ServerCertificate>>;
}

/// Cache key for issued certificates
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Regular domain (e.g., example.com)
    Domain(String),

    /// Wildcard domain (e.g., *.example.com)
    Wildcard(String),

    /// IP address (e.g., 192.168.1.1)
    IpAddress(IpAddr),
}

impl HostIdentifier {
    pub fn from_hostname(hostname: &str) -> Self {
        let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Self::IpAddress(ip);
        }

        let hostname = hostname.to_ascii_lowercase();
        if hostname.starts_with("*.") {
            Self::Wildcard(hostname)
        } else {
            Self::Domain(hostname)
        }
    }

    /// The name written into CN and SAN
    pub fn name(&self) -> String {
        match self {
            Self::Domain(name) | Self::Wildcard(name) => name.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// Cached certificate with TTL
#[derive(Clone)]
struct CachedCertificate {
    cert: Arc<ServerCertificate>,
    created_at: Instant,
}

impl CachedCertificate {
    fn new(cert: Arc<ServerCertificate>) -> Self {
        Self {
            cert,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// CA configuration
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Path to CA certificate file
    pub cert_path: PathBuf,

    /// Path to CA private key file
    pub key_path: PathBuf,

    /// Number of issued certificates kept
    pub cache_size: usize,

    /// How long an issued certificate is served from the cache
    pub cert_ttl: Duration,

    /// Validity of issued certificates in days
    pub validity_days: u32,

    pub organization: String,
    pub common_name: String,
    pub country: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("ca.crt"),
            key_path: PathBuf::from("ca.key"),
            cache_size: 1000,
            cert_ttl: Duration::from_secs(86400),
            validity_days: 365,
            organization: "Tunnelscope".to_string(),
            common_name: "Tunnelscope Interception CA".to_string(),
            country: "US".to_string(),
        }
    }
}

/// Issues and caches per-host certificates signed by one CA.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,

    /// Issued certificates (host -> cert)
    cache: Mutex<LruCache<HostIdentifier, CachedCertificate>>,

    config: CaConfig,
}

impl CertificateAuthority {
    /// Load the CA from `config.cert_path`/`config.key_path`, or generate a
    /// new one and save it there when either file is missing.
    pub async fn load_or_generate(config: CaConfig) -> Result<Self> {
        let exists = tokio::fs::try_exists(&config.cert_path).await.unwrap_or(false)
            && tokio::fs::try_exists(&config.key_path).await.unwrap_or(false);

        let ca = if exists {
            info!(cert_path = %config.cert_path.display(), "Loading existing CA from disk");
            Self::load(config).await?
        } else {
            info!(cert_path = %config.cert_path.display(), "Generating new CA certificate");
            let ca = Self::generate(config)?;
            ca.save().await?;
            ca
        };

        info!(
            cache_size = ca.config.cache_size,
            validity_days = ca.config.validity_days,
            "Certificate Authority initialized"
        );
        Ok(ca)
    }

    /// Generate a fresh CA in memory.
    pub fn generate(config: CaConfig) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, &config.organization);
        distinguished_name.push(DnType::CommonName, &config.common_name);
        distinguished_name.push(DnType::CountryName, &config.country);
        params.distinguished_name = distinguished_name;

        let now = Utc::now();
        let (year, month, day) = ymd(now - chrono::Duration::days(1));
        params.not_before = rcgen::date_time_ymd(year, month, day);
        let (year, month, day) = ymd(now + chrono::Duration::days(3650));
        params.not_after = rcgen::date_time_ymd(year, month, day);

        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate()
            .map_err(|e| MitmError::ca_generation(format!("Failed to generate key pair: {}", e)))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_generation(format!("Failed to self-sign certificate: {}", e)))?;

        Ok(Self::from_parts(ca_cert, ca_key, config))
    }

    /// Load the CA certificate and key PEM files named in `config`.
    pub async fn load(config: CaConfig) -> Result<Self> {
        let cert_pem = tokio::fs::read_to_string(&config.cert_path)
            .await
            .map_err(|e| MitmError::ca_load(format!("Failed to read cert file: {}", e)))?;
        let key_pem = tokio::fs::read_to_string(&config.key_path)
            .await
            .map_err(|e| MitmError::ca_load(format!("Failed to read key file: {}", e)))?;

        let ca_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse private key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| MitmError::ca_load(format!("Failed to parse certificate: {}", e)))?;
        // same subject and key as the file, which is all issuing needs
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| MitmError::ca_load(format!("Failed to rebuild certificate: {}", e)))?;

        info!("CA certificate and key loaded");
        Ok(Self::from_parts(ca_cert, ca_key, config))
    }

    fn from_parts(ca_cert: Certificate, ca_key: KeyPair, config: CaConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(LruCache::new(cache_size)),
            config,
        }
    }

    /// Write the CA certificate and key to the configured paths.
    pub async fn save(&self) -> Result<()> {
        tokio::fs::write(&self.config.cert_path, self.ca_cert.pem())
            .await
            .map_err(|e| MitmError::ca_generation(format!("Failed to save certificate: {}", e)))?;
        tokio::fs::write(&self.config.key_path, self.ca_key.serialize_pem())
            .await
            .map_err(|e| MitmError::ca_generation(format!("Failed to save private key: {}", e)))?;

        info!(
            cert_path = %self.config.cert_path.display(),
            key_path = %self.config.key_path.display(),
            "CA certificate and key saved"
        );
        Ok(())
    }

    /// CA certificate PEM (for client installation)
    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn ca_key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }

    /// CA certificate DER, usable as a trust anchor
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Issue a new leaf certificate for `host`, bypassing the cache.
    pub fn issue(&self, host: &HostIdentifier) -> Result<ServerCertificate> {
        let name = host.name();
        let mut params = CertificateParams::new(vec![name.clone()])
            .map_err(|e| MitmError::cert_generation(&name, e.to_string()))?;

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, &self.config.organization);
        distinguished_name.push(DnType::CommonName, &name);
        params.distinguished_name = distinguished_name;

        // a day back for clock skew
        let now = Utc::now();
        let (year, month, day) = ymd(now - chrono::Duration::days(1));
        params.not_before = rcgen::date_time_ymd(year, month, day);
        let (year, month, day) = ymd(now + chrono::Duration::days(self.config.validity_days as i64));
        params.not_after = rcgen::date_time_ymd(year, month, day);
        params.serial_number = Some(generate_serial_number().into());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let key = KeyPair::generate()
            .map_err(|e| MitmError::cert_generation(&name, format!("Failed to generate key: {}", e)))?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(|e| MitmError::cert_generation(&name, format!("Failed to sign certificate: {}", e)))?;

        Ok(ServerCertificate::new(
            name,
            vec![cert.der().clone(), self.ca_cert_der()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        ))
    }

    /// (cached, capacity)
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.lock().await;
        (cache.len(), cache.cap().get())
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

#[async_trait]
impl CertificateProvider for CertificateAuthority {
    async fn acquire_server_certificate(&self, name: &str) -> Result<Arc<ServerCertificate>> {
        let host = HostIdentifier::from_hostname(name);

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&host) {
                if !cached.is_expired(self.config.cert_ttl) {
                    debug!(host = ?host, "Certificate cache hit");
                    return Ok(Arc::clone(&cached.cert));
                }
                debug!(host = ?host, "Cached certificate expired, regenerating");
                cache.pop(&host);
            }
        }

        debug!(host = ?host, "Generating new certificate");
        let cert = Arc::new(self.issue(&host)?);

        let mut cache = self.cache.lock().await;
        // a concurrent call for the same host may have finished first
        if let Some(cached) = cache.get(&host) {
            if !cached.is_expired(self.config.cert_ttl) {
                return Ok(Arc::clone(&cached.cert));
            }
        }
        cache.put(host, CachedCertificate::new(Arc::clone(&cert)));
        Ok(cert)
    }
}

fn ymd(at: DateTime<Utc>) -> (i32, u8, u8) {
    (at.year(), at.month() as u8, at.day() as u8)
}

/// Unique serial number from the RNG plus a timestamp
fn generate_serial_number() -> u64 {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = Utc::now().timestamp() as u32;
    ((timestamp_part as u64) << 32) | (random_part as u64)
}
