use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection_pool::PoolConfig;
use crate::mitm::certificate_authority::{CaConfig, ServerCertificate};
use crate::mitm::tls_config::TlsVersion;

/// Knobs of the tunnel negotiator.
///
/// Embedding applications build this directly; `Config::from_env` is only a
/// convenience for the binary.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Intercept TLS tunnels at all
    pub decrypt_ssl: bool,
    /// Offer h2 to clients when the upstream supports it
    pub enable_http2: bool,
    /// Dial the upstream while the client handshake runs
    pub enable_prefetch: bool,
    pub buffer_size: usize,
    pub client_read_timeout: Duration,
    /// Bound on the HTTP sniff after the client handshake
    pub resniff_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tls_version: TlsVersion,
    /// Present this certificate to every client instead of minting one
    pub generic_certificate: Option<Arc<ServerCertificate>>,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            decrypt_ssl: true,
            enable_http2: true,
            enable_prefetch: true,
            buffer_size: 8192,
            client_read_timeout: Duration::from_secs(60),
            resniff_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(30),
            tls_version: TlsVersion::default(),
            generic_certificate: None,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    pub negotiator: NegotiatorConfig,
    pub ca: CaConfig,
    pub pool: PoolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let host = env::var("PROXY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_var("PROXY_PORT", "8080")?;

        let buffer_size: usize = parse_var("BUFFER_SIZE", "8192")?;
        if buffer_size == 0 {
            return Err(anyhow::anyhow!("BUFFER_SIZE must be greater than zero"));
        }

        let tls_version = if parse_var("TLS13_ONLY", "false")? {
            TlsVersion::Tls13Only
        } else {
            TlsVersion::Tls12And13
        };

        let negotiator = NegotiatorConfig {
            decrypt_ssl: parse_var("DECRYPT_SSL", "true")?,
            enable_http2: parse_var("ENABLE_HTTP2", "true")?,
            enable_prefetch: parse_var("ENABLE_PREFETCH", "true")?,
            buffer_size,
            client_read_timeout: seconds_var("CLIENT_READ_TIMEOUT_SECONDS", "60")?,
            resniff_timeout: seconds_var("RESNIFF_TIMEOUT_SECONDS", "5")?,
            handshake_timeout: seconds_var("HANDSHAKE_TIMEOUT_SECONDS", "30")?,
            tls_version,
            generic_certificate: None,
        };

        let ca = CaConfig {
            cert_path: PathBuf::from(env::var("CA_CERT_PATH").unwrap_or_else(|_| "ca.crt".to_string())),
            key_path: PathBuf::from(env::var("CA_KEY_PATH").unwrap_or_else(|_| "ca.key".to_string())),
            cache_size: parse_var("CERT_CACHE_SIZE", "1000")?,
            cert_ttl: seconds_var("CERT_TTL_SECONDS", "86400")?,
            ..CaConfig::default()
        };
        if ca.cache_size == 0 {
            return Err(anyhow::anyhow!("CERT_CACHE_SIZE must be greater than zero"));
        }

        let pool = PoolConfig {
            max_idle_per_host: parse_var("POOL_MAX_IDLE_PER_HOST", "10")?,
            idle_timeout: seconds_var("POOL_IDLE_TIMEOUT_SECONDS", "90")?,
            max_lifetime: seconds_var("POOL_MAX_LIFETIME_SECONDS", "600")?,
            connection_timeout: seconds_var("UPSTREAM_CONNECT_TIMEOUT_SECONDS", "30")?,
        };

        if !negotiator.decrypt_ssl {
            tracing::info!("TLS decryption disabled, every tunnel is relayed as is");
        }

        Ok(Config {
            host,
            port,
            negotiator,
            ca,
            pool,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {}", name))
}

fn seconds_var(name: &str, default: &str) -> Result<Duration> {
    parse_var(name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Global mutex to serialize config tests (env vars are process-global)
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "PROXY_HOST",
        "PROXY_PORT",
        "DECRYPT_SSL",
        "ENABLE_HTTP2",
        "ENABLE_PREFETCH",
        "CA_CERT_PATH",
        "CA_KEY_PATH",
        "CERT_CACHE_SIZE",
        "CERT_TTL_SECONDS",
        "CLIENT_READ_TIMEOUT_SECONDS",
        "RESNIFF_TIMEOUT_SECONDS",
        "HANDSHAKE_TIMEOUT_SECONDS",
        "POOL_MAX_IDLE_PER_HOST",
        "POOL_IDLE_TIMEOUT_SECONDS",
        "POOL_MAX_LIFETIME_SECONDS",
        "UPSTREAM_CONNECT_TIMEOUT_SECONDS",
        "BUFFER_SIZE",
        "TLS13_ONLY",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_config_defaults() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(config.negotiator.decrypt_ssl);
        assert!(config.negotiator.enable_http2);
        assert_eq!(config.negotiator.resniff_timeout, Duration::from_secs(5));
        assert_eq!(config.negotiator.tls_version, TlsVersion::Tls12And13);
        assert_eq!(config.ca.cert_path, PathBuf::from("ca.crt"));
        assert_eq!(config.ca.cache_size, 1000);
        assert_eq!(config.pool.max_idle_per_host, 10);
        assert_eq!(config.pool.connection_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("PROXY_PORT", "3128");
        env::set_var("DECRYPT_SSL", "false");
        env::set_var("CERT_TTL_SECONDS", "60");
        env::set_var("TLS13_ONLY", "true");

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3128);
        assert!(!config.negotiator.decrypt_ssl);
        assert_eq!(config.ca.cert_ttl, Duration::from_secs(60));
        assert_eq!(config.negotiator.tls_version, TlsVersion::Tls13Only);

        clear_test_env();
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err().to_string();
        assert!(err.contains("PROXY_PORT"), "unexpected error: {}", err);
        env::remove_var("PROXY_PORT");

        env::set_var("BUFFER_SIZE", "0");
        let err = Config::from_env().unwrap_err().to_string();
        assert!(err.contains("BUFFER_SIZE"), "unexpected error: {}", err);

        clear_test_env();
    }
}
