//! Certificate authority tests
//!
//! CA persistence on disk and certificate caching through the
//! `CertificateProvider` interface.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tunnelscope::mitm::{CaConfig, CertificateAuthority, CertificateProvider, HostIdentifier};

fn config_in(dir: &TempDir) -> CaConfig {
    CaConfig {
        cert_path: dir.path().join("ca.crt"),
        key_path: dir.path().join("ca.key"),
        cache_size: 8,
        ..CaConfig::default()
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_generated_ca_is_saved_and_reloaded() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let first = CertificateAuthority::load_or_generate(config.clone()).await.unwrap();
    assert!(config.cert_path.exists());
    assert!(config.key_path.exists());

    let saved_cert = std::fs::read_to_string(&config.cert_path).unwrap();
    assert!(saved_cert.starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(saved_cert, first.ca_cert_pem());

    let second = CertificateAuthority::load_or_generate(config).await.unwrap();
    assert_eq!(second.ca_key_pem(), first.ca_key_pem());
}

#[tokio::test]
async fn test_load_fails_on_garbage() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    std::fs::write(&config.cert_path, "not a certificate").unwrap();
    std::fs::write(&config.key_path, "not a key").unwrap();

    let err = CertificateAuthority::load(config).await.err().expect("garbage must not load");
    assert!(err.to_string().contains("Failed to load CA certificate"), "{}", err);
}

// ============================================================================
// Issuing and caching
// ============================================================================

#[tokio::test]
async fn test_certificates_are_cached_per_host() {
    let dir = TempDir::new().unwrap();
    let ca = CertificateAuthority::generate(config_in(&dir)).unwrap();

    let first = ca.acquire_server_certificate("*.example.com").await.unwrap();
    let again = ca.acquire_server_certificate("*.EXAMPLE.com").await.unwrap();
    let other = ca.acquire_server_certificate("example.org").await.unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(first.subject(), "*.example.com");
    assert_eq!(ca.cache_stats().await, (2, 8));

    ca.clear_cache().await;
    let fresh = ca.acquire_server_certificate("*.example.com").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
}

#[tokio::test]
async fn test_expired_cache_entries_are_reissued() {
    let dir = TempDir::new().unwrap();
    let config = CaConfig {
        cert_ttl: Duration::from_millis(10),
        ..config_in(&dir)
    };
    let ca = CertificateAuthority::generate(config).unwrap();

    let first = ca.acquire_server_certificate("example.com").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = ca.acquire_server_certificate("example.com").await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_entry() {
    let dir = TempDir::new().unwrap();
    let ca = Arc::new(CertificateAuthority::generate(config_in(&dir)).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ca = Arc::clone(&ca);
        tasks.push(tokio::spawn(async move {
            ca.acquire_server_certificate("concurrent.example.com").await.unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(ca.cache_stats().await.0, 1);
}

#[test]
fn test_ip_certificates_are_chained_to_the_ca() {
    let dir = TempDir::new().unwrap();
    let ca = CertificateAuthority::generate(config_in(&dir)).unwrap();

    let cert = ca.issue(&HostIdentifier::from_hostname("10.1.2.3")).unwrap();
    assert_eq!(cert.subject(), "10.1.2.3");
    assert_eq!(cert.chain().len(), 2);
    assert_eq!(cert.chain()[1], ca.ca_cert_der());
}
