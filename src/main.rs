use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunnelscope::connection_pool::{start_cleanup_task, ConnectionPool};
use tunnelscope::mitm::certificate_authority::CertificateAuthority;
use tunnelscope::mitm::hooks::ProxyHandlers;
use tunnelscope::mitm::tls_config::UpstreamTlsConfig;
use tunnelscope::mitm::tunnel::TunnelNegotiator;
use tunnelscope::{server, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tunnelscope=info")),
        )
        .init();

    info!("Starting {} {}", tunnelscope::NAME, tunnelscope::VERSION);

    let config = Config::from_env()?;
    info!("Configuration loaded");

    let ca = CertificateAuthority::load_or_generate(config.ca.clone())
        .await
        .context("Failed to initialise the interception CA")?;
    info!(cert_path = %config.ca.cert_path.display(), "Interception CA ready");

    let pool = Arc::new(ConnectionPool::with_config(
        config.pool.clone(),
        UpstreamTlsConfig::new_with_options(config.negotiator.tls_version),
    ));
    let _cleanup = start_cleanup_task(Arc::clone(&pool));

    let negotiator = Arc::new(TunnelNegotiator::new(
        config.negotiator.clone(),
        Arc::new(ca),
        pool,
        ProxyHandlers::default(),
    ));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        on_signal.cancel();
    });

    server::run(&config.bind_address(), negotiator, shutdown).await
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
