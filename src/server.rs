//! Client accept loop

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::mitm::tunnel::TunnelNegotiator;

/// Bind `address` and serve until `shutdown` fires.
pub async fn run(address: &str, negotiator: Arc<TunnelNegotiator>, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, negotiator, shutdown).await
}

/// Accept connections on `listener`, one task per client.
///
/// Every client gets its own child of `shutdown` as its session token, so
/// shutting down cancels every live tunnel.
pub async fn serve(listener: TcpListener, negotiator: Arc<TunnelNegotiator>, shutdown: CancellationToken) -> Result<()> {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        spawn_session(stream, peer_addr, Arc::clone(&negotiator), shutdown.child_token());
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutting down server...");
                break;
            }
        }
    }

    Ok(())
}

fn spawn_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    negotiator: Arc<TunnelNegotiator>,
    session: CancellationToken,
) {
    debug!(peer = %peer_addr, "Accepted connection");
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer_addr, error = %e, "Could not set TCP_NODELAY");
    }

    tokio::spawn(async move {
        match negotiator.handle_client(stream, session).await {
            Ok(()) => debug!(peer = %peer_addr, "Connection closed"),
            // already reported to the exception sink
            Err(e) => debug!(peer = %peer_addr, error = %e, "Connection ended with error"),
        }
    });
}
