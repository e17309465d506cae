//! Tunnelscope - TLS-intercepting forward proxy core
//!
//! Tunnelscope accepts HTTP `CONNECT` tunnels, sniffs the TLS ClientHello
//! and either relays the tunnel untouched or terminates TLS with a
//! certificate minted for the target host, re-encrypting towards the real
//! server.
//!
//! ## Features
//!
//! - **Hello sniffing**: ClientHello/ServerHello parsing (SSLv2 and TLS
//!   framing, SNI, ALPN, supported versions) without consuming the bytes
//! - **TLS interception**: per-host certificates from an rcgen CA, cached
//!   with LRU and TTL
//! - **HTTP/2 frame relay**: frame-accurate relay with HPACK re-encoding,
//!   header/body hooks and content-encoding aware body rewriting
//! - **Connection pool**: upstream reuse, prefetch during the client
//!   handshake, HTTP/2 capability probe
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnelscope::connection_pool::ConnectionPool;
//! use tunnelscope::mitm::{CaConfig, CertificateAuthority, ProxyHandlers, TunnelNegotiator, UpstreamTlsConfig};
//! use tunnelscope::NegotiatorConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ca = CertificateAuthority::load_or_generate(CaConfig::default()).await?;
//!     let pool = Arc::new(ConnectionPool::new(UpstreamTlsConfig::new()));
//!     let negotiator = Arc::new(TunnelNegotiator::new(
//!         NegotiatorConfig::default(),
//!         Arc::new(ca),
//!         pool,
//!         ProxyHandlers::default(),
//!     ));
//!
//!     tunnelscope::server::run("127.0.0.1:8080", negotiator, CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - `mitm` - sniffing, tunnel negotiation, TLS interception and the
//!   HTTP/2 relay
//! - `connection_pool` - upstream connections
//! - `config` - environment configuration
//! - `server` - accept loop

// Core proxy modules
pub mod config;
pub mod server;

// MITM core
pub mod mitm;

// Connection pooling for performance
pub mod connection_pool;

// Re-export commonly used types

/// Configuration types
pub use config::{Config, NegotiatorConfig};

/// Upstream connections
pub use connection_pool::{
    ConnectionPool, PoolConfig, PrefetchedConnection, UpstreamConnection, UpstreamConnector,
    UpstreamRequest,
};

/// MITM types and functionality
pub use mitm::{
    CertificateAuthority, CertificateProvider, ClientHelloInfo, Http2FrameRelay, MitmError,
    ProxyHandlers, ServerHelloInfo, TunnelConnectContext, TunnelNegotiator, TunnelType,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
