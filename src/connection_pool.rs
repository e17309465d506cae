//! Upstream connections and their pool
//!
//! The negotiator asks an `UpstreamConnector` for a connection to the
//! CONNECT target and hands it back with `release` when the tunnel ends.
//! `ConnectionPool` is the default connector: it dials TCP (plus TLS with
//! the requested ALPN list) and keeps released connections per host.
//!
//! ## Architecture
//!
//! - Per-host pools: keyed by host, port, TLS and offered ALPN
//! - Idle management: connections are reused until they expire or close
//! - Automatic cleanup: background task removes stale connections
//! - Prefetch: `PrefetchedConnection` dials while the client handshake runs
//!   and returns an unused result to the pool

use crate::mitm::error::{MitmError, Result};
use crate::mitm::peek::{BoxedIo, BufferedStream};
use crate::mitm::tls_config::{alpn_names, server_name, UpstreamTlsConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Limits for pooled upstream connections
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections kept per pool key
    pub max_idle_per_host: usize,

    /// Idle connections older than this are dropped
    pub idle_timeout: Duration,

    /// Upper bound on a connection's age, idle or not
    pub max_lifetime: Duration,

    /// Dial timeout, TLS handshake included
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            max_lifetime: Duration::from_secs(600), // 10 minutes
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// What the negotiator needs from the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub host: String,
    pub port: u16,
    /// Opened for a CONNECT tunnel
    pub is_connect: bool,
    /// Wrap the TCP stream in TLS
    pub secure: bool,
    /// ALPN ids offered to the upstream when `secure`
    pub application_protocols: Vec<Vec<u8>>,
    /// `false` bypasses the idle pool (probe connections)
    pub allow_reuse: bool,
}

impl UpstreamRequest {
    /// Plain TCP to `host:port` for a tunnel
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            is_connect: true,
            secure: false,
            application_protocols: Vec::new(),
            allow_reuse: true,
        }
    }

    pub fn with_tls(mut self, application_protocols: Vec<Vec<u8>>) -> Self {
        self.secure = true;
        self.application_protocols = application_protocols;
        self
    }

    pub fn without_reuse(mut self) -> Self {
        self.allow_reuse = false;
        self
    }

    /// Connections are only reused for an identical request
    pub fn pool_key(&self) -> String {
        format!(
            "{}:{}|tls={}|alpn={}",
            self.host,
            self.port,
            self.secure,
            alpn_names(&self.application_protocols).join(",")
        )
    }
}

/// A live connection to an upstream server
pub struct UpstreamConnection {
    /// Read-ahead stream; peeked bytes are replayed to the next reader
    pub stream: BufferedStream<BoxedIo>,

    negotiated_alpn: Option<Vec<u8>>,
    pool_key: String,
    reusable: bool,
    secure: bool,

    /// When this connection was created
    created_at: Instant,

    /// When this connection was last used
    last_used: Instant,
}

impl UpstreamConnection {
    pub fn new(request: &UpstreamRequest, stream: BoxedIo, negotiated_alpn: Option<Vec<u8>>) -> Self {
        let now = Instant::now();
        Self {
            stream: BufferedStream::new(stream),
            negotiated_alpn,
            pool_key: request.pool_key(),
            reusable: request.allow_reuse,
            secure: request.secure,
            created_at: now,
            last_used: now,
        }
    }

    /// ALPN id the upstream selected
    pub fn negotiated_alpn(&self) -> Option<&[u8]> {
        self.negotiated_alpn.as_deref()
    }

    /// Whether the stream is wrapped in TLS
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn supports_http2(&self) -> bool {
        self.negotiated_alpn() == Some(b"h2".as_slice())
    }

    pub fn pool_key(&self) -> &str {
        &self.pool_key
    }

    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    pub fn is_idle_timeout(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
    }
}

impl fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("pool_key", &self.pool_key)
            .field("negotiated_alpn", &self.negotiated_alpn.as_deref().map(String::from_utf8_lossy))
            .finish_non_exhaustive()
    }
}

/// Hands out upstream connections and takes them back.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn get_connection(
        &self,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamConnection>;

    /// Return a connection. `force_close` closes it instead of pooling it.
    async fn release(&self, connection: UpstreamConnection, force_close: bool);
}

/// Connection pool statistics
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    /// Requests served from an idle connection
    pub hits: u64,

    /// Requests that had to dial
    pub misses: u64,

    /// Idle connections across all keys
    pub total_connections: usize,

    /// Stale connections dropped by lookups or cleanup
    pub evictions: u64,

    /// Connections handed back to the pool
    pub releases: u64,

    /// Connections closed on release
    pub forced_closes: u64,
}

/// Default `UpstreamConnector`: dials on a miss, pools on release.
pub struct ConnectionPool {
    /// Per-key idle connections
    pools: Arc<Mutex<HashMap<String, VecDeque<UpstreamConnection>>>>,

    config: PoolConfig,

    tls: UpstreamTlsConfig,

    stats: Arc<Mutex<PoolStats>>,
}

impl ConnectionPool {
    pub fn new(tls: UpstreamTlsConfig) -> Self {
        Self::with_config(PoolConfig::default(), tls)
    }

    pub fn with_config(config: PoolConfig, tls: UpstreamTlsConfig) -> Self {
        Self {
            pools: Arc::new(Mutex::new(HashMap::new())),
            config,
            tls,
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take a live idle connection for `key`, discarding stale ones.
    pub async fn get(&self, key: &str) -> Option<UpstreamConnection> {
        let mut pools = self.pools.lock().await;
        let mut stats = self.stats.lock().await;

        let pool = pools.get_mut(key)?;

        while let Some(mut conn) = pool.pop_front() {
            if conn.is_expired(self.config.max_lifetime) {
                debug!(key = %key, "Connection expired, discarding");
                stats.evictions += 1;
                continue;
            }

            if conn.is_idle_timeout(self.config.idle_timeout) {
                debug!(key = %key, "Connection idle timeout, discarding");
                stats.evictions += 1;
                continue;
            }

            conn.mark_used();
            stats.hits += 1;
            debug!(key = %key, "Reusing pooled connection (hit)");
            return Some(conn);
        }

        None
    }

    /// Park a connection for reuse. Dropped if the pool for its key is full.
    pub async fn put(&self, mut conn: UpstreamConnection) {
        let mut pools = self.pools.lock().await;
        let pool = pools.entry(conn.pool_key.clone()).or_default();

        if pool.len() >= self.config.max_idle_per_host {
            debug!(key = %conn.pool_key, "Pool full, dropping connection");
            return;
        }

        conn.mark_used();
        debug!(key = %conn.pool_key, pool_size = pool.len() + 1, "Connection returned to pool");
        pool.push_back(conn);
    }

    /// Dial a new connection for `request`.
    pub async fn connect(
        &self,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamConnection> {
        let dial = async {
            let tcp = TcpStream::connect((request.host.as_str(), request.port))
                .await
                .map_err(|e| MitmError::upstream(&request.host, e.to_string()))?;
            // latency matters more than packet count for relayed frames
            let _ = tcp.set_nodelay(true);

            if !request.secure {
                return Ok::<_, MitmError>(UpstreamConnection::new(request, Box::new(tcp), None));
            }

            let connector =
                TlsConnector::from(self.tls.client_config_with_alpn(&request.application_protocols));
            let tls = connector
                .connect(server_name(&request.host)?, tcp)
                .await
                .map_err(|e| MitmError::upstream(&request.host, format!("TLS handshake: {}", e)))?;
            let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            Ok(UpstreamConnection::new(request, Box::new(tls), alpn))
        };

        let connection = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(MitmError::upstream(&request.host, "cancelled while connecting"))
            }
            dialed = tokio::time::timeout(self.config.connection_timeout, dial) => dialed
                .map_err(|_| MitmError::Timeout(format!(
                    "connecting to {}:{}",
                    request.host, request.port
                )))??,
        };

        debug!(
            host = %request.host,
            port = request.port,
            secure = request.secure,
            alpn = ?connection.negotiated_alpn().map(String::from_utf8_lossy),
            "Upstream connected"
        );
        Ok(connection)
    }

    pub async fn record_miss(&self) {
        let mut stats = self.stats.lock().await;
        stats.misses += 1;
    }

    /// Snapshot of the counters
    pub async fn stats(&self) -> PoolStats {
        let pools = self.pools.lock().await;
        let mut stats = self.stats.lock().await;

        stats.total_connections = pools.values().map(|p| p.len()).sum();

        stats.clone()
    }

    /// Drop stale idle connections under every key.
    pub async fn cleanup(&self) {
        let mut pools = self.pools.lock().await;
        let mut stats = self.stats.lock().await;

        let mut total_removed = 0;

        for (key, pool) in pools.iter_mut() {
            let original_len = pool.len();

            pool.retain(|conn| {
                let valid = !conn.is_expired(self.config.max_lifetime)
                    && !conn.is_idle_timeout(self.config.idle_timeout);
                if !valid {
                    stats.evictions += 1;
                }
                valid
            });

            let removed = original_len - pool.len();
            total_removed += removed;
            if removed > 0 {
                debug!(key = %key, removed, "Cleaned up expired connections");
            }
        }

        pools.retain(|_, pool| !pool.is_empty());

        if total_removed > 0 {
            debug!(total_removed, "Pool cleanup complete");
        }
    }

    pub async fn idle_count(&self, key: &str) -> usize {
        let pools = self.pools.lock().await;
        pools.get(key).map(|p| p.len()).unwrap_or(0)
    }

    pub async fn total_idle(&self) -> usize {
        let pools = self.pools.lock().await;
        pools.values().map(|p| p.len()).sum()
    }

    /// Drop every idle connection.
    pub async fn clear(&self) {
        let mut pools = self.pools.lock().await;
        pools.clear();
        debug!("Connection pool cleared");
    }
}

#[async_trait]
impl UpstreamConnector for ConnectionPool {
    async fn get_connection(
        &self,
        request: &UpstreamRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamConnection> {
        if request.allow_reuse {
            if let Some(conn) = self.get(&request.pool_key()).await {
                return Ok(conn);
            }
        }

        self.record_miss().await;
        self.connect(request, cancel).await
    }

    async fn release(&self, mut connection: UpstreamConnection, force_close: bool) {
        // unread upstream bytes would be replayed to the next user
        let dirty = connection.stream.available() > 0;
        if force_close || !connection.reusable || dirty {
            self.stats.lock().await.forced_closes += 1;
            let _ = connection.stream.shutdown().await;
            debug!(key = %connection.pool_key, dirty, "Upstream connection closed");
            return;
        }

        self.stats.lock().await.releases += 1;
        self.put(connection).await;
    }
}

/// Run `cleanup` once a minute until the returned handle is aborted.
pub fn start_cleanup_task(pool: Arc<ConnectionPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));

        loop {
            interval.tick().await;
            pool.cleanup().await;
        }
    })
}

/// An upstream connection dialled ahead of need.
///
/// Whatever happens to the owner, a connection that finishes dialling is
/// handed back to the connector rather than leaked.
pub struct PrefetchedConnection {
    task: Option<JoinHandle<Result<UpstreamConnection>>>,
    connector: Option<Arc<dyn UpstreamConnector>>,
}

impl PrefetchedConnection {
    /// No prefetch
    pub fn none() -> Self {
        Self {
            task: None,
            connector: None,
        }
    }

    /// Start dialling `request` in the background.
    pub fn spawn(
        connector: Arc<dyn UpstreamConnector>,
        request: UpstreamRequest,
        cancel: CancellationToken,
    ) -> Self {
        let dialer = Arc::clone(&connector);
        let task = tokio::spawn(async move { dialer.get_connection(&request, &cancel).await });
        Self {
            task: Some(task),
            connector: Some(connector),
        }
    }

    pub fn is_some(&self) -> bool {
        self.task.is_some()
    }

    /// Wait for the prefetch. `None` if there was none or it was taken.
    pub async fn take(&mut self) -> Option<Result<UpstreamConnection>> {
        let task = self.task.take()?;
        Some(match task.await {
            Ok(result) => result,
            Err(e) => Err(MitmError::upstream("prefetch", e.to_string())),
        })
    }

    /// Give an unused prefetch back to the connector.
    pub fn discard(mut self) {
        self.release_in_background(false);
    }

    fn release_in_background(&mut self, force_close: bool) {
        let (Some(task), Some(connector)) = (self.task.take(), self.connector.take()) else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Ok(Ok(connection)) = task.await {
                        debug!(key = %connection.pool_key(), force_close, "Unused prefetch returned");
                        connector.release(connection, force_close).await;
                    }
                });
            }
            Err(_) => task.abort(),
        }
    }
}

impl Default for PrefetchedConnection {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for PrefetchedConnection {
    fn drop(&mut self) {
        self.release_in_background(false);
    }
}
