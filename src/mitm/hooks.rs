//! Extension points of the tunnel negotiator and the frame relay
//!
//! Every hook is an async trait object held in `ProxyHandlers`. The
//! defaults allow everything, change nothing and log errors with `tracing`.

use super::error::{MitmError, Result};
use super::http2_relay::Http2Exchange;
use super::peek::{BoxedIo, BufferedStream};
use super::tunnel::TunnelConnectContext;
use crate::connection_pool::PrefetchedConnection;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Decides whether a CONNECT request may proceed.
#[async_trait]
pub trait AuthorizationHook: Send + Sync {
    /// Return `false` to refuse the tunnel. The hook may set
    /// `context.response_status` and `context.response_headers` (for example
    /// a 407 with `Proxy-Authenticate`); a 403 is sent otherwise.
    async fn check_authorization(&self, context: &mut TunnelConnectContext) -> bool;
}

/// Lets every CONNECT through
pub struct AllowAll;

#[async_trait]
impl AuthorizationHook for AllowAll {
    async fn check_authorization(&self, _context: &mut TunnelConnectContext) -> bool {
        true
    }
}

/// Callbacks around the CONNECT exchange itself.
#[async_trait]
pub trait TunnelHook: Send + Sync {
    /// Runs once the CONNECT request is parsed. May veto decryption
    /// (`context.decrypt_ssl = false`) or refuse the tunnel
    /// (`context.deny_connect = true`).
    async fn before_tunnel_connect_request(&self, _context: &mut TunnelConnectContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the client hello sniff, and before a denial is written
    /// when authorization failed.
    async fn before_tunnel_connect_response(
        &self,
        _context: &mut TunnelConnectContext,
        _is_client_hello: bool,
    ) -> Result<()> {
        Ok(())
    }
}

/// No tunnel callbacks
pub struct NoopTunnelHook;

impl TunnelHook for NoopTunnelHook {}

/// Called when a request's header block is complete.
///
/// The relay holds the request until the hook returns. Calling
/// `exchange.read_body()` makes the relay buffer the body and deliver it.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn before_request(&self, exchange: &mut Http2Exchange) -> Result<()>;
}

/// Called when a response's header block is complete.
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn before_response(&self, exchange: &mut Http2Exchange) -> Result<()>;
}

/// Everything an HTTP/1.x handler needs to take over a decrypted tunnel
pub struct HttpSession {
    pub client: BufferedStream<BoxedIo>,
    /// `None` for requests that did not arrive through CONNECT
    pub context: Option<TunnelConnectContext>,
    /// Upstream connection started while the client handshake ran, if any
    pub prefetch: PrefetchedConnection,
    pub tap: Arc<dyn DataTap>,
    pub cancel: CancellationToken,
}

/// Takes over decrypted HTTP/1.x traffic.
#[async_trait]
pub trait HttpSessionHandler: Send + Sync {
    async fn handle_session(&self, session: HttpSession) -> Result<()>;
}

/// Receives errors that do not surface through a return value.
///
/// Implementations must not block; the relay calls this inline.
pub trait ExceptionSink: Send + Sync {
    fn report(&self, error: &MitmError);
}

/// Logs reported errors
pub struct TracingExceptionSink;

impl ExceptionSink for TracingExceptionSink {
    fn report(&self, error: &MitmError) {
        if error.is_connection_fatal() {
            error!(error = %error, "Tunnel failed");
        } else {
            warn!(error = %error, "Stream error");
        }
    }
}

/// Observes raw bytes as they are relayed.
///
/// "Sent" is client to server, "received" is server to client.
pub trait DataTap: Send + Sync {
    fn on_data_sent(&self, _data: &[u8]) {}

    fn on_data_received(&self, _data: &[u8]) {}
}

pub struct NoopDataTap;

impl DataTap for NoopDataTap {}

/// The set of collaborators shared by every tunnel of a proxy instance
#[derive(Clone)]
pub struct ProxyHandlers {
    pub authorization: Arc<dyn AuthorizationHook>,
    pub tunnel: Arc<dyn TunnelHook>,
    pub request: Option<Arc<dyn RequestHook>>,
    pub response: Option<Arc<dyn ResponseHook>>,
    /// `None` relays decrypted HTTP/1.x untouched (`RawHttpSessionHandler`)
    pub http_session: Option<Arc<dyn HttpSessionHandler>>,
    pub exceptions: Arc<dyn ExceptionSink>,
    pub data_tap: Arc<dyn DataTap>,
}

impl Default for ProxyHandlers {
    fn default() -> Self {
        Self {
            authorization: Arc::new(AllowAll),
            tunnel: Arc::new(NoopTunnelHook),
            request: None,
            response: None,
            http_session: None,
            exceptions: Arc::new(TracingExceptionSink),
            data_tap: Arc::new(NoopDataTap),
        }
    }
}

impl ProxyHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authorization(mut self, hook: Arc<dyn AuthorizationHook>) -> Self {
        self.authorization = hook;
        self
    }

    pub fn with_tunnel_hook(mut self, hook: Arc<dyn TunnelHook>) -> Self {
        self.tunnel = hook;
        self
    }

    pub fn with_request_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.request = Some(hook);
        self
    }

    pub fn with_response_hook(mut self, hook: Arc<dyn ResponseHook>) -> Self {
        self.response = Some(hook);
        self
    }

    pub fn with_http_session_handler(mut self, handler: Arc<dyn HttpSessionHandler>) -> Self {
        self.http_session = Some(handler);
        self
    }

    pub fn with_exception_sink(mut self, sink: Arc<dyn ExceptionSink>) -> Self {
        self.exceptions = sink;
        self
    }

    pub fn with_data_tap(mut self, tap: Arc<dyn DataTap>) -> Self {
        self.data_tap = tap;
        self
    }

    /// Report a hook failure without interrupting the caller.
    pub(crate) fn report(&self, error: &MitmError) {
        self.exceptions.report(error);
    }
}
