//! CONNECT tunnel negotiation
//!
//! One `TunnelNegotiator::handle_client` call drives one client connection:
//!
//! 1. Parse the CONNECT request and run the tunnel/authorization hooks
//! 2. Answer `200 Connection Established` and sniff a ClientHello
//! 3. Either re-handshake TLS with a minted certificate (decrypt) or relay
//!    the bytes untouched (passthrough)
//! 4. After decryption, route HTTP/2 to `Http2FrameRelay` and anything else
//!    to the HTTP session handler

use super::certificate_authority::{CertificateProvider, ServerCertificate};
use super::error::{MitmError, Result};
use super::hello::{peek_client_hello, peek_server_hello, ClientHelloInfo, ServerHelloInfo};
use super::hooks::{DataTap, HttpSession, HttpSessionHandler, ProxyHandlers};
use super::http2_parser::CONNECTION_PREFACE;
use super::http2_relay::Http2FrameRelay;
use super::peek::{sniff_method, BoxedIo, BufferedStream, MethodSniff};
use super::tls_config::{self, alpn_names};
use crate::config::NegotiatorConfig;
use crate::connection_pool::{PrefetchedConnection, UpstreamConnector, UpstreamRequest};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::uri::Authority;
use http::StatusCode;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const H2: &[u8] = b"h2";
const HTTP_1_1: &[u8] = b"http/1.1";
const MAX_CONNECT_HEADERS: usize = 64;

/// What ended up flowing through a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelType {
    #[default]
    Unknown,
    /// TLS, decrypted or not
    Https,
    /// Anything that did not start with a ClientHello
    Websocket,
    /// Decrypted HTTP/2
    Http2,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelType::Unknown => "unknown",
            TunnelType::Https => "https",
            TunnelType::Websocket => "websocket",
            TunnelType::Http2 => "http2",
        };
        f.write_str(name)
    }
}

/// Per-tunnel state shared with the hooks.
#[derive(Debug)]
pub struct TunnelConnectContext {
    pub host: String,
    pub port: u16,
    /// Version of the CONNECT request, echoed in our responses
    pub http_version: http::Version,
    pub connect_headers: HeaderMap,
    /// Hooks set this to `false` to keep the tunnel opaque
    pub decrypt_ssl: bool,
    pub deny_connect: bool,
    /// Status written when the tunnel is refused
    pub response_status: Option<StatusCode>,
    /// Extra headers for whatever response we write to the CONNECT
    pub response_headers: HeaderMap,
    pub tunnel_type: TunnelType,
    pub client_hello: Option<ClientHelloInfo>,
    pub server_hello: Option<ServerHelloInfo>,
    /// ALPN agreed with the client in the decrypted handshake
    pub negotiated_alpn: Option<Vec<u8>>,
    cancel: CancellationToken,
}

impl TunnelConnectContext {
    pub fn new(host: impl Into<String>, port: u16, cancel: CancellationToken) -> Self {
        Self {
            host: host.into(),
            port,
            http_version: http::Version::HTTP_11,
            connect_headers: HeaderMap::new(),
            decrypt_ssl: true,
            deny_connect: false,
            response_status: None,
            response_headers: HeaderMap::new(),
            tunnel_type: TunnelType::Unknown,
            client_hello: None,
            server_hello: None,
            negotiated_alpn: None,
            cancel,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// End the session. The negotiator stops at its next checkpoint.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Upstream leg of a tunnel whose bytes are not interpreted
enum Passthrough {
    /// Client bytes go out as they arrived, over plain TCP. With
    /// `replay_hello` the sniffed ClientHello is forwarded first and the
    /// ServerHello is peeked.
    Opaque { replay_hello: bool },
    /// The client's TLS ended here; the upstream leg is TLS as well,
    /// preferably over the prefetched connection.
    Decrypted(PrefetchedConnection),
}

/// Drives client connections through CONNECT, TLS interception and relay.
pub struct TunnelNegotiator {
    config: NegotiatorConfig,
    certs: Arc<dyn CertificateProvider>,
    connector: Arc<dyn UpstreamConnector>,
    handlers: ProxyHandlers,
    http_session: Arc<dyn HttpSessionHandler>,
}

impl TunnelNegotiator {
    pub fn new(
        config: NegotiatorConfig,
        certs: Arc<dyn CertificateProvider>,
        connector: Arc<dyn UpstreamConnector>,
        handlers: ProxyHandlers,
    ) -> Self {
        let http_session = handlers.http_session.clone().unwrap_or_else(|| {
            Arc::new(RawHttpSessionHandler::new(
                Arc::clone(&connector),
                config.buffer_size,
            ))
        });

        Self {
            config,
            certs,
            connector,
            handlers,
            http_session,
        }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    pub fn handlers(&self) -> &ProxyHandlers {
        &self.handlers
    }

    /// Serve one client connection until it closes or `cancel` fires.
    ///
    /// `cancel` is the session token: hooks cancel it through
    /// `TunnelConnectContext::terminate`, and it is cancelled on return.
    pub async fn handle_client<S>(&self, stream: S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let client = BufferedStream::with_capacity(self.config.buffer_size, Box::new(stream) as BoxedIo)
            .with_read_timeout(Some(self.config.client_read_timeout));
        let mut prefetch = PrefetchedConnection::none();

        let result = self.negotiate(client, &mut prefetch, &cancel).await;
        if let Err(e) = &result {
            self.handlers.report(e);
            std::mem::take(&mut prefetch).discard();
        }

        cancel.cancel();
        result
    }

    async fn negotiate(
        &self,
        mut client: BufferedStream<BoxedIo>,
        prefetch: &mut PrefetchedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if sniff_method(&mut client, "CONNECT", cancel).await? != MethodSniff::Matches {
            // plain proxy request, or not HTTP at all
            return self.hand_off(client, None, PrefetchedConnection::none(), cancel).await;
        }

        let Some(mut context) = read_connect_request(&mut client, cancel).await? else {
            return Ok(());
        };
        debug!(target_host = %context.authority(), "CONNECT received");

        if let Err(e) = self.handlers.tunnel.before_tunnel_connect_request(&mut context).await {
            self.handlers.report(&e);
        }

        let decrypt = self.config.decrypt_ssl && context.decrypt_ssl;

        if context.deny_connect {
            let status = context.response_status.unwrap_or(StatusCode::FORBIDDEN);
            info!(target_host = %context.authority(), status = status.as_u16(), "CONNECT denied");
            write_response(&mut client, context.http_version, &context.response_headers, status, None).await?;
            return Ok(());
        }

        if !self.handlers.authorization.check_authorization(&mut context).await {
            if let Err(e) = self
                .handlers
                .tunnel
                .before_tunnel_connect_response(&mut context, false)
                .await
            {
                self.handlers.report(&e);
            }
            let status = context.response_status.unwrap_or(StatusCode::FORBIDDEN);
            info!(target_host = %context.authority(), status = status.as_u16(), "CONNECT unauthorized");
            write_response(&mut client, context.http_version, &context.response_headers, status, None).await?;
            return Ok(());
        }

        write_response(
            &mut client,
            context.http_version,
            &context.response_headers,
            StatusCode::OK,
            Some("Connection Established"),
        )
        .await?;

        let client_hello = peek_client_hello(&mut client, cancel).await?;
        let is_client_hello = client_hello.is_some();
        if let Some(hello) = &client_hello {
            context.tunnel_type = TunnelType::Https;
            trace!(
                target_host = %context.authority(),
                hello = %serde_json::to_string(hello).unwrap_or_default(),
                "ClientHello"
            );
        }
        context.client_hello = client_hello;

        if let Err(e) = self
            .handlers
            .tunnel
            .before_tunnel_connect_response(&mut context, is_client_hello)
            .await
        {
            self.handlers.report(&e);
        }

        if decrypt && is_client_hello {
            let http2_supported = self.probe_http2(&context, cancel).await;

            if self.config.enable_prefetch && resolves(&context.host, context.port).await {
                let request = UpstreamRequest::new(context.host.clone(), context.port).with_tls(Vec::new());
                *prefetch = PrefetchedConnection::spawn(
                    Arc::clone(&self.connector),
                    request,
                    cancel.child_token(),
                );
            }

            client = self
                .accept_tls(client, &mut context, http2_supported, cancel)
                .await?;

            client.set_read_timeout(Some(self.config.resniff_timeout));
            let resniff = sniff_method(&mut client, "CONNECT", cancel).await?;
            client.set_read_timeout(Some(self.config.client_read_timeout));
            if resniff == MethodSniff::NotHttp {
                debug!(target_host = %context.authority(), "No HTTP after handshake, relaying decrypted bytes");
                let upstream = Passthrough::Decrypted(std::mem::take(prefetch));
                return self.passthrough(client, &mut context, upstream, cancel).await;
            }
        }

        if cancel.is_cancelled() {
            return Err(MitmError::SessionTerminated);
        }

        if !decrypt || !is_client_hello {
            if !is_client_hello {
                context.tunnel_type = TunnelType::Websocket;
            }
            let upstream = Passthrough::Opaque {
                replay_hello: is_client_hello,
            };
            return self.passthrough(client, &mut context, upstream, cancel).await;
        }

        if sniff_method(&mut client, "PRI", cancel).await? == MethodSniff::Matches {
            return self.relay_http2(client, &mut context, cancel).await;
        }

        self.hand_off(client, Some(context), std::mem::take(prefetch), cancel)
            .await
    }

    /// Ask the upstream whether it speaks h2. Only worth a connection when
    /// the client offered h2 itself.
    async fn probe_http2(&self, context: &TunnelConnectContext, cancel: &CancellationToken) -> bool {
        let offered = context
            .client_hello
            .as_ref()
            .is_some_and(|hello| hello.offers_protocol("h2"));
        if !offered || !self.config.enable_http2 {
            return false;
        }

        let request = UpstreamRequest::new(context.host.clone(), context.port)
            .with_tls(vec![H2.to_vec()])
            .without_reuse();
        match self.connector.get_connection(&request, cancel).await {
            Ok(connection) => {
                let supported = connection.supports_http2();
                self.connector.release(connection, true).await;
                debug!(target_host = %context.authority(), supported, "Upstream HTTP/2 probe");
                supported
            }
            Err(e) => {
                debug!(target_host = %context.authority(), error = %e, "Upstream HTTP/2 probe failed");
                false
            }
        }
    }

    async fn certificate_for(&self, name: &str) -> Result<Arc<ServerCertificate>> {
        match &self.config.generic_certificate {
            Some(certificate) => Ok(Arc::clone(certificate)),
            None => self.certs.acquire_server_certificate(name).await,
        }
    }

    /// Re-handshake with the client as the target host.
    async fn accept_tls(
        &self,
        client: BufferedStream<BoxedIo>,
        context: &mut TunnelConnectContext,
        http2_supported: bool,
        cancel: &CancellationToken,
    ) -> Result<BufferedStream<BoxedIo>> {
        let cert_name = wildcard_domain_name(&context.host);
        let certificate = self
            .certificate_for(&cert_name)
            .await
            .map_err(|e| MitmError::tls_handshake(&context.host, &cert_name, e.to_string()))?;

        let alpn = server_alpn(
            self.config.enable_http2 && http2_supported,
            context.client_hello.as_ref().and_then(ClientHelloInfo::alpn),
        );
        let server_config = tls_config::server_config(&certificate, &alpn, self.config.tls_version)
            .map_err(|e| MitmError::tls_handshake(&context.host, certificate.subject(), e.to_string()))?;

        let accept = TlsAcceptor::from(server_config).accept(client);
        let tls = tokio::select! {
            _ = cancel.cancelled() => return Err(MitmError::SessionTerminated),
            accepted = tokio::time::timeout(self.config.handshake_timeout, accept) => match accepted {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    return Err(MitmError::tls_handshake(&context.host, certificate.subject(), e.to_string()))
                }
                Err(_) => {
                    return Err(MitmError::tls_handshake(
                        &context.host,
                        certificate.subject(),
                        "handshake timed out",
                    ))
                }
            },
        };

        context.negotiated_alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        debug!(
            target_host = %context.authority(),
            certificate = %certificate.subject(),
            offered = ?alpn_names(&alpn),
            negotiated = ?context.negotiated_alpn.as_deref().map(String::from_utf8_lossy),
            "Client TLS established"
        );

        Ok(BufferedStream::with_capacity(self.config.buffer_size, Box::new(tls) as BoxedIo))
    }

    /// Relay bytes untouched. An opaque tunnel goes out over plain TCP; a
    /// decrypted one is re-encrypted toward the upstream.
    async fn passthrough(
        &self,
        mut client: BufferedStream<BoxedIo>,
        context: &mut TunnelConnectContext,
        upstream: Passthrough,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (mut connection, replay_hello) = match upstream {
            Passthrough::Opaque { replay_hello } => {
                let request = UpstreamRequest::new(context.host.clone(), context.port).without_reuse();
                (self.connector.get_connection(&request, cancel).await?, replay_hello)
            }
            Passthrough::Decrypted(mut prefetch) => {
                let connection = match prefetch.take().await {
                    Some(Ok(connection)) => connection,
                    other => {
                        if let Some(Err(e)) = other {
                            debug!(target_host = %context.authority(), error = %e, "Prefetch failed, dialling again");
                        }
                        let request = UpstreamRequest::new(context.host.clone(), context.port)
                            .with_tls(Vec::new())
                            .without_reuse();
                        self.connector.get_connection(&request, cancel).await?
                    }
                };
                (connection, false)
            }
        };
        let tap = Arc::clone(&self.handlers.data_tap);
        debug!(
            target_host = %context.authority(),
            tunnel = %context.tunnel_type,
            secure = connection.is_secure(),
            "Passthrough tunnel"
        );

        let relayed: Result<()> = async {
            if replay_hello {
                let buffered = client.take_buffered();
                if !buffered.is_empty() {
                    tap.on_data_sent(&buffered);
                    connection.stream.write_all(&buffered).await?;
                    connection.stream.flush().await?;
                }

                let server_hello = tokio::time::timeout(
                    self.config.resniff_timeout,
                    peek_server_hello(&mut connection.stream, cancel),
                )
                .await
                .ok()
                .transpose()?
                .flatten();
                if let Some(hello) = &server_hello {
                    trace!(
                        target_host = %context.authority(),
                        hello = %serde_json::to_string(hello).unwrap_or_default(),
                        "ServerHello"
                    );
                }
                context.server_hello = server_hello;
            }

            raw_relay(
                &mut client,
                &mut connection.stream,
                tap.as_ref(),
                self.config.buffer_size,
                cancel,
            )
            .await
        }
        .await;

        self.connector.release(connection, true).await;
        relayed
    }

    /// Consume the client preface and hand both ends to the frame relay.
    async fn relay_http2(
        &self,
        mut client: BufferedStream<BoxedIo>,
        context: &mut TunnelConnectContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        expect_preface_line(&mut client, "PRI * HTTP/2.0", cancel).await?;
        context.tunnel_type = TunnelType::Http2;
        expect_preface_line(&mut client, "", cancel).await?;
        expect_preface_line(&mut client, "SM", cancel).await?;
        expect_preface_line(&mut client, "", cancel).await?;

        let request = UpstreamRequest::new(context.host.clone(), context.port)
            .with_tls(vec![H2.to_vec()])
            .without_reuse();
        let mut connection = self.connector.get_connection(&request, cancel).await?;
        if !connection.supports_http2() {
            warn!(target_host = %context.authority(), "Upstream did not negotiate h2 for an HTTP/2 tunnel");
        }
        debug!(target_host = %context.authority(), "HTTP/2 tunnel");

        let relayed: Result<()> = async {
            connection.stream.write_all(CONNECTION_PREFACE).await?;
            connection.stream.flush().await?;
            Http2FrameRelay::new(self.handlers.clone())
                .with_connect_host(context.host.clone())
                .run(&mut client, &mut connection.stream, cancel)
                .await
        }
        .await;

        self.connector.release(connection, true).await;
        relayed
    }

    async fn hand_off(
        &self,
        client: BufferedStream<BoxedIo>,
        context: Option<TunnelConnectContext>,
        prefetch: PrefetchedConnection,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session = HttpSession {
            client,
            context,
            prefetch,
            tap: Arc::clone(&self.handlers.data_tap),
            cancel: cancel.clone(),
        };
        self.http_session.handle_session(session).await
    }
}

/// Relays decrypted HTTP/1.x untouched to a TLS upstream.
///
/// Installed when the application brings no `HttpSessionHandler`. Data taps
/// still see the plaintext.
pub struct RawHttpSessionHandler {
    connector: Arc<dyn UpstreamConnector>,
    buffer_size: usize,
}

impl RawHttpSessionHandler {
    pub fn new(connector: Arc<dyn UpstreamConnector>, buffer_size: usize) -> Self {
        Self {
            connector,
            buffer_size,
        }
    }
}

#[async_trait]
impl HttpSessionHandler for RawHttpSessionHandler {
    async fn handle_session(&self, session: HttpSession) -> Result<()> {
        let HttpSession {
            mut client,
            context,
            mut prefetch,
            tap,
            cancel,
        } = session;

        let Some(context) = context else {
            debug!("Plain HTTP proxy request refused");
            write_response(
                &mut client,
                http::Version::HTTP_11,
                &HeaderMap::new(),
                StatusCode::NOT_IMPLEMENTED,
                None,
            )
            .await?;
            return Ok(());
        };

        let request = UpstreamRequest::new(context.host.clone(), context.port).with_tls(Vec::new());
        let mut connection = match prefetch.take().await {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                debug!(target_host = %context.authority(), error = %e, "Prefetch failed, dialling again");
                self.connector.get_connection(&request, &cancel).await?
            }
            None => self.connector.get_connection(&request, &cancel).await?,
        };

        let relayed = raw_relay(
            &mut client,
            &mut connection.stream,
            tap.as_ref(),
            self.buffer_size,
            &cancel,
        )
        .await;

        self.connector.release(connection, true).await;
        relayed
    }
}

/// Certificate name to mint for `host`.
///
/// Subdomains share a wildcard one level up (`a.b.com` -> `*.b.com`); bare
/// domains, IP literals and first labels containing `-` are used as is.
pub fn wildcard_domain_name(host: &str) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        return bare.to_string();
    }

    if host.split('.').count() > 2 {
        if let Some((first, rest)) = host.split_once('.') {
            if first.contains('-') {
                return host.to_string();
            }
            return format!("*.{}", rest);
        }
    }

    host.to_string()
}

/// ALPN the client-facing handshake offers.
fn server_alpn(http2: bool, client_alpn: Option<&[String]>) -> Vec<Vec<u8>> {
    if !http2 {
        return vec![HTTP_1_1.to_vec()];
    }

    match client_alpn {
        Some(protocols) if !protocols.is_empty() => {
            protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
        }
        _ => vec![HTTP_1_1.to_vec()],
    }
}

async fn resolves(host: &str, port: u16) -> bool {
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(e) => {
            debug!(host = %host, error = %e, "Prefetch skipped, host does not resolve");
            false
        }
    }
}

/// Read the CONNECT request head. `None` if the client left first.
async fn read_connect_request(
    client: &mut BufferedStream<BoxedIo>,
    cancel: &CancellationToken,
) -> Result<Option<TunnelConnectContext>> {
    let mut head = String::new();
    loop {
        let Some(line) = client.read_line(cancel).await? else {
            return Ok(None);
        };
        let done = line.is_empty();
        head.push_str(&line);
        head.push_str("\r\n");
        if done {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_CONNECT_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head.as_bytes()) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(MitmError::InvalidConnectRequest("incomplete request head".to_string()))
        }
        Err(e) => return Err(MitmError::InvalidConnectRequest(e.to_string())),
    }

    let target = request
        .path
        .ok_or_else(|| MitmError::InvalidConnectRequest("missing target".to_string()))?;
    let authority: Authority = target
        .parse()
        .map_err(|e| MitmError::InvalidConnectRequest(format!("{}: {}", target, e)))?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(MitmError::InvalidConnectRequest(format!("{}: empty host", target)));
    }

    let mut context = TunnelConnectContext::new(host, authority.port_u16().unwrap_or(443), cancel.clone());
    if request.version == Some(0) {
        context.http_version = http::Version::HTTP_10;
    }
    for header in request.headers.iter() {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(header.value),
        ) else {
            continue;
        };
        context.connect_headers.append(name, value);
    }

    Ok(Some(context))
}

/// Write a body-less response to the CONNECT.
async fn write_response<W: AsyncWrite + Unpin>(
    client: &mut W,
    version: http::Version,
    headers: &HeaderMap,
    status: StatusCode,
    reason: Option<&str>,
) -> Result<()> {
    let version = if version == http::Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };
    let reason = reason.or(status.canonical_reason()).unwrap_or("");

    let mut head = format!("{} {} {}\r\n", version, status.as_u16(), reason);
    for (name, value) in headers.iter() {
        if *name == http::header::CONTENT_LENGTH {
            continue;
        }
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("Content-Length: 0\r\n\r\n");

    client.write_all(head.as_bytes()).await?;
    client.flush().await?;
    Ok(())
}

async fn expect_preface_line(
    client: &mut BufferedStream<BoxedIo>,
    expected: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let line = client.read_line(cancel).await?.unwrap_or_default();
    if line != expected {
        return Err(MitmError::protocol(format!(
            "HTTP/2 connection preface: '{}' expected, '{}' received",
            expected, line
        )));
    }
    Ok(())
}

/// Copy both directions until both ends close, or `cancel` fires.
///
/// End of stream on one side shuts down the write half of the other.
pub async fn raw_relay<C, S>(
    client: &mut C,
    server: &mut S,
    tap: &dyn DataTap,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let upstream = pump(&mut client_read, &mut server_write, buffer_size, |data| {
        tap.on_data_sent(data)
    });
    let downstream = pump(&mut server_read, &mut client_write, buffer_size, |data| {
        tap.on_data_received(data)
    });

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        relayed = async { tokio::try_join!(upstream, downstream) } => {
            let (sent, received) = relayed?;
            debug!(sent, received, "Raw relay finished");
            Ok(())
        }
    }
}

async fn pump<R, W, F>(reader: &mut R, writer: &mut W, buffer_size: usize, on_data: F) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&[u8]),
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(total);
        }

        on_data(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::hooks::NoopDataTap;
    use std::sync::Mutex;
    use tokio::io::duplex;

    #[test]
    fn test_wildcard_domain_name() {
        assert_eq!(wildcard_domain_name("www.example.com"), "*.example.com");
        assert_eq!(wildcard_domain_name("a.b.example.com"), "*.b.example.com");
        assert_eq!(wildcard_domain_name("example.com"), "example.com");
        assert_eq!(wildcard_domain_name("localhost"), "localhost");
        assert_eq!(wildcard_domain_name("my-host.example.com"), "my-host.example.com");
        assert_eq!(wildcard_domain_name("10.0.0.1"), "10.0.0.1");
        assert_eq!(wildcard_domain_name("::1"), "::1");
    }

    #[test]
    fn test_server_alpn() {
        let client = vec!["h2".to_string(), "http/1.1".to_string()];
        assert_eq!(server_alpn(true, Some(&client)), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(server_alpn(false, Some(&client)), vec![b"http/1.1".to_vec()]);
        assert_eq!(server_alpn(true, None), vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_context_authority_and_terminate() {
        let cancel = CancellationToken::new();
        let context = TunnelConnectContext::new("::1", 8443, cancel.clone());
        assert_eq!(context.authority(), "[::1]:8443");
        assert!(!context.is_terminated());

        context.terminate();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_connect_request() {
        let cancel = CancellationToken::new();
        let raw = b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n\x16\x03\x01";
        let mut client = BufferedStream::new(Box::new(scripted_client(raw)) as BoxedIo);

        let context = read_connect_request(&mut client, &cancel).await.unwrap().unwrap();
        assert_eq!(context.host, "example.com");
        assert_eq!(context.port, 8443);
        assert_eq!(
            context.connect_headers.get("proxy-authorization").unwrap(),
            "Basic Zm9vOmJhcg=="
        );
        // the TLS bytes after the head stay buffered
        assert_eq!(client.buffered(), b"\x16\x03\x01");
    }

    #[tokio::test]
    async fn test_read_connect_request_ipv6_default_port() {
        let cancel = CancellationToken::new();
        let raw = b"CONNECT [::1] HTTP/1.0\r\n\r\n";
        let mut client = BufferedStream::new(Box::new(scripted_client(raw)) as BoxedIo);

        let context = read_connect_request(&mut client, &cancel).await.unwrap().unwrap();
        assert_eq!(context.host, "::1");
        assert_eq!(context.port, 443);
        assert_eq!(context.http_version, http::Version::HTTP_10);
    }

    #[tokio::test]
    async fn test_read_connect_request_client_gone() {
        let cancel = CancellationToken::new();
        let mut client = BufferedStream::new(Box::new(scripted_client(b"CONNECT example.com:443 HTTP/1.1\r\n")) as BoxedIo);
        assert!(read_connect_request(&mut client, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_response_adds_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic realm=\"proxy\""));
        headers.insert("content-length", HeaderValue::from_static("12"));

        let mut out = Vec::new();
        write_response(
            &mut out,
            http::Version::HTTP_11,
            &headers,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            None,
        )
        .await
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 407 Proxy Authentication Required\r\nproxy-authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n"
        );
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<u8>>,
        received: Mutex<Vec<u8>>,
    }

    impl DataTap for Recorder {
        fn on_data_sent(&self, data: &[u8]) {
            self.sent.lock().unwrap().extend_from_slice(data);
        }

        fn on_data_received(&self, data: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(data);
        }
    }

    #[tokio::test]
    async fn test_raw_relay_taps_both_directions() {
        let (mut client_end, mut proxy_client) = duplex(1024);
        let (mut proxy_server, mut server_end) = duplex(1024);
        let tap = Recorder::default();
        let cancel = CancellationToken::new();

        let peers = async {
            client_end.write_all(b"ping").await.unwrap();
            client_end.shutdown().await.unwrap();

            let mut got = [0u8; 4];
            server_end.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"ping");
            server_end.write_all(b"pong").await.unwrap();
            server_end.shutdown().await.unwrap();

            let mut back = Vec::new();
            client_end.read_to_end(&mut back).await.unwrap();
            assert_eq!(back, b"pong");
        };

        let relay = raw_relay(&mut proxy_client, &mut proxy_server, &tap, 64, &cancel);
        let (relayed, _) = tokio::join!(relay, peers);
        relayed.unwrap();

        assert_eq!(*tap.sent.lock().unwrap(), b"ping");
        assert_eq!(*tap.received.lock().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_raw_relay_stops_on_cancel() {
        let (_client_end, mut proxy_client) = duplex(64);
        let (mut proxy_server, _server_end) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        raw_relay(&mut proxy_client, &mut proxy_server, &NoopDataTap, 64, &cancel)
            .await
            .unwrap();
    }

    fn scripted_client(bytes: &'static [u8]) -> impl AsyncRead + AsyncWrite + Unpin + Send {
        let (mut near, far) = duplex(4096);
        tokio::spawn(async move {
            near.write_all(bytes).await.unwrap();
            near.shutdown().await.unwrap();
            let mut sink = Vec::new();
            let _ = near.read_to_end(&mut sink).await;
        });
        far
    }
}
