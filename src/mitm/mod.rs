//! TLS interception core
//!
//! - Sniffing: `peek` (replayable read-ahead) and `hello` (ClientHello /
//!   ServerHello parsing, with `extensions`)
//! - Negotiation: `tunnel` drives CONNECT, certificate minting
//!   (`certificate_authority`, `tls_config`) and the choice between
//!   passthrough, HTTP/2 relay and HTTP/1.x hand-off
//! - HTTP/2: `http2_parser`, `hpack_codec`, `http2_message`,
//!   `stream_session` and the frame-level `http2_relay`
//! - Extension points live in `hooks`

pub mod certificate_authority;
pub mod error;
pub mod extensions;
pub mod hello;
pub mod hooks;
pub mod hpack_codec;
pub mod http2_message;
pub mod http2_parser;
pub mod http2_relay;
pub mod peek;
pub mod stream_session;
pub mod tls_config;
pub mod tunnel;

// Re-export main types
pub use certificate_authority::{
    CaConfig, CertificateAuthority, CertificateProvider, HostIdentifier, ServerCertificate,
};
pub use error::{MitmError, Result};
pub use extensions::{ExtensionValue, Extensions, SslExtension};
pub use hello::{peek_client_hello, peek_server_hello, ClientHelloInfo, ServerHelloInfo};
pub use hooks::{
    AuthorizationHook, DataTap, ExceptionSink, HttpSession, HttpSessionHandler, ProxyHandlers,
    RequestHook, ResponseHook, TunnelHook,
};
pub use http2_message::{HeaderList, Http2Message, Http2Request, Http2Response, StreamPriority};
pub use http2_parser::{FrameHeader, FrameType, Http2Settings};
pub use http2_relay::{Http2Exchange, Http2FrameRelay};
pub use peek::{sniff_method, BufferedStream, MethodSniff, PeekBuffer};
pub use stream_session::{Direction, StreamSession, StreamSessionTable};
pub use tls_config::{TlsConfigError, TlsVersion, UpstreamTlsConfig};
pub use tunnel::{RawHttpSessionHandler, TunnelConnectContext, TunnelNegotiator, TunnelType};
