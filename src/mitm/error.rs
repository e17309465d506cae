//! MITM error types

use thiserror::Error;

/// Result type for tunnel and relay operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// HTTP/2 error codes (RFC 9113 Section 7)
pub const H2_PROTOCOL_ERROR: u32 = 0x1;
pub const H2_CANCEL: u32 = 0x8;
pub const H2_COMPRESSION_ERROR: u32 = 0x9;

/// Errors raised while negotiating a tunnel or relaying its traffic.
///
/// Classification failures (not a hello, not enough bytes) are never
/// represented here; sniffers return `Ok(None)` for those.
#[derive(Error, Debug)]
pub enum MitmError {
    /// CA certificate generation failed
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// CA certificate loading failed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Certificate generation failed
    #[error("Failed to generate certificate for domain {domain}: {message}")]
    CertGenerationFailed { domain: String, message: String },

    /// Server-role TLS handshake with the client failed
    #[error("Couldn't authenticate host '{host}' with certificate '{subject}': {message}")]
    TlsHandshakeFailed {
        host: String,
        subject: String,
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid CONNECT request
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnectRequest(String),

    /// TLS configuration failed
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Upstream connection failed
    #[error("Upstream connection failed for {host}: {message}")]
    UpstreamConnectionFailed { host: String, message: String },

    /// Peer broke the wire protocol (bad preface, bad SETTINGS length, ...)
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// RST_STREAM on stream 0
    #[error("HTTP/2 connection error. Error code: {code}")]
    Http2ConnectionError { code: u32 },

    /// RST_STREAM on a single stream with a code other than CANCEL
    #[error("HTTP/2 stream error on stream {stream_id}. Error code: {code}")]
    Http2StreamError { stream_id: u32, code: u32 },

    /// Header block could not be decoded
    #[error("Failed to decode HTTP/2 headers on stream {stream_id}: {message}")]
    HpackDecode { stream_id: u32, message: String },

    /// A request/response hook failed or went away
    #[error("Hook failed: {0}")]
    Hook(String),

    /// Body could not be decoded/encoded for its content-encoding
    #[error("Content coding '{encoding}' failed: {message}")]
    ContentCoding { encoding: String, message: String },

    /// Session cancelled by a hook
    #[error("Session was terminated by user")]
    SessionTerminated,

    /// A bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unsupported operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            message: msg.into(),
        }
    }

    /// Create a TLS handshake error carrying the presented certificate subject
    pub fn tls_handshake(
        host: impl Into<String>,
        subject: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TlsHandshakeFailed {
            host: host.into(),
            subject: subject.into(),
            message: msg.into(),
        }
    }

    /// Create an upstream connection error
    pub fn upstream(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::UpstreamConnectionFailed {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn hpack(stream_id: u32, msg: impl Into<String>) -> Self {
        Self::HpackDecode {
            stream_id,
            message: msg.into(),
        }
    }

    pub fn content_coding(encoding: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ContentCoding {
            encoding: encoding.into(),
            message: msg.into(),
        }
    }

    /// Whether the connection to the upstream must be closed instead of pooled
    /// after this error.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Http2StreamError { .. } | Self::HpackDecode { .. } | Self::ContentCoding { .. }
        )
    }
}
