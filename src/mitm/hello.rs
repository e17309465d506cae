//! SSLv2 / SSLv3 / TLS hello sniffing
//!
//! Parses a `ClientHello` or `ServerHello` out of the read-ahead window of a
//! `BufferedStream` without consuming it. Anything that does not look like a
//! complete hello yields `Ok(None)`; only socket errors are errors.
//!
//! Record layouts:
//!
//! ```text
//! SSLv2:  [0x80|len_hi][len_lo][type][major][minor][cipher_len:2][sid_len:2][rand_len:2]
//!         [ciphers (3 bytes each)][session id][random]
//! TLS:    [0x16][major][minor][record_len:2][type][hs_len:3][major][minor][random:32]
//!         [sid_len:1][sid][cipher_len:2][ciphers]|[cipher:2] [comp_len:1][comp]|[comp:1]
//!         [ext_len:2][(id:2 len:2 data)*]
//! ```

use super::extensions::{decode_extension, hex, ExtensionValue, Extensions, SUPPORTED_VERSIONS};
use super::peek::{BufferedStream, PeekBuffer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// TLS record content type for handshake messages
pub const HANDSHAKE_RECORD: u8 = 0x16;

const SSL2_CLIENT_HELLO: u8 = 0x01;
const SSL2_SERVER_HELLO: u8 = 0x04;
const CLIENT_HELLO: u8 = 0x01;
const SERVER_HELLO: u8 = 0x02;

/// A sniffed ClientHello
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHelloInfo {
    /// 2 for SSLv2 framing, 3 for SSLv3/TLS record framing
    pub handshake_version: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    /// 24-bit ids for SSLv2, 16-bit ids otherwise
    pub ciphers: Vec<u32>,
    pub compression_data: Vec<u8>,
    pub extensions: Option<Extensions>,
    /// Bytes covered by the sniff, counted from the first byte of the record
    pub hello_length: usize,
    pub extensions_start: usize,
}

/// A sniffed ServerHello
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHelloInfo {
    pub handshake_version: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Option<Extensions>,
    pub hello_length: usize,
    pub extensions_start: usize,
}

impl ClientHelloInfo {
    /// e.g. "3.3 (TLS/1.2)"
    pub fn version_name(&self) -> String {
        version_name(self.major_version, self.minor_version)
    }

    /// Gmt unix time carried in the first four bytes of a v3 random
    pub fn random_time(&self) -> Option<DateTime<Utc>> {
        random_time(self.handshake_version, &self.random)
    }

    /// First host name of the SNI extension
    pub fn sni(&self) -> Option<&str> {
        self.extensions
            .as_ref()?
            .server_names()?
            .first()
            .map(String::as_str)
    }

    /// Protocols offered in the ALPN extension
    pub fn alpn(&self) -> Option<&[String]> {
        self.extensions.as_ref()?.alpn_protocols()
    }

    pub fn offers_protocol(&self, protocol: &str) -> bool {
        self.alpn()
            .map(|protocols| protocols.iter().any(|p| p == protocol))
            .unwrap_or(false)
    }

    pub fn compression_names(&self) -> Vec<String> {
        self.compression_data
            .iter()
            .map(|method| compression_name(*method))
            .collect()
    }
}

impl ServerHelloInfo {
    pub fn version_name(&self) -> String {
        version_name(self.major_version, self.minor_version)
    }

    /// Version actually selected, honouring supported_versions (TLS 1.3)
    pub fn selected_version(&self) -> (u8, u8) {
        let selected = self
            .extensions
            .as_ref()
            .and_then(|e| e.get(SUPPORTED_VERSIONS))
            .and_then(|e| match &e.value {
                ExtensionValue::Versions(v) => v.first().copied(),
                _ => None,
            });
        match selected {
            Some(v) => ((v >> 8) as u8, v as u8),
            None => (self.major_version, self.minor_version),
        }
    }

    pub fn random_time(&self) -> Option<DateTime<Utc>> {
        random_time(self.handshake_version, &self.random)
    }

    pub fn compression_name(&self) -> String {
        compression_name(self.compression_method)
    }
}

fn version_name(major: u8, minor: u8) -> String {
    let tls = match (major, minor) {
        (3, 1) => " (TLS/1.0)",
        (3, 2) => " (TLS/1.1)",
        (3, 3) => " (TLS/1.2)",
        (3, 4) => " (TLS/1.3)",
        _ => "",
    };
    format!("{}.{}{}", major, minor, tls)
}

fn random_time(handshake_version: u8, random: &[u8]) -> Option<DateTime<Utc>> {
    if handshake_version != 3 {
        return None;
    }
    let secs = u32::from_be_bytes(random.get(..4)?.try_into().ok()?);
    DateTime::from_timestamp(secs as i64, 0)
}

fn compression_name(method: u8) -> String {
    match method {
        0 => "null".to_string(),
        1 => "DEFLATE".to_string(),
        other => format!("#{}", other),
    }
}

fn write_extensions(f: &mut fmt::Formatter<'_>, extensions: &Option<Extensions>) -> fmt::Result {
    if let Some(extensions) = extensions {
        writeln!(f, "Extensions:")?;
        for ext in extensions.iter() {
            writeln!(f, "{}: {}", ext.name, ext.summary)?;
        }
    }
    Ok(())
}

impl fmt::Display for ClientHelloInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "A SSLv{} client hello message with length {}",
            self.version_name(),
            self.hello_length
        )?;
        writeln!(f, "Random: {}", hex(&self.random))?;
        if let Some(time) = self.random_time() {
            writeln!(f, "\"Time\": {}", time)?;
        }
        writeln!(f, "SessionID: {}", hex(&self.session_id))?;
        write_extensions(f, &self.extensions)?;
        writeln!(f, "Compression: {}", self.compression_names().join(", "))?;
        let ciphers: Vec<String> = self.ciphers.iter().map(|c| format!("{:#06x}", c)).collect();
        writeln!(f, "Cipher suites: {}", ciphers.join(", "))
    }
}

impl fmt::Display for ServerHelloInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "A SSLv{} server hello message with length {}",
            self.version_name(),
            self.hello_length
        )?;
        writeln!(f, "Random: {}", hex(&self.random))?;
        if let Some(time) = self.random_time() {
            writeln!(f, "\"Time\": {}", time)?;
        }
        writeln!(f, "SessionID: {}", hex(&self.session_id))?;
        write_extensions(f, &self.extensions)?;
        writeln!(f, "Compression: {}", self.compression_name())?;
        writeln!(f, "Cipher: {:#06x}", self.cipher_suite)
    }
}

/// Why a sniff stopped short
enum Stop {
    Unrecognized,
    Io(io::Error),
}

impl From<io::Error> for Stop {
    fn from(e: io::Error) -> Self {
        Stop::Io(e)
    }
}

type Sniff<T> = std::result::Result<T, Stop>;

fn finish<T>(result: Sniff<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(Stop::Unrecognized) => Ok(None),
        Err(Stop::Io(e)) => Err(e),
    }
}

async fn need<S: AsyncRead + Unpin>(buf: &mut PeekBuffer<'_, S>, count: usize) -> Sniff<()> {
    if buf.ensure_available(count).await? {
        Ok(())
    } else {
        Err(Stop::Unrecognized)
    }
}

fn got<T>(value: Option<T>) -> Sniff<T> {
    value.ok_or(Stop::Unrecognized)
}

async fn first_byte<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> Sniff<u8> {
    got(stream.peek_byte(0, cancel).await?)
}

/// Sniff a ClientHello from the client side of a tunnel.
pub async fn peek_client_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> io::Result<Option<ClientHelloInfo>> {
    finish(read_client_hello(stream, cancel).await)
}

/// Sniff a ServerHello from the upstream side of a tunnel.
pub async fn peek_server_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> io::Result<Option<ServerHelloInfo>> {
    finish(read_server_hello(stream, cancel).await)
}

/// Whether the stream starts with a ClientHello.
pub async fn is_client_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> io::Result<bool> {
    Ok(peek_client_hello(stream, cancel).await?.is_some())
}

async fn read_client_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> Sniff<ClientHelloInfo> {
    let record_type = first_byte(stream, cancel).await?;
    let mut buf = PeekBuffer::starting_at(stream, cancel, 1);

    if record_type & 0x80 == 0x80 {
        need(&mut buf, 10).await?;

        let record_length = (((record_type & 0x7f) as usize) << 8) | got(buf.read_u8())? as usize;
        if record_length < 9 {
            // message body too short
            return Err(Stop::Unrecognized);
        }
        if got(buf.read_u8())? != SSL2_CLIENT_HELLO {
            return Err(Stop::Unrecognized);
        }

        let major_version = got(buf.read_u8())?;
        let minor_version = got(buf.read_u8())?;
        let cipher_count = got(buf.read_u16())? as usize / 3;
        let session_id_length = got(buf.read_u16())? as usize;
        let random_length = got(buf.read_u16())? as usize;

        need(&mut buf, cipher_count * 3 + session_id_length + random_length).await?;

        let mut ciphers = Vec::with_capacity(cipher_count);
        for _ in 0..cipher_count {
            ciphers.push(got(buf.read_u24())?);
        }
        let session_id = got(buf.read_bytes(session_id_length))?;
        let random = got(buf.read_bytes(random_length))?;

        let hello_length = buf.position();
        return Ok(ClientHelloInfo {
            handshake_version: 2,
            major_version,
            minor_version,
            random,
            session_id,
            ciphers,
            compression_data: Vec::new(),
            extensions: None,
            hello_length,
            extensions_start: hello_length,
        });
    }

    if record_type != HANDSHAKE_RECORD {
        return Err(Stop::Unrecognized);
    }

    // 2 version + 2 length + 1 type + 3 length + 2 version + 32 random + 1 session id length
    need(&mut buf, 43).await?;

    let _record_major = got(buf.read_u8())?;
    let _record_minor = got(buf.read_u8())?;
    let record_length = got(buf.read_u16())? as usize;

    if got(buf.read_u8())? != CLIENT_HELLO {
        return Err(Stop::Unrecognized);
    }

    let _handshake_length = got(buf.read_u24())?;
    let major_version = got(buf.read_u8())?;
    let minor_version = got(buf.read_u8())?;
    let random = got(buf.read_bytes(32))?;

    let session_id_length = got(buf.read_u8())? as usize;
    need(&mut buf, session_id_length + 2).await?;
    let session_id = got(buf.read_bytes(session_id_length))?;

    let cipher_length = got(buf.read_u16())? as usize;
    need(&mut buf, cipher_length + 1).await?;
    let cipher_data = got(buf.read_bytes(cipher_length))?;
    // a trailing odd byte is skipped
    let ciphers = cipher_data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]) as u32)
        .collect();

    let compression_length = got(buf.read_u8())? as usize;
    if compression_length < 1 {
        return Err(Stop::Unrecognized);
    }
    need(&mut buf, compression_length).await?;
    let compression_data = got(buf.read_bytes(compression_length))?;

    let extensions_start = buf.position();
    let extensions = if extensions_start < record_length + 5 {
        read_extensions(&mut buf, major_version, minor_version, true).await?
    } else {
        None
    };

    Ok(ClientHelloInfo {
        handshake_version: 3,
        major_version,
        minor_version,
        random,
        session_id,
        ciphers,
        compression_data,
        extensions,
        hello_length: buf.position(),
        extensions_start,
    })
}

async fn read_server_hello<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    cancel: &CancellationToken,
) -> Sniff<ServerHelloInfo> {
    let record_type = first_byte(stream, cancel).await?;
    let mut buf = PeekBuffer::starting_at(stream, cancel, 1);

    if record_type & 0x80 == 0x80 {
        need(&mut buf, 39).await?;

        let record_length = (((record_type & 0x7f) as usize) << 8) | got(buf.read_u8())? as usize;
        if record_length < 38 {
            return Err(Stop::Unrecognized);
        }
        if got(buf.read_u8())? != SSL2_SERVER_HELLO {
            return Err(Stop::Unrecognized);
        }

        let major_version = got(buf.read_u8())?;
        let minor_version = got(buf.read_u8())?;

        // 32 bytes random + 1 byte session id + 2 bytes cipher suite
        need(&mut buf, 35).await?;
        let random = got(buf.read_bytes(32))?;
        let session_id = got(buf.read_bytes(1))?;
        let cipher_suite = got(buf.read_u16())?;

        let hello_length = buf.position();
        return Ok(ServerHelloInfo {
            handshake_version: 2,
            major_version,
            minor_version,
            random,
            session_id,
            cipher_suite,
            compression_method: 0,
            extensions: None,
            hello_length,
            extensions_start: hello_length,
        });
    }

    if record_type != HANDSHAKE_RECORD {
        return Err(Stop::Unrecognized);
    }

    need(&mut buf, 43).await?;

    let _record_major = got(buf.read_u8())?;
    let _record_minor = got(buf.read_u8())?;
    let record_length = got(buf.read_u16())? as usize;

    if got(buf.read_u8())? != SERVER_HELLO {
        return Err(Stop::Unrecognized);
    }

    let _handshake_length = got(buf.read_u24())?;
    let major_version = got(buf.read_u8())?;
    let minor_version = got(buf.read_u8())?;
    let random = got(buf.read_bytes(32))?;

    let session_id_length = got(buf.read_u8())? as usize;
    need(&mut buf, session_id_length + 3).await?;
    let session_id = got(buf.read_bytes(session_id_length))?;
    let cipher_suite = got(buf.read_u16())?;
    let compression_method = got(buf.read_u8())?;

    let extensions_start = buf.position();
    let extensions = if extensions_start < record_length + 5 {
        read_extensions(&mut buf, major_version, minor_version, false).await?
    } else {
        None
    };

    Ok(ServerHelloInfo {
        handshake_version: 3,
        major_version,
        minor_version,
        random,
        session_id,
        cipher_suite,
        compression_method,
        extensions,
        hello_length: buf.position(),
        extensions_start,
    })
}

async fn read_extensions<S: AsyncRead + Unpin>(
    buf: &mut PeekBuffer<'_, S>,
    major_version: u8,
    minor_version: u8,
    client: bool,
) -> Sniff<Option<Extensions>> {
    // SSLv3 has no extensions
    if major_version < 3 || (major_version == 3 && minor_version < 1) {
        return Ok(None);
    }

    if !buf.ensure_available(2).await? {
        return Ok(None);
    }

    // A truncated or inconsistent extension block leaves the hello itself
    // intact; only its extensions are dropped.
    let block_length = got(buf.read_u16())? as usize;
    if !buf.ensure_available(block_length).await? {
        return Ok(None);
    }

    let mut extensions = Extensions::new();
    let mut remaining = block_length;
    let mut index = 0;
    while remaining > 3 {
        let (Some(id), Some(length)) = (buf.read_u16(), buf.read_u16()) else {
            return Ok(None);
        };
        let length = length as usize;
        if length + 4 > remaining {
            return Ok(None);
        }
        let Some(data) = buf.read_bytes(length) else {
            return Ok(None);
        };
        extensions.insert(decode_extension(id, &data, index, client));
        index += 1;
        remaining -= 4 + length;
    }

    Ok(Some(extensions))
}
