//! Structured HTTP/2 requests and responses
//!
//! The relay decodes every header block into one of these, hands it to the
//! request/response hooks, and encodes it back when forwarding. Bodies are
//! only present when a hook asked for them.

use super::error::{MitmError, Result};
use super::hpack_codec::{encode_header_block, HeaderFields};
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};

/// Upper bound for a decompressed captured body
pub const MAX_DECODED_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Ordinary (non pseudo) header fields in wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<HeaderField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: String,
    value: String,
    /// The value arrived as obs-text and is held as latin-1
    latin1: bool,
}

impl HeaderField {
    fn new(name: String, value: String) -> Self {
        Self {
            name,
            value,
            latin1: false,
        }
    }

    fn value_bytes(&self) -> Vec<u8> {
        if self.latin1 {
            self.value.chars().map(|c| c as u32 as u8).collect()
        } else {
            self.value.as_bytes().to_vec()
        }
    }
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(HeaderField::new(name.into(), value.into()));
    }

    /// First value for `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// Replace every value of `name` with a single one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.fields[index].value = value;
                self.fields[index].latin1 = false;
                let mut seen = 0;
                self.fields.retain(|f| {
                    if f.name.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.add(name.to_ascii_lowercase(), value),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before != self.fields.len()
    }

    /// Values that arrived as obs-text are shown decoded as latin-1.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|f| (f.name.as_str(), f.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build from a decoded trailer block; pseudo-headers are dropped.
    pub fn from_fields(fields: HeaderFields) -> Result<Self> {
        let mut list = Self::new();
        for (name, value) in fields {
            let field = decode_field(name, value)?;
            if !field.name.starts_with(':') {
                list.fields.push(field);
            }
        }
        Ok(list)
    }

    /// Lower-cased names with the value octets as they go on the wire
    fn wire_fields(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.fields
            .iter()
            .map(|f| (f.name.to_ascii_lowercase().into_bytes(), f.value_bytes()))
            .collect()
    }
}

/// Names must be UTF-8; a value that is not is kept byte for byte as
/// latin-1 (obs-text).
fn decode_field(name: Vec<u8>, value: Vec<u8>) -> Result<HeaderField> {
    let name = String::from_utf8(name)
        .map_err(|_| MitmError::protocol("header name is not valid UTF-8"))?;
    match String::from_utf8(value) {
        Ok(value) => Ok(HeaderField::new(name, value)),
        Err(e) => Ok(HeaderField {
            name,
            value: e.into_bytes().into_iter().map(char::from).collect(),
            latin1: true,
        }),
    }
}

/// Stream dependency and weight from a PRIORITY-flagged HEADERS frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl StreamPriority {
    pub const LEN: usize = 5;

    pub fn parse(data: &[u8]) -> Option<Self> {
        let raw = data.get(..Self::LEN)?;
        Some(Self {
            exclusive: raw[0] & 0x80 != 0,
            dependency: u32::from_be_bytes([raw[0] & 0x7f, raw[1], raw[2], raw[3]]),
            weight: raw[4],
        })
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut dep = (self.dependency & 0x7fff_ffff).to_be_bytes();
        if self.exclusive {
            dep[0] |= 0x80;
        }
        [dep[0], dep[1], dep[2], dep[3], self.weight]
    }
}

/// A request seen on a client-initiated stream (or promised by the server)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2Request {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: HeaderList,
    pub trailers: Option<HeaderList>,
    pub body: Option<Bytes>,
    pub priority: Option<StreamPriority>,
}

/// A response (or informational response) seen on the server side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2Response {
    pub status: u16,
    pub headers: HeaderList,
    pub trailers: Option<HeaderList>,
    pub body: Option<Bytes>,
    pub priority: Option<StreamPriority>,
}

impl Http2Request {
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.authority, self.path)
    }
}

/// Shared behaviour of requests and responses for the relay.
pub trait Http2Message: Send + 'static {
    fn headers(&self) -> &HeaderList;
    fn headers_mut(&mut self) -> &mut HeaderList;
    fn body(&self) -> Option<&Bytes>;
    fn set_body(&mut self, body: Option<Bytes>);
    fn priority(&self) -> Option<StreamPriority>;
    fn set_priority(&mut self, priority: Option<StreamPriority>);
    fn trailers(&self) -> Option<&HeaderList>;
    fn trailers_mut(&mut self) -> &mut Option<HeaderList>;

    /// Pseudo-header fields in the order they are emitted
    fn pseudo_headers(&self) -> Vec<(&'static str, String)>;

    /// Record a pseudo-header; returns false for names this message does
    /// not carry.
    fn set_pseudo_header(&mut self, name: &str, value: String) -> Result<bool>;

    fn content_encoding(&self) -> Option<&str> {
        self.headers().get("content-encoding")
    }

    /// Populate from a decoded header block, returning unrecognised pseudo-headers.
    fn apply_fields(&mut self, fields: HeaderFields) -> Result<Vec<String>> {
        let mut ignored = Vec::new();
        for (name, value) in fields {
            let field = decode_field(name, value)?;
            if field.name.starts_with(':') {
                if !self.set_pseudo_header(&field.name, field.value)? {
                    ignored.push(field.name);
                }
            } else {
                self.headers_mut().fields.push(field);
            }
        }
        Ok(ignored)
    }

    /// Encode pseudo-headers and headers into one header block.
    fn encode_headers(&self) -> Vec<u8> {
        let pseudo = self.pseudo_headers();
        let wire = self.headers().wire_fields();
        encode_header_block(
            pseudo
                .iter()
                .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
                .chain(wire.iter().map(|(n, v)| (n.as_slice(), v.as_slice()))),
        )
    }

    /// Compress the captured body for its content-encoding and fix up
    /// `content-length`. Returns the bytes to put on the wire.
    fn prepare_body(&mut self, recompress: bool) -> Result<Bytes> {
        let body = self.body().cloned().unwrap_or_default();
        let wire = match (recompress, self.content_encoding()) {
            (true, Some(encoding)) => Bytes::from(encode_body(encoding, &body)?),
            _ => body,
        };
        self.headers_mut().set("content-length", wire.len().to_string());
        Ok(wire)
    }
}

impl Http2Message for Http2Request {
    fn headers(&self) -> &HeaderList {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    fn priority(&self) -> Option<StreamPriority> {
        self.priority
    }

    fn set_priority(&mut self, priority: Option<StreamPriority>) {
        self.priority = priority;
    }

    fn trailers(&self) -> Option<&HeaderList> {
        self.trailers.as_ref()
    }

    fn trailers_mut(&mut self) -> &mut Option<HeaderList> {
        &mut self.trailers
    }

    fn pseudo_headers(&self) -> Vec<(&'static str, String)> {
        let mut pseudo = vec![(":method", self.method.clone())];
        // CONNECT carries no :scheme or :path
        if self.method != "CONNECT" || !self.path.is_empty() {
            pseudo.push((":scheme", self.scheme.clone()));
        }
        if !self.authority.is_empty() {
            pseudo.push((":authority", self.authority.clone()));
        }
        if self.method != "CONNECT" || !self.path.is_empty() {
            pseudo.push((":path", self.path.clone()));
        }
        pseudo
    }

    fn set_pseudo_header(&mut self, name: &str, value: String) -> Result<bool> {
        match name {
            ":method" => self.method = value,
            ":scheme" => self.scheme = value,
            ":authority" => self.authority = value,
            ":path" => self.path = value,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl Http2Message for Http2Response {
    fn headers(&self) -> &HeaderList {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    fn priority(&self) -> Option<StreamPriority> {
        self.priority
    }

    fn set_priority(&mut self, priority: Option<StreamPriority>) {
        self.priority = priority;
    }

    fn trailers(&self) -> Option<&HeaderList> {
        self.trailers.as_ref()
    }

    fn trailers_mut(&mut self) -> &mut Option<HeaderList> {
        &mut self.trailers
    }

    fn pseudo_headers(&self) -> Vec<(&'static str, String)> {
        vec![(":status", self.status.to_string())]
    }

    fn set_pseudo_header(&mut self, name: &str, value: String) -> Result<bool> {
        if name != ":status" {
            return Ok(false);
        }
        self.status = parse_status(&value)?;
        Ok(true)
    }
}

/// Three digit `:status` value
pub fn parse_status(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(status) if value.len() == 3 && (100..=999).contains(&status) => Ok(status),
        _ => Err(MitmError::protocol(format!("invalid :status '{}'", value))),
    }
}

/// Encode a trailer block (no pseudo-headers)
pub fn encode_trailers(trailers: &HeaderList) -> Vec<u8> {
    let wire = trailers.wire_fields();
    encode_header_block(wire.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
}

/// Whether `decode_body`/`encode_body` understand this content-encoding.
pub fn is_supported_encoding(encoding: &str) -> bool {
    matches!(
        encoding.trim().to_ascii_lowercase().as_str(),
        "" | "identity" | "gzip" | "x-gzip" | "deflate"
    )
}

/// Undo a content-encoding.
pub fn decode_body(encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
    let encoding_lc = encoding.trim().to_ascii_lowercase();
    let mut out = Vec::new();
    let read = match encoding_lc.as_str() {
        "" | "identity" => return Ok(data.to_vec()),
        "gzip" | "x-gzip" => GzDecoder::new(data)
            .take(MAX_DECODED_BODY_SIZE + 1)
            .read_to_end(&mut out),
        // "deflate" is zlib-wrapped per RFC 9110, but raw deflate is common
        "deflate" => match ZlibDecoder::new(data)
            .take(MAX_DECODED_BODY_SIZE + 1)
            .read_to_end(&mut out)
        {
            Ok(n) => Ok(n),
            Err(_) => {
                out.clear();
                DeflateDecoder::new(data)
                    .take(MAX_DECODED_BODY_SIZE + 1)
                    .read_to_end(&mut out)
            }
        },
        _ => return Err(MitmError::content_coding(encoding, "unsupported encoding")),
    };

    read.map_err(|e| MitmError::content_coding(encoding, e.to_string()))?;
    if out.len() as u64 > MAX_DECODED_BODY_SIZE {
        return Err(MitmError::content_coding(encoding, "decoded body too large"));
    }
    Ok(out)
}

/// Apply a content-encoding.
pub fn encode_body(encoding: &str, data: &[u8]) -> Result<Vec<u8>> {
    let encoding_lc = encoding.trim().to_ascii_lowercase();
    let encoded = match encoding_lc.as_str() {
        "" | "identity" => return Ok(data.to_vec()),
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).and_then(|_| encoder.finish())
        }
        _ => return Err(MitmError::content_coding(encoding, "unsupported encoding")),
    };
    encoded.map_err(|e| MitmError::content_coding(encoding, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::hpack_codec::HeaderBlockDecoder;

    #[test]
    fn test_header_list_set_replaces_all() {
        let mut headers = HeaderList::new();
        headers.add("Content-Length", "10");
        headers.add("x-a", "1");
        headers.add("content-length", "11");
        headers.set("content-length", "12");

        assert_eq!(headers.get("CONTENT-LENGTH"), Some("12"));
        assert_eq!(headers.get_all("content-length").count(), 1);
        assert_eq!(headers.len(), 2);
        assert!(headers.remove("x-a"));
        assert!(!headers.remove("x-a"));
    }

    #[test]
    fn test_priority_round_trip_bits() {
        let priority = StreamPriority::parse(&[0x80, 0x00, 0x00, 0x03, 0xff]).unwrap();
        assert!(priority.exclusive);
        assert_eq!(priority.dependency, 3);
        assert_eq!(priority.weight, 255);
        assert_eq!(priority.encode(), [0x80, 0x00, 0x00, 0x03, 0xff]);
        assert!(StreamPriority::parse(&[0x00; 4]).is_none());
    }

    #[test]
    fn test_request_from_fields_and_back() {
        let fields = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":scheme".to_vec(), b"https".to_vec()),
            (b":authority".to_vec(), b"example.com".to_vec()),
            (b":path".to_vec(), b"/a".to_vec()),
            (b":protocol".to_vec(), b"websocket".to_vec()),
            (b"accept".to_vec(), b"*/*".to_vec()),
        ];

        let mut request = Http2Request::default();
        let ignored = request.apply_fields(fields).unwrap();
        assert_eq!(ignored, vec![":protocol".to_string()]);
        assert_eq!(request.url(), "https://example.com/a");
        assert_eq!(request.headers.get("accept"), Some("*/*"));

        let block = request.encode_headers();
        let decoded = HeaderBlockDecoder::default().decode(&block).unwrap();
        assert_eq!(decoded[0], (b":method".to_vec(), b"GET".to_vec()));
        assert_eq!(decoded[3], (b":path".to_vec(), b"/a".to_vec()));
        assert_eq!(decoded[4], (b"accept".to_vec(), b"*/*".to_vec()));
    }

    #[test]
    fn test_response_status() {
        let mut response = Http2Response::default();
        response
            .apply_fields(vec![(b":status".to_vec(), b"404".to_vec())])
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.pseudo_headers(), vec![(":status", "404".to_string())]);
    }

    #[test]
    fn test_obs_text_value_survives_reencoding() {
        let mut response = Http2Response::default();
        response
            .apply_fields(vec![
                (b":status".to_vec(), b"200".to_vec()),
                (b"x-name".to_vec(), vec![b'J', 0xf6, b'r', b'g']),
            ])
            .unwrap();
        assert_eq!(response.headers.get("x-name"), Some("J\u{f6}rg"));

        let decoded = HeaderBlockDecoder::default()
            .decode(&response.encode_headers())
            .unwrap();
        assert_eq!(decoded[1], (b"x-name".to_vec(), vec![b'J', 0xf6, b'r', b'g']));

        // a value set by a hook is plain UTF-8 again
        response.headers.set("x-name", "J\u{f6}rg");
        let decoded = HeaderBlockDecoder::default()
            .decode(&response.encode_headers())
            .unwrap();
        assert_eq!(decoded[1].1, "J\u{f6}rg".as_bytes());
    }

    #[test]
    fn test_non_utf8_header_name_is_rejected() {
        let mut request = Http2Request::default();
        let result = request.apply_fields(vec![(vec![0xff, b'x'], b"1".to_vec())]);
        assert!(matches!(result, Err(MitmError::ProtocolViolation(_))));
    }

    #[test]
    fn test_malformed_status_is_rejected() {
        for bad in ["", "abc", "20", "2000", "099", "+200"] {
            let mut response = Http2Response::default();
            let result = response.apply_fields(vec![(b":status".to_vec(), bad.as_bytes().to_vec())]);
            assert!(result.is_err(), "{:?}", bad);
        }
        assert_eq!(parse_status("103").unwrap(), 103);
    }

    #[test]
    fn test_gzip_round_trip_and_content_length() {
        let compressed = encode_body("gzip", b"hello world").unwrap();
        assert_eq!(decode_body("gzip", &compressed).unwrap(), b"hello world");

        let mut response = Http2Response::default();
        response.headers.add("content-encoding", "gzip");
        response.body = Some(Bytes::from_static(b"hello world"));
        let wire = response.prepare_body(true).unwrap();
        assert_eq!(decode_body("gzip", &wire).unwrap(), b"hello world");
        assert_eq!(
            response.headers.get("content-length"),
            Some(wire.len().to_string().as_str())
        );
    }

    #[test]
    fn test_deflate_accepts_raw_streams() {
        let mut raw = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        raw.write_all(b"raw deflate").unwrap();
        let raw = raw.finish().unwrap();
        assert_eq!(decode_body("deflate", &raw).unwrap(), b"raw deflate");

        let zlib = encode_body("deflate", b"zlib deflate").unwrap();
        assert_eq!(decode_body("Deflate", &zlib).unwrap(), b"zlib deflate");
    }

    #[test]
    fn test_unsupported_encoding() {
        assert!(!is_supported_encoding("br"));
        assert!(decode_body("br", b"x").is_err());
        assert!(is_supported_encoding("identity"));
        assert_eq!(decode_body("identity", b"x").unwrap(), b"x");
    }
}
