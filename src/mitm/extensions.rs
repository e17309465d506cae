//! TLS hello extension decoding
//!
//! Every extension is kept with its raw payload and wire position. SNI and
//! ALPN (which drive the MITM and HTTP/2 decisions) and a handful of common
//! list-shaped extensions are also decoded into typed values.

use serde::Serialize;
use std::fmt::Write as _;

pub const SERVER_NAME: &str = "server_name";
pub const ALPN: &str = "application_layer_protocol_negotiation";
pub const SUPPORTED_VERSIONS: &str = "supported_versions";

/// Decoded form of an extension payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtensionValue {
    ServerNames(Vec<String>),
    Protocols(Vec<String>),
    Versions(Vec<u16>),
    Groups(Vec<u16>),
    SignatureSchemes(Vec<u16>),
    PointFormats(Vec<u8>),
    Opaque,
}

/// One extension as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SslExtension {
    pub id: u16,
    pub name: String,
    /// Ordinal of the extension within the hello
    pub position: usize,
    pub data: Vec<u8>,
    pub value: ExtensionValue,
    pub summary: String,
}

/// Extensions keyed by name, iterated in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extensions {
    entries: Vec<SslExtension>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an extension; a repeated name replaces the earlier entry in place.
    pub fn insert(&mut self, extension: SslExtension) {
        match self.entries.iter_mut().find(|e| e.name == extension.name) {
            Some(existing) => *existing = extension,
            None => self.entries.push(extension),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SslExtension> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_by_id(&self, id: u16) -> Option<&SslExtension> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SslExtension> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Host names from the SNI extension
    pub fn server_names(&self) -> Option<&[String]> {
        match &self.get(SERVER_NAME)?.value {
            ExtensionValue::ServerNames(names) => Some(names),
            _ => None,
        }
    }

    /// Protocol ids from the ALPN extension
    pub fn alpn_protocols(&self) -> Option<&[String]> {
        match &self.get(ALPN)?.value {
            ExtensionValue::Protocols(protocols) => Some(protocols),
            _ => None,
        }
    }
}

/// Check if a u16 value is a GREASE value (RFC 8701).
pub fn is_grease(value: u16) -> bool {
    let hi = (value >> 8) as u8;
    let lo = value as u8;
    hi == lo && (hi & 0x0F) == 0x0A
}

/// IANA name for an extension id
pub fn extension_name(id: u16) -> String {
    let name = match id {
        0 => SERVER_NAME,
        1 => "max_fragment_length",
        2 => "client_certificate_url",
        3 => "trusted_ca_keys",
        4 => "truncated_hmac",
        5 => "status_request",
        6 => "user_mapping",
        7 => "client_authz",
        8 => "server_authz",
        9 => "cert_type",
        10 => "supported_groups",
        11 => "ec_point_formats",
        12 => "srp",
        13 => "signature_algorithms",
        14 => "use_srtp",
        15 => "heartbeat",
        16 => ALPN,
        17 => "status_request_v2",
        18 => "signed_certificate_timestamp",
        19 => "client_certificate_type",
        20 => "server_certificate_type",
        21 => "padding",
        22 => "encrypt_then_mac",
        23 => "extended_master_secret",
        24 => "token_binding",
        25 => "cached_info",
        27 => "compress_certificate",
        28 => "record_size_limit",
        35 => "session_ticket",
        41 => "pre_shared_key",
        42 => "early_data",
        43 => SUPPORTED_VERSIONS,
        44 => "cookie",
        45 => "psk_key_exchange_modes",
        47 => "certificate_authorities",
        48 => "oid_filters",
        49 => "post_handshake_auth",
        50 => "signature_algorithms_cert",
        51 => "key_share",
        57 => "quic_transport_parameters",
        13172 => "next_protocol_negotiation",
        17513 => "application_settings",
        65037 => "encrypted_client_hello",
        65281 => "renegotiation_info",
        id if is_grease(id) => return format!("grease_{:#06x}", id),
        id => return format!("unknown_{:#06x}", id),
    };
    name.to_string()
}

/// Decode one extension payload.
///
/// `client` selects the ClientHello layout where client and server encode
/// an extension differently (supported_versions).
pub fn decode_extension(id: u16, data: &[u8], position: usize, client: bool) -> SslExtension {
    let value = decode_value(id, data, client).unwrap_or(ExtensionValue::Opaque);
    let summary = summarize(&value, data);

    SslExtension {
        id,
        name: extension_name(id),
        position,
        data: data.to_vec(),
        value,
        summary,
    }
}

fn decode_value(id: u16, data: &[u8], client: bool) -> Option<ExtensionValue> {
    match id {
        0 if !data.is_empty() => decode_server_names(data).map(ExtensionValue::ServerNames),
        16 => decode_protocols(data).map(ExtensionValue::Protocols),
        43 if client => decode_u16_list(data, 1).map(ExtensionValue::Versions),
        43 => match data {
            [a, b] => Some(ExtensionValue::Versions(vec![u16::from_be_bytes([*a, *b])])),
            _ => None,
        },
        10 => decode_u16_list(data, 2).map(ExtensionValue::Groups),
        13 | 50 => decode_u16_list(data, 2).map(ExtensionValue::SignatureSchemes),
        11 => {
            let (len, rest) = data.split_first()?;
            (*len as usize == rest.len()).then(|| ExtensionValue::PointFormats(rest.to_vec()))
        }
        _ => None,
    }
}

/// server_name_list: u16 length, then (type u8, u16 length, name)*
fn decode_server_names(data: &[u8]) -> Option<Vec<String>> {
    let list = length_prefixed_u16(data)?;
    let mut names = Vec::new();
    let mut rest = list;
    while !rest.is_empty() {
        let (name_type, tail) = rest.split_first()?;
        let name = length_prefixed_u16(tail)?;
        if *name_type == 0 {
            names.push(String::from_utf8_lossy(name).into_owned());
        }
        rest = &tail[2 + name.len()..];
    }
    Some(names)
}

/// protocol_name_list: u16 length, then (u8 length, name)*
fn decode_protocols(data: &[u8]) -> Option<Vec<String>> {
    let list = length_prefixed_u16(data)?;
    let mut protocols = Vec::new();
    let mut rest = list;
    while let Some((len, tail)) = rest.split_first() {
        let len = *len as usize;
        let name = tail.get(..len)?;
        protocols.push(String::from_utf8_lossy(name).into_owned());
        rest = &tail[len..];
    }
    Some(protocols)
}

fn decode_u16_list(data: &[u8], prefix_len: usize) -> Option<Vec<u16>> {
    let (prefix, body) = (data.get(..prefix_len)?, data.get(prefix_len..)?);
    let declared = prefix.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if declared != body.len() || declared % 2 != 0 {
        return None;
    }
    Some(
        body.chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

fn length_prefixed_u16(data: &[u8]) -> Option<&[u8]> {
    let len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    data.get(2..2 + len)
}

fn summarize(value: &ExtensionValue, data: &[u8]) -> String {
    match value {
        ExtensionValue::ServerNames(names) => names.join(", "),
        ExtensionValue::Protocols(protocols) => protocols.join(", "),
        ExtensionValue::Versions(versions) => versions
            .iter()
            .map(|v| version_label(*v))
            .collect::<Vec<_>>()
            .join(", "),
        ExtensionValue::Groups(values) | ExtensionValue::SignatureSchemes(values) => values
            .iter()
            .map(|v| format!("{:#06x}", v))
            .collect::<Vec<_>>()
            .join(", "),
        ExtensionValue::PointFormats(formats) => formats
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        ExtensionValue::Opaque => hex(data),
    }
}

fn version_label(version: u16) -> String {
    match version {
        0x0300 => "SSL 3.0".to_string(),
        0x0301 => "TLS 1.0".to_string(),
        0x0302 => "TLS 1.1".to_string(),
        0x0303 => "TLS 1.2".to_string(),
        0x0304 => "TLS 1.3".to_string(),
        v if is_grease(v) => "GREASE".to_string(),
        v => format!("{:#06x}", v),
    }
}

/// Lower-case hex rendering of raw bytes
pub(crate) fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sni_payload(host: &str) -> Vec<u8> {
        let mut entry = vec![0u8];
        entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        entry.extend_from_slice(host.as_bytes());
        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend(entry);
        data
    }

    #[test]
    fn test_hex_is_zero_padded_lower_case() {
        assert_eq!(hex(&[0x00, 0x0f, 0xab]), "000fab");
        assert_eq!(hex(&[]), "");
    }

    #[test]
    fn test_decode_sni() {
        let ext = decode_extension(0, &sni_payload("example.com"), 0, true);
        assert_eq!(ext.name, SERVER_NAME);
        assert_eq!(
            ext.value,
            ExtensionValue::ServerNames(vec!["example.com".to_string()])
        );
        assert_eq!(ext.summary, "example.com");
    }

    #[test]
    fn test_decode_alpn() {
        let data = [0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1'];
        let ext = decode_extension(16, &data, 3, true);
        assert_eq!(ext.position, 3);
        assert_eq!(
            ext.value,
            ExtensionValue::Protocols(vec!["h2".to_string(), "http/1.1".to_string()])
        );
    }

    #[test]
    fn test_truncated_alpn_is_opaque() {
        let data = [0x00, 0x05, 0x02, b'h', b'2', 0x08, b'h'];
        let ext = decode_extension(16, &data, 0, true);
        assert_eq!(ext.value, ExtensionValue::Opaque);
        assert_eq!(ext.summary, "00050268320868");
    }

    #[test]
    fn test_supported_versions_client_and_server() {
        let client = decode_extension(43, &[0x04, 0x03, 0x04, 0x03, 0x03], 0, true);
        assert_eq!(client.value, ExtensionValue::Versions(vec![0x0304, 0x0303]));
        assert_eq!(client.summary, "TLS 1.3, TLS 1.2");

        let server = decode_extension(43, &[0x03, 0x04], 0, false);
        assert_eq!(server.value, ExtensionValue::Versions(vec![0x0304]));
    }

    #[test]
    fn test_unknown_and_grease_names() {
        assert_eq!(extension_name(0x1a1a), "grease_0x1a1a");
        assert_eq!(extension_name(0x7777), "unknown_0x7777");
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x0303));
    }

    #[test]
    fn test_extensions_keep_wire_order() {
        let mut extensions = Extensions::new();
        extensions.insert(decode_extension(16, &[0x00, 0x03, 0x02, b'h', b'2'], 0, true));
        extensions.insert(decode_extension(0, &sni_payload("a.test"), 1, true));
        extensions.insert(decode_extension(23, &[], 2, true));

        let names: Vec<_> = extensions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![ALPN, SERVER_NAME, "extended_master_secret"]);
        assert_eq!(extensions.server_names().unwrap(), ["a.test".to_string()]);
        assert_eq!(extensions.alpn_protocols().unwrap(), ["h2".to_string()]);
        assert_eq!(extensions.get_by_id(23).unwrap().summary, "");
    }
}
