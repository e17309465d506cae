//! Hello sniffing tests
//!
//! ClientHello/ServerHello classification through the public API, and the
//! guarantee that sniffing never consumes bytes.

use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tunnelscope::mitm::extensions::{ALPN, SERVER_NAME};
use tunnelscope::mitm::{peek_client_hello, peek_server_hello, BufferedStream, ExtensionValue};

// ============================================================================
// Builders
// ============================================================================

fn extension(id: u16, data: &[u8]) -> Vec<u8> {
    let mut out = id.to_be_bytes().to_vec();
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn sni(host: &str) -> Vec<u8> {
    let mut entry = vec![0u8];
    entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
    entry.extend_from_slice(host.as_bytes());

    let mut data = (entry.len() as u16).to_be_bytes().to_vec();
    data.extend_from_slice(&entry);
    extension(0x0000, &data)
}

fn alpn(protocols: &[&str]) -> Vec<u8> {
    let mut list = Vec::new();
    for protocol in protocols {
        list.push(protocol.len() as u8);
        list.extend_from_slice(protocol.as_bytes());
    }

    let mut data = (list.len() as u16).to_be_bytes().to_vec();
    data.extend_from_slice(&list);
    extension(0x0010, &data)
}

/// A TLS 1.2 ClientHello record
fn client_hello(ciphers: &[u16], extensions: &[Vec<u8>]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0); // session id

    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for cipher in ciphers {
        body.extend_from_slice(&cipher.to_be_bytes());
    }
    body.extend_from_slice(&[1, 0]); // null compression

    let extensions: Vec<u8> = extensions.concat();
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

// ============================================================================
// ClientHello
// ============================================================================

#[tokio::test]
async fn test_tls12_client_hello_fields() {
    let cancel = CancellationToken::new();
    let record = client_hello(
        &[0xC02F, 0xC030],
        &[sni("example.com"), alpn(&["h2", "http/1.1"])],
    );
    let mut stream = BufferedStream::new(&record[..]);

    let hello = peek_client_hello(&mut stream, &cancel)
        .await
        .unwrap()
        .expect("a well-formed ClientHello");

    assert_eq!(hello.major_version, 3);
    assert_eq!(hello.minor_version, 3);
    assert_eq!(hello.ciphers, vec![0xC02F, 0xC030]);
    assert_eq!(hello.version_name(), "3.3 (TLS/1.2)");

    let extensions = hello.extensions.as_ref().expect("extensions");
    assert_eq!(
        extensions.get(SERVER_NAME).unwrap().value,
        ExtensionValue::ServerNames(vec!["example.com".to_string()])
    );
    assert_eq!(
        extensions.get(ALPN).unwrap().value,
        ExtensionValue::Protocols(vec!["h2".to_string(), "http/1.1".to_string()])
    );
    assert_eq!(hello.sni(), Some("example.com"));
    assert!(hello.offers_protocol("h2"));
    assert_eq!(hello.hello_length, record.len());
}

#[tokio::test]
async fn test_client_hello_is_not_consumed() {
    let cancel = CancellationToken::new();
    let record = client_hello(&[0x1301], &[sni("example.com")]);
    let mut stream = BufferedStream::new(&record[..]);

    assert!(peek_client_hello(&mut stream, &cancel).await.unwrap().is_some());

    let mut replayed = Vec::new();
    stream.read_to_end(&mut replayed).await.unwrap();
    assert_eq!(replayed, record);
}

#[tokio::test]
async fn test_truncated_input_is_unrecognised_and_preserved() {
    let cancel = CancellationToken::new();
    let record = client_hello(&[0xC02F], &[sni("example.com")]);

    // every prefix shorter than the fixed part of a hello
    for len in 0..43 {
        let prefix = &record[..len];
        let mut stream = BufferedStream::new(prefix);

        assert!(
            peek_client_hello(&mut stream, &cancel).await.unwrap().is_none(),
            "prefix of {} bytes",
            len
        );
        assert!(peek_server_hello(&mut stream, &cancel).await.unwrap().is_none());

        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, prefix);
    }
}

#[tokio::test]
async fn test_short_sslv2_record_is_unrecognised() {
    let cancel = CancellationToken::new();
    // record length 8, padded past the 10 byte minimum read
    let record = [0x80, 0x08, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x10, 0x00];
    let mut stream = BufferedStream::new(&record[..]);

    assert!(peek_client_hello(&mut stream, &cancel).await.unwrap().is_none());
}

#[tokio::test]
async fn test_plain_http_is_not_a_hello() {
    let cancel = CancellationToken::new();
    let mut stream = BufferedStream::new(&b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..]);

    assert!(peek_client_hello(&mut stream, &cancel).await.unwrap().is_none());

    let line = stream.read_line(&cancel).await.unwrap();
    assert_eq!(line.as_deref(), Some("GET / HTTP/1.1"));
}

#[tokio::test]
async fn test_cancelled_sniff_returns_promptly() {
    let cancel = CancellationToken::new();
    let (_writer, reader) = tokio::io::duplex(64);
    let mut stream = BufferedStream::new(reader);

    cancel.cancel();
    let sniffed = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        peek_client_hello(&mut stream, &cancel),
    )
    .await
    .expect("sniff must not block once cancelled");
    assert!(sniffed.unwrap().is_none());
}
