//! Sniffing and HPACK benchmarks
//!
//! ClientHello parsing, method sniffing and header block re-encoding are on
//! the path of every intercepted tunnel or stream.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tunnelscope::mitm::hpack_codec::{encode_header_block, HeaderBlockDecoder};
use tunnelscope::mitm::{peek_client_hello, sniff_method, BufferedStream};

/// TLS 1.2 ClientHello with SNI, ALPN and `extra` padding extension bytes
fn client_hello(extra: usize) -> Vec<u8> {
    let mut extensions = Vec::new();

    let host = b"www.example.com";
    extensions.extend_from_slice(&[0x00, 0x00]);
    extensions.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
    extensions.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    extensions.push(0);
    extensions.extend_from_slice(&(host.len() as u16).to_be_bytes());
    extensions.extend_from_slice(host);

    let alpn = b"\x02h2\x08http/1.1";
    extensions.extend_from_slice(&[0x00, 0x10]);
    extensions.extend_from_slice(&((alpn.len() + 2) as u16).to_be_bytes());
    extensions.extend_from_slice(&(alpn.len() as u16).to_be_bytes());
    extensions.extend_from_slice(alpn);

    extensions.extend_from_slice(&[0x00, 0x15]);
    extensions.extend_from_slice(&(extra as u16).to_be_bytes());
    extensions.extend(std::iter::repeat(0).take(extra));

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x04, 0xC0, 0x2F, 0xC0, 0x30, 0x01, 0x00]);
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

fn bench_client_hello(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cancel = &CancellationToken::new();
    let mut group = c.benchmark_group("client_hello");

    let small = &client_hello(0)[..];
    group.bench_function("minimal", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut stream = BufferedStream::new(black_box(small));
            peek_client_hello(&mut stream, cancel).await.unwrap()
        })
    });

    // browsers pad hellos to ~512 bytes
    let padded = &client_hello(400)[..];
    group.bench_function("padded_512b", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut stream = BufferedStream::new(black_box(padded));
            peek_client_hello(&mut stream, cancel).await.unwrap()
        })
    });

    let not_tls = &b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..];
    group.bench_function("not_a_hello", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut stream = BufferedStream::new(black_box(not_tls));
            peek_client_hello(&mut stream, cancel).await.unwrap()
        })
    });

    group.finish();
}

fn bench_method_sniff(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cancel = &CancellationToken::new();

    let connect = &b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"[..];
    c.bench_function("sniff_connect", |b| {
        b.to_async(&rt).iter(|| async move {
            let mut stream = BufferedStream::new(black_box(connect));
            sniff_method(&mut stream, "CONNECT", cancel).await.unwrap()
        })
    });
}

fn bench_header_blocks(c: &mut Criterion) {
    let fields: Vec<(&[u8], &[u8])> = vec![
        (b":method", b"GET"),
        (b":scheme", b"https"),
        (b":authority", b"www.example.com"),
        (b":path", b"/static/app.js?v=1234567890"),
        (b"accept", b"*/*"),
        (b"accept-encoding", b"gzip, deflate, br"),
        (b"accept-language", b"en-US,en;q=0.9"),
        (b"user-agent", b"Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36"),
        (b"cookie", b"session=0123456789abcdef; theme=dark"),
    ];

    c.bench_function("encode_header_block", |b| {
        b.iter(|| encode_header_block(black_box(fields.iter().copied())))
    });

    let block = encode_header_block(fields.iter().copied());
    c.bench_function("decode_header_block", |b| {
        let mut decoder = HeaderBlockDecoder::default();
        b.iter(|| decoder.decode(black_box(&block)).unwrap())
    });
}

criterion_group!(benches, bench_client_hello, bench_method_sniff, bench_header_blocks);
criterion_main!(benches);
