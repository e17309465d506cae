//! Read-ahead buffering for protocol sniffing
//!
//! `BufferedStream` keeps every byte it pulls from the socket until a consumer
//! reads it through `AsyncRead`. Sniffers look at the buffered window with a
//! `PeekBuffer`; whatever runs next (TLS acceptor, frame relay, raw copy)
//! still sees the stream from its first byte.

use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

/// Default read chunk size
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Longest line accepted by `read_line` (CONNECT line, preface lines)
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Any bidirectional byte stream the proxy can hold behind one type
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Type-erased client or upstream transport (TCP, TLS over TCP, in-memory)
pub type BoxedIo = Box<dyn AsyncIo>;

/// A stream wrapper that buffers read-ahead bytes and replays them.
pub struct BufferedStream<S> {
    inner: S,
    buf: BytesMut,
    chunk_size: usize,
    read_timeout: Option<Duration>,
}

impl<S> BufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, inner)
    }

    pub fn with_capacity(chunk_size: usize, inner: S) -> Self {
        let chunk_size = chunk_size.max(64);
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            read_timeout: None,
        }
    }

    /// Bound every fill operation; an expired fill reports "not available".
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes read from the source but not yet consumed
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn available(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return everything currently buffered.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Drop `count` buffered bytes (clamped to what is buffered).
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.advance(count);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Split into the source and any bytes still owed to the next reader.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.inner, self.buf.freeze())
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Read from the source until at least `len` bytes are buffered.
    ///
    /// Returns `Ok(false)` on end of stream, read timeout or cancellation.
    pub async fn fill_to(&mut self, len: usize, cancel: &CancellationToken) -> io::Result<bool> {
        while self.buf.len() < len {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            let want = (len - self.buf.len()).max(self.chunk_size);
            self.buf.reserve(want);

            let read_timeout = self.read_timeout;
            let read = self.inner.read_buf(&mut self.buf);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                outcome = bounded(read_timeout, read) => outcome,
            };

            match outcome {
                None => return Ok(false),
                Some(Ok(0)) => return Ok(false),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Look at the byte at `index` without consuming it.
    pub async fn peek_byte(
        &mut self,
        index: usize,
        cancel: &CancellationToken,
    ) -> io::Result<Option<u8>> {
        if !self.fill_to(index + 1, cancel).await? {
            return Ok(None);
        }
        Ok(self.buf.get(index).copied())
    }

    /// Read one CRLF (or LF) terminated line, consuming it.
    ///
    /// Returns `Ok(None)` if the stream ends before a line terminator.
    pub async fn read_line(&mut self, cancel: &CancellationToken) -> io::Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(offset) = self.buf[scanned..].iter().position(|b| *b == b'\n') {
                let line = self.buf.split_to(scanned + offset + 1);
                let mut line = &line[..line.len() - 1];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                return Ok(Some(String::from_utf8_lossy(line).into_owned()));
            }

            scanned = self.buf.len();
            if scanned >= MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds maximum length",
                ));
            }

            if !self.fill_to(scanned + 1, cancel).await? {
                return Ok(None);
            }
        }
    }
}

async fn bounded<F>(limit: Option<Duration>, fut: F) -> Option<F::Output>
where
    F: Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buf.is_empty() {
            let n = this.buf.len().min(out.remaining());
            out.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A read cursor over the buffered window of a `BufferedStream`.
///
/// Reads only move the local cursor; the stream's own read position is
/// untouched. `ensure_available(n)` is relative to the cursor.
pub struct PeekBuffer<'a, S> {
    stream: &'a mut BufferedStream<S>,
    cancel: &'a CancellationToken,
    position: usize,
}

impl<'a, S: AsyncRead + Unpin> PeekBuffer<'a, S> {
    pub fn new(stream: &'a mut BufferedStream<S>, cancel: &'a CancellationToken) -> Self {
        Self::starting_at(stream, cancel, 0)
    }

    pub fn starting_at(
        stream: &'a mut BufferedStream<S>,
        cancel: &'a CancellationToken,
        position: usize,
    ) -> Self {
        Self {
            stream,
            cancel,
            position,
        }
    }

    /// Offset of the cursor from the first unconsumed byte of the stream
    pub fn position(&self) -> usize {
        self.position
    }

    /// Make sure `count` bytes past the cursor are buffered.
    pub async fn ensure_available(&mut self, count: usize) -> io::Result<bool> {
        self.stream.fill_to(self.position + count, self.cancel).await
    }

    fn window(&self) -> &[u8] {
        self.stream.buffered().get(self.position..).unwrap_or(&[])
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let value = *self.window().first()?;
        self.position += 1;
        Some(value)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let value = match self.window() {
            [a, b, ..] => u16::from_be_bytes([*a, *b]),
            _ => return None,
        };
        self.position += 2;
        Some(value)
    }

    pub fn read_u24(&mut self) -> Option<u32> {
        let value = match self.window() {
            [a, b, c, ..] => u32::from_be_bytes([0, *a, *b, *c]),
            _ => return None,
        };
        self.position += 3;
        Some(value)
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<Vec<u8>> {
        let bytes = self.window().get(..len)?.to_vec();
        self.position += len;
        Some(bytes)
    }
}

/// Result of classifying the first token on a stream as an HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSniff {
    /// The token equals the expected method
    Matches,
    /// A well-formed method token, but a different one
    OtherMethod,
    /// Not an HTTP request line (binary data or end of stream)
    NotHttp,
}

/// Peek at the method token of a request line without consuming it.
///
/// Looks at up to 10 bytes. A token is letters followed by a space after at
/// least three characters.
pub async fn sniff_method<S: AsyncRead + Unpin>(
    stream: &mut BufferedStream<S>,
    expected: &str,
    cancel: &CancellationToken,
) -> io::Result<MethodSniff> {
    const LENGTH_TO_CHECK: usize = 10;
    let expected = expected.as_bytes();
    let mut is_expected = true;

    for i in 0..LENGTH_TO_CHECK {
        let Some(byte) = stream.peek_byte(i, cancel).await? else {
            return Ok(MethodSniff::NotHttp);
        };

        if byte == b' ' && i > 2 {
            return Ok(if is_expected && i == expected.len() {
                MethodSniff::Matches
            } else {
                MethodSniff::OtherMethod
            });
        }

        if !byte.is_ascii_alphabetic() {
            return Ok(MethodSniff::NotHttp);
        }

        if expected.get(i) != Some(&byte) {
            is_expected = false;
        }
    }

    Ok(MethodSniff::OtherMethod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let cancel = CancellationToken::new();
        let mut stream = BufferedStream::new(&b"\x16\x03\x01\x00\x05hello"[..]);

        {
            let mut peek = PeekBuffer::new(&mut stream, &cancel);
            assert!(peek.ensure_available(5).await.unwrap());
            assert_eq!(peek.read_u8(), Some(0x16));
            assert_eq!(peek.read_u16(), Some(0x0301));
            assert_eq!(peek.read_u16(), Some(0x0005));
            assert_eq!(peek.position(), 5);
        }

        let mut all = Vec::new();
        stream.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"\x16\x03\x01\x00\x05hello");
    }

    #[tokio::test]
    async fn test_ensure_available_reports_eof() {
        let cancel = CancellationToken::new();
        let mut stream = BufferedStream::new(&b"abc"[..]);
        let mut peek = PeekBuffer::new(&mut stream, &cancel);

        assert!(peek.ensure_available(3).await.unwrap());
        assert!(!peek.ensure_available(4).await.unwrap());
        assert_eq!(peek.read_u24(), Some(0x616263));
        assert_eq!(peek.read_u8(), None);
    }

    #[tokio::test]
    async fn test_fill_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = BufferedStream::new(client);

        cancel.cancel();
        assert!(!stream.fill_to(1, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_stops_on_read_timeout() {
        let cancel = CancellationToken::new();
        let (client, _server) = tokio::io::duplex(64);
        let mut stream =
            BufferedStream::new(client).with_read_timeout(Some(Duration::from_millis(20)));

        assert!(!stream.fill_to(1, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_waits_for_split_writes() {
        let cancel = CancellationToken::new();
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = BufferedStream::new(client);

        let writer = tokio::spawn(async move {
            server.write_all(b"ab").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            server.write_all(b"cd").await.unwrap();
            server
        });

        assert!(stream.fill_to(4, &cancel).await.unwrap());
        assert_eq!(stream.buffered(), b"abcd");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let cancel = CancellationToken::new();
        let mut stream = BufferedStream::new(&b"CONNECT a:443 HTTP/1.1\r\n\r\nrest"[..]);

        assert_eq!(
            stream.read_line(&cancel).await.unwrap().as_deref(),
            Some("CONNECT a:443 HTTP/1.1")
        );
        assert_eq!(stream.read_line(&cancel).await.unwrap().as_deref(), Some(""));
        assert_eq!(stream.read_line(&cancel).await.unwrap(), None);
        assert_eq!(stream.buffered(), b"rest");
    }

    #[tokio::test]
    async fn test_sniff_method() {
        let cancel = CancellationToken::new();

        let mut connect = BufferedStream::new(&b"CONNECT example.com:443 HTTP/1.1\r\n"[..]);
        assert_eq!(
            sniff_method(&mut connect, "CONNECT", &cancel).await.unwrap(),
            MethodSniff::Matches
        );
        assert_eq!(connect.available(), connect.buffered().len());

        let mut get = BufferedStream::new(&b"GET / HTTP/1.1\r\n"[..]);
        assert_eq!(
            sniff_method(&mut get, "CONNECT", &cancel).await.unwrap(),
            MethodSniff::OtherMethod
        );

        let mut pri = BufferedStream::new(&b"PRI * HTTP/2.0\r\n"[..]);
        assert_eq!(
            sniff_method(&mut pri, "PRI", &cancel).await.unwrap(),
            MethodSniff::Matches
        );

        let mut tls = BufferedStream::new(&b"\x16\x03\x01\x02\x00"[..]);
        assert_eq!(
            sniff_method(&mut tls, "CONNECT", &cancel).await.unwrap(),
            MethodSniff::NotHttp
        );

        let mut short = BufferedStream::new(&b"CON"[..]);
        assert_eq!(
            sniff_method(&mut short, "CONNECT", &cancel).await.unwrap(),
            MethodSniff::NotHttp
        );
    }
}
