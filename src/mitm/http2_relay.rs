//! HTTP/2 frame relay
//!
//! Two loops, one per direction, copy frames between the client and the
//! upstream. Header blocks are decoded into `Http2Request`/`Http2Response`,
//! run through the request/response hooks and re-encoded; all other frames
//! are forwarded byte for byte.
//!
//! A header block that cannot be decoded resets its stream: RST_STREAM goes
//! back to the sender and, when it already knows the stream, on to the
//! receiver. Later frames on a reset stream are dropped.
//!
//! Settings are tracked per advertising peer. A loop sizes its HPACK decoder
//! and its frame-size limit from the settings of the peer it writes to,
//! since that is what the sending peer's encoder honours.

use super::error::{MitmError, Result, H2_CANCEL, H2_COMPRESSION_ERROR, H2_PROTOCOL_ERROR};
use super::hooks::ProxyHandlers;
use super::hpack_codec::{encode_header_block, HeaderBlockDecoder, HeaderFields};
use super::http2_message::{
    decode_body, encode_trailers, is_supported_encoding, parse_status, HeaderList, Http2Message,
    Http2Request, Http2Response, StreamPriority,
};
use super::http2_parser::{flags, parse_settings, FrameHeader, FrameType, Http2Settings, FRAME_HEADER_LEN};
use super::stream_session::{
    BodyCapture, Direction, HookTask, PromisedStream, SharedSession, StreamSessionTable,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type BodyRequest = oneshot::Sender<oneshot::Sender<Bytes>>;

/// One stream's request (and response, on the server side) as seen by a hook.
pub struct Http2Exchange {
    stream_id: u32,
    direction: Direction,
    connect_host: Option<String>,
    pub request: Http2Request,
    /// Present for response hooks
    pub response: Option<Http2Response>,
    body_request: Option<BodyRequest>,
}

impl Http2Exchange {
    pub fn new(
        stream_id: u32,
        direction: Direction,
        connect_host: Option<String>,
        request: Http2Request,
        response: Option<Http2Response>,
    ) -> Self {
        Self {
            stream_id,
            direction,
            connect_host,
            request,
            response,
            body_request: None,
        }
    }

    fn with_body_request(mut self, body_request: BodyRequest) -> Self {
        self.body_request = Some(body_request);
        self
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_response(&self) -> bool {
        !self.direction.is_client()
    }

    /// Host from the CONNECT request the tunnel was opened with
    pub fn connect_host(&self) -> Option<&str> {
        self.connect_host.as_deref()
    }

    /// The message whose headers just completed
    pub fn message(&self) -> &dyn Http2Message {
        match (self.direction, self.response.as_ref()) {
            (Direction::ServerToClient, Some(response)) => response,
            _ => &self.request,
        }
    }

    pub fn message_mut(&mut self) -> &mut dyn Http2Message {
        match (self.direction, self.response.as_mut()) {
            (Direction::ServerToClient, Some(response)) => response,
            _ => &mut self.request,
        }
    }

    /// Wait for the complete body of the current message.
    ///
    /// The relay holds the stream's DATA frames back from then on and
    /// re-sends the (possibly modified) message once the hook returns.
    pub async fn read_body(&mut self) -> Result<Bytes> {
        if let Some(body) = self.message().body() {
            return Ok(body.clone());
        }

        let request = self
            .body_request
            .take()
            .ok_or_else(|| MitmError::Hook("body is not available for this message".to_string()))?;
        let (reply, body) = oneshot::channel();
        request
            .send(reply)
            .map_err(|_| MitmError::Hook("relay no longer accepts body requests".to_string()))?;
        let body = body
            .await
            .map_err(|_| MitmError::Hook("stream closed before its body completed".to_string()))?;

        self.message_mut().set_body(Some(body.clone()));
        Ok(body)
    }

    pub(crate) fn into_messages(self) -> (Http2Request, Option<Http2Response>) {
        (self.request, self.response)
    }
}

/// Relays one HTTP/2 connection between a client and an upstream server.
pub struct Http2FrameRelay {
    handlers: ProxyHandlers,
    sessions: StreamSessionTable,
    client_settings: Http2Settings,
    server_settings: Http2Settings,
    connect_host: Option<String>,
}

impl Http2FrameRelay {
    pub fn new(handlers: ProxyHandlers) -> Self {
        Self {
            handlers,
            sessions: StreamSessionTable::new(),
            client_settings: Http2Settings::new(),
            server_settings: Http2Settings::new(),
            connect_host: None,
        }
    }

    pub fn with_connect_host(mut self, host: impl Into<String>) -> Self {
        self.connect_host = Some(host.into());
        self
    }

    /// Handle to the live session table
    pub fn sessions(&self) -> StreamSessionTable {
        self.sessions.clone()
    }

    /// Settings the client advertised
    pub fn client_settings(&self) -> &Http2Settings {
        &self.client_settings
    }

    /// Settings the server advertised
    pub fn server_settings(&self) -> &Http2Settings {
        &self.server_settings
    }

    /// Relay frames until either side closes, a fatal error occurs or
    /// `cancel` fires. The first loop to stop cancels the other.
    ///
    /// The connection preface must already have been exchanged.
    pub async fn run<C, S>(&self, client: C, server: S, cancel: &CancellationToken) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cancel = cancel.child_token();
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        // both loops write to both peers (RST_STREAM goes back to the sender)
        let client_write = Mutex::new(client_write);
        let server_write = Mutex::new(server_write);

        let upstream = DirectionLoop::new(self, Direction::ClientToServer, &cancel).run(
            client_read,
            &server_write,
            &client_write,
        );
        let downstream = DirectionLoop::new(self, Direction::ServerToClient, &cancel).run(
            server_read,
            &client_write,
            &server_write,
        );
        tokio::pin!(upstream, downstream);

        let result = tokio::select! {
            first = &mut upstream => {
                cancel.cancel();
                let second = downstream.await;
                first.and(second)
            }
            first = &mut downstream => {
                cancel.cancel();
                let second = upstream.await;
                first.and(second)
            }
        };

        self.sessions.clear().await;
        debug!(host = ?self.connect_host, ok = result.is_ok(), "HTTP/2 relay finished");
        result
    }
}

struct DirectionLoop<'a> {
    relay: &'a Http2FrameRelay,
    direction: Direction,
    decoder: HeaderBlockDecoder,
    cancel: &'a CancellationToken,
    /// Frames for the peer this loop reads from
    back: BytesMut,
    /// Streams reset by the relay; their frames are no longer forwarded
    reset: HashSet<u32>,
}

impl<'a> DirectionLoop<'a> {
    fn new(relay: &'a Http2FrameRelay, direction: Direction, cancel: &'a CancellationToken) -> Self {
        let mut this = Self {
            relay,
            direction,
            decoder: HeaderBlockDecoder::default(),
            cancel,
            back: BytesMut::new(),
            reset: HashSet::new(),
        };
        this.decoder = HeaderBlockDecoder::new(this.receiver_settings().header_table_size());
        this
    }

    /// Settings of the peer this loop reads from
    fn sender_settings(&self) -> &'a Http2Settings {
        match self.direction {
            Direction::ClientToServer => &self.relay.client_settings,
            Direction::ServerToClient => &self.relay.server_settings,
        }
    }

    /// Settings of the peer this loop writes to
    fn receiver_settings(&self) -> &'a Http2Settings {
        match self.direction {
            Direction::ClientToServer => &self.relay.server_settings,
            Direction::ServerToClient => &self.relay.client_settings,
        }
    }

    fn tap(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        match self.direction {
            Direction::ClientToServer => self.relay.handlers.data_tap.on_data_sent(data),
            Direction::ServerToClient => self.relay.handlers.data_tap.on_data_received(data),
        }
    }

    async fn run<R, W, B>(mut self, mut reader: R, writer: &Mutex<W>, sender: &Mutex<B>) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        B: AsyncWrite + Unpin,
    {
        let mut head = [0u8; FRAME_HEADER_LEN];
        let mut payload = Vec::new();

        loop {
            let read = read_full(&mut reader, &mut head, self.cancel).await?;
            self.tap(&head[..read]);
            if read < FRAME_HEADER_LEN {
                return Ok(());
            }

            let header = FrameHeader::parse(&head);
            let limit = self.receiver_settings().max_frame_size();
            if header.length > limit {
                return Err(MitmError::protocol(format!(
                    "FRAME_SIZE_ERROR: {} sent a {} byte frame, limit is {}",
                    self.direction, header.length, limit
                )));
            }

            payload.resize(header.length as usize, 0);
            let read = read_full(&mut reader, &mut payload, self.cancel).await?;
            self.tap(&payload[..read]);
            if read < payload.len() {
                return Ok(());
            }

            let mut out = BytesMut::new();
            self.handle_frame(header, &payload, &mut out).await?;

            if !out.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    written = write_locked(writer, &out) => written?,
                }
            }
            if !self.back.is_empty() {
                let back = self.back.split();
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    written = write_locked(sender, &back) => written?,
                }
            }

            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn handle_frame(
        &mut self,
        header: FrameHeader,
        payload: &[u8],
        out: &mut BytesMut,
    ) -> Result<()> {
        trace!(
            direction = %self.direction,
            stream_id = header.stream_id,
            kind = header.kind,
            flags = header.flags,
            length = header.length,
            "Frame"
        );

        if header.stream_id != 0 && self.reset.contains(&header.stream_id) {
            trace!(direction = %self.direction, stream_id = header.stream_id, "Frame on reset stream dropped");
            return Ok(());
        }

        let frame_type = header.frame_type();
        match frame_type {
            Some(FrameType::Data) => self.on_data(header, payload, out).await?,
            Some(FrameType::Headers) | Some(FrameType::PushPromise) => {
                self.on_headers(header, payload, out).await?
            }
            Some(FrameType::Continuation) => {
                return Err(MitmError::Unsupported(format!(
                    "CONTINUATION frame on stream {}",
                    header.stream_id
                )))
            }
            Some(FrameType::Settings) => {
                self.on_settings(header, payload)?;
                forward(out, &header, payload);
            }
            Some(FrameType::RstStream) => {
                self.on_rst_stream(header, payload).await?;
                forward(out, &header, payload);
            }
            Some(FrameType::Priority)
            | Some(FrameType::Ping)
            | Some(FrameType::GoAway)
            | Some(FrameType::WindowUpdate)
            | None => forward(out, &header, payload),
        }

        if !self.direction.is_client()
            && header.is_end_stream()
            && matches!(frame_type, Some(FrameType::Data) | Some(FrameType::Headers))
        {
            self.relay.sessions.remove(header.stream_id).await;
        }

        Ok(())
    }

    fn on_settings(&self, header: FrameHeader, payload: &[u8]) -> Result<()> {
        if header.stream_id != 0 {
            return Err(MitmError::protocol(format!(
                "SETTINGS frame on stream {}",
                header.stream_id
            )));
        }

        let entries = parse_settings(payload)?;
        let settings = self.sender_settings();
        settings.apply(&entries)?;
        debug!(
            direction = %self.direction,
            header_table_size = settings.header_table_size(),
            max_frame_size = settings.max_frame_size(),
            "SETTINGS"
        );
        Ok(())
    }

    async fn on_rst_stream(&self, header: FrameHeader, payload: &[u8]) -> Result<()> {
        let code = payload
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| MitmError::protocol("RST_STREAM payload must be 4 bytes"))?;

        if header.stream_id == 0 {
            return Err(MitmError::Http2ConnectionError { code });
        }

        self.relay.sessions.remove(header.stream_id).await;
        if code != H2_CANCEL {
            self.relay.handlers.report(&MitmError::Http2StreamError {
                stream_id: header.stream_id,
                code,
            });
        }
        Ok(())
    }

    async fn on_data(&self, header: FrameHeader, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        let Some(session) = self.relay.sessions.get(header.stream_id).await else {
            forward(out, &header, payload);
            return Ok(());
        };

        let finish = {
            let mut guard = session.lock().await;
            if guard.is_promised(header.stream_id) {
                forward(out, &header, payload);
                return Ok(());
            }

            let state = guard.state_mut(self.direction);
            if let Some(capture) = state.capture.as_mut() {
                capture
                    .data
                    .extend_from_slice(strip_padding(&header, payload)?);
            }
            if !state.ignore_body_frames {
                forward(out, &header, payload);
            }
            header.is_end_stream() && state.capture.is_some()
        };

        if finish {
            self.finish_body(header.stream_id, &session, out).await?;
        }
        Ok(())
    }

    async fn on_headers(&mut self, header: FrameHeader, payload: &[u8], out: &mut BytesMut) -> Result<()> {
        let stream_id = header.stream_id;
        let is_push = header.frame_type() == Some(FrameType::PushPromise);

        if is_push && self.direction.is_client() {
            return Err(MitmError::protocol("PUSH_PROMISE received from the client"));
        }
        if !header.is_end_headers() {
            return Err(MitmError::Unsupported(format!(
                "header block on stream {} continues in CONTINUATION frames",
                stream_id
            )));
        }

        let mut block = strip_padding(&header, payload)?;
        let mut promised_id = None;
        let mut priority = None;
        if is_push {
            let id = block
                .get(..4)
                .map(|b| u32::from_be_bytes([b[0] & 0x7f, b[1], b[2], b[3]]))
                .ok_or_else(|| MitmError::protocol("PUSH_PROMISE without promised stream id"))?;
            promised_id = Some(id);
            block = &block[4..];
        } else if header.has(flags::PRIORITY) {
            priority = Some(
                StreamPriority::parse(block)
                    .ok_or_else(|| MitmError::protocol("HEADERS priority block truncated"))?,
            );
            block = &block[StreamPriority::LEN..];
        }

        let Some(fields) = self.decode_block(stream_id, block, out).await else {
            if let Some(promised_id) = promised_id {
                self.reset_stream(promised_id, H2_COMPRESSION_ERROR, false, out);
            }
            return Ok(());
        };

        if let Some(promised_id) = promised_id {
            return self.on_push_promise(stream_id, promised_id, fields, out).await;
        }

        let session = self.relay.sessions.get_or_create(stream_id).await;
        let max_frame_size = self.receiver_settings().max_frame_size();
        let mut guard = session.lock().await;

        if guard.is_promised(stream_id) {
            let mut response = Http2Response::default();
            if let Err(e) = response.apply_fields(fields) {
                drop(guard);
                self.abandon(stream_id, MitmError::hpack(stream_id, e.to_string()), H2_PROTOCOL_ERROR, out)
                    .await;
                return Ok(());
            }
            response.priority = priority;
            let prefix = priority_prefix(priority);
            write_header_block(
                out,
                FrameType::Headers,
                stream_id,
                &prefix,
                &response.encode_headers(),
                header.is_end_stream(),
                max_frame_size,
            );
            if let Some(promised) = guard.promised_mut(stream_id) {
                promised.response = Some(response);
            }
            return Ok(());
        }

        if !self.direction.is_client() && !guard.headers_complete(self.direction) {
            if let Some(status) = interim_status(&fields) {
                drop(guard);
                // informational responses pass through; the final one follows
                let block = encode_header_block(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())));
                write_header_block(
                    out,
                    FrameType::Headers,
                    stream_id,
                    &priority_prefix(priority),
                    &block,
                    header.is_end_stream(),
                    max_frame_size,
                );
                debug!(stream_id, status, "Interim response");
                return Ok(());
            }
        }

        if guard.headers_complete(self.direction) {
            let trailers = match HeaderList::from_fields(fields) {
                Ok(trailers) => trailers,
                Err(e) => {
                    drop(guard);
                    self.abandon(stream_id, MitmError::hpack(stream_id, e.to_string()), H2_PROTOCOL_ERROR, out)
                        .await;
                    return Ok(());
                }
            };

            if guard.state(self.direction).ignore_body_frames {
                *guard.message_mut(self.direction).trailers_mut() = Some(trailers);
                let finish =
                    header.is_end_stream() && guard.state(self.direction).capture.is_some();
                drop(guard);
                if finish {
                    self.finish_body(stream_id, &session, out).await?;
                }
            } else {
                write_header_block(
                    out,
                    FrameType::Headers,
                    stream_id,
                    &[],
                    &encode_trailers(&trailers),
                    header.is_end_stream(),
                    max_frame_size,
                );
                *guard.message_mut(self.direction).trailers_mut() = Some(trailers);
            }
            return Ok(());
        }

        let message = guard.message_mut(self.direction);
        match message.apply_fields(fields) {
            Ok(ignored) if !ignored.is_empty() => {
                debug!(stream_id, ignored = ?ignored, "Unrecognised pseudo-headers dropped")
            }
            Ok(_) => {}
            Err(e) => {
                drop(guard);
                self.abandon(stream_id, MitmError::hpack(stream_id, e.to_string()), H2_PROTOCOL_ERROR, out)
                    .await;
                return Ok(());
            }
        }
        message.set_priority(priority);
        guard.state_mut(self.direction).headers_complete = true;
        drop(guard);

        debug!(stream_id, direction = %self.direction, "Header block complete");
        self.on_headers_complete(stream_id, &session, header.is_end_stream(), out)
            .await
    }

    async fn on_push_promise(
        &mut self,
        stream_id: u32,
        promised_id: u32,
        fields: HeaderFields,
        out: &mut BytesMut,
    ) -> Result<()> {
        let mut request = Http2Request::default();
        if let Err(e) = request.apply_fields(fields) {
            self.abandon(stream_id, MitmError::hpack(stream_id, e.to_string()), H2_PROTOCOL_ERROR, out)
                .await;
            self.reset_stream(promised_id, H2_PROTOCOL_ERROR, false, out);
            return Ok(());
        }

        write_header_block(
            out,
            FrameType::PushPromise,
            stream_id,
            &promised_id.to_be_bytes(),
            &request.encode_headers(),
            false,
            self.receiver_settings().max_frame_size(),
        );

        debug!(stream_id, promised_id, url = %request.url(), "PUSH_PROMISE");
        let session = self.relay.sessions.get_or_create(stream_id).await;
        session.lock().await.promised.push(PromisedStream {
            stream_id: promised_id,
            request,
            response: None,
        });
        self.relay.sessions.alias(promised_id, session).await;
        Ok(())
    }

    /// Decode with the decoder sized for the receiving peer. A failure resets
    /// the stream and starts the decoder over.
    async fn decode_block(&mut self, stream_id: u32, block: &[u8], out: &mut BytesMut) -> Option<HeaderFields> {
        let advertised = self.receiver_settings().header_table_size();
        if self.decoder.sync_table_size(advertised) {
            debug!(direction = %self.direction, table_size = advertised, "HPACK decoder resized");
        }

        match self.decoder.decode(block) {
            Ok(fields) => Some(fields),
            Err(e) => {
                self.decoder.reset();
                self.abandon(stream_id, MitmError::hpack(stream_id, e), H2_COMPRESSION_ERROR, out)
                    .await;
                None
            }
        }
    }

    /// Report `error`, drop the stream's session and reset the stream.
    async fn abandon(&mut self, stream_id: u32, error: MitmError, code: u32, out: &mut BytesMut) {
        self.relay.handlers.report(&error);
        let receiver_knows = match self.direction {
            // the client opened the stream
            Direction::ServerToClient => true,
            Direction::ClientToServer => match self.relay.sessions.get(stream_id).await {
                Some(session) => session.lock().await.headers_complete(Direction::ClientToServer),
                None => false,
            },
        };
        self.relay.sessions.remove(stream_id).await;
        self.reset_stream(stream_id, code, receiver_knows, out);
    }

    /// Queue RST_STREAM for the sender and, if `receiver_knows`, the receiver.
    fn reset_stream(&mut self, stream_id: u32, code: u32, receiver_knows: bool, out: &mut BytesMut) {
        if receiver_knows {
            put_rst_stream(out, stream_id, code);
        }
        put_rst_stream(&mut self.back, stream_id, code);
        self.reset.insert(stream_id);
        debug!(direction = %self.direction, stream_id, code, receiver_knows, "Stream reset");
    }

    async fn on_headers_complete(
        &self,
        stream_id: u32,
        session: &SharedSession,
        end_stream: bool,
        out: &mut BytesMut,
    ) -> Result<()> {
        let (body_request, mut body_requests) = oneshot::channel();
        let Some(mut task) = self.spawn_hook(stream_id, session, body_request).await else {
            self.emit_headers(stream_id, session, end_stream, out).await;
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => task.abort(),
            finished = &mut task => {
                self.absorb_hook(session, finished).await;
                self.emit_headers(stream_id, session, end_stream, out).await;
            }
            Ok(reply) = &mut body_requests => {
                {
                    let mut guard = session.lock().await;
                    let state = guard.state_mut(self.direction);
                    state.ignore_body_frames = true;
                    state.capture = Some(BodyCapture::new(reply));
                    state.hook = Some(task);
                }
                if end_stream {
                    self.finish_body(stream_id, session, out).await?;
                }
            }
        }
        Ok(())
    }

    async fn spawn_hook(
        &self,
        stream_id: u32,
        session: &SharedSession,
        body_request: BodyRequest,
    ) -> Option<HookTask> {
        let handlers = &self.relay.handlers;
        let request_hook = handlers.request.clone();
        let response_hook = handlers.response.clone();
        match self.direction {
            Direction::ClientToServer if request_hook.is_none() => return None,
            Direction::ServerToClient if response_hook.is_none() => return None,
            _ => {}
        }

        let exchange = {
            let guard = session.lock().await;
            Http2Exchange::new(
                stream_id,
                self.direction,
                self.relay.connect_host.clone(),
                guard.request.clone(),
                (!self.direction.is_client()).then(|| guard.response.clone()),
            )
            .with_body_request(body_request)
        };

        let task = match (request_hook, response_hook) {
            (Some(hook), _) if self.direction.is_client() => tokio::spawn(async move {
                let mut exchange = exchange;
                let result = hook.before_request(&mut exchange).await;
                (exchange, result)
            }),
            (_, Some(hook)) => tokio::spawn(async move {
                let mut exchange = exchange;
                let result = hook.before_response(&mut exchange).await;
                (exchange, result)
            }),
            _ => return None,
        };
        Some(task)
    }

    async fn absorb_hook(
        &self,
        session: &SharedSession,
        finished: std::result::Result<(Http2Exchange, Result<()>), JoinError>,
    ) {
        match finished {
            Ok((exchange, outcome)) => {
                if let Err(e) = outcome {
                    self.relay.handlers.report(&e);
                }
                session.lock().await.absorb(exchange);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => self
                .relay
                .handlers
                .report(&MitmError::Hook(format!("hook task failed: {}", e))),
        }
    }

    async fn emit_headers(
        &self,
        stream_id: u32,
        session: &SharedSession,
        end_stream: bool,
        out: &mut BytesMut,
    ) {
        let guard = session.lock().await;
        let message = guard.message(self.direction);
        write_header_block(
            out,
            FrameType::Headers,
            stream_id,
            &priority_prefix(message.priority()),
            &message.encode_headers(),
            end_stream,
            self.receiver_settings().max_frame_size(),
        );
    }

    /// Deliver the captured body to the hook, wait for it, then send the
    /// message again as HEADERS + DATA (+ trailers).
    async fn finish_body(
        &self,
        stream_id: u32,
        session: &SharedSession,
        out: &mut BytesMut,
    ) -> Result<()> {
        let (capture, task) = {
            let mut guard = session.lock().await;
            let state = guard.state_mut(self.direction);
            (state.capture.take(), state.hook.take())
        };
        let Some(mut capture) = capture else {
            return Ok(());
        };

        let raw = capture.data.split().freeze();
        let encoding = session
            .lock()
            .await
            .message(self.direction)
            .content_encoding()
            .map(str::to_owned);
        let (body, recompress) = match encoding.as_deref() {
            Some(encoding) if is_supported_encoding(encoding) => match decode_body(encoding, &raw) {
                Ok(decoded) => (Bytes::from(decoded), true),
                Err(e) => {
                    self.relay.handlers.report(&e);
                    (raw, false)
                }
            },
            Some(encoding) => {
                debug!(stream_id, encoding, "Body left encoded");
                (raw, false)
            }
            None => (raw, false),
        };

        session
            .lock()
            .await
            .message_mut(self.direction)
            .set_body(Some(body.clone()));
        if let Some(reply) = capture.reply.take() {
            // the hook may have stopped waiting
            let _ = reply.send(body);
        }

        if let Some(mut task) = task {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    task.abort();
                    return Ok(());
                }
                finished = &mut task => self.absorb_hook(session, finished).await,
            }
        }

        let max_frame_size = self.receiver_settings().max_frame_size();
        let (prefix, block, wire, trailers) = {
            let mut guard = session.lock().await;
            let message = guard.message_mut(self.direction);
            let wire = match message.prepare_body(recompress) {
                Ok(wire) => wire,
                Err(e) => {
                    self.relay.handlers.report(&e);
                    message.headers_mut().remove("content-encoding");
                    message.prepare_body(false)?
                }
            };
            (
                priority_prefix(message.priority()),
                message.encode_headers(),
                wire,
                message.trailers().cloned(),
            )
        };

        write_header_block(
            out,
            FrameType::Headers,
            stream_id,
            &prefix,
            &block,
            wire.is_empty() && trailers.is_none(),
            max_frame_size,
        );

        let mut chunks = wire.chunks(max_frame_size as usize).peekable();
        while let Some(chunk) = chunks.next() {
            let last = chunks.peek().is_none();
            let frame_flags = if last && trailers.is_none() {
                flags::END_STREAM
            } else {
                0
            };
            put_frame_header(
                out,
                FrameHeader::new(FrameType::Data, frame_flags, stream_id, chunk.len() as u32),
            );
            out.extend_from_slice(chunk);
        }

        if let Some(trailers) = trailers {
            write_header_block(
                out,
                FrameType::Headers,
                stream_id,
                &[],
                &encode_trailers(&trailers),
                true,
                max_frame_size,
            );
        }

        debug!(stream_id, direction = %self.direction, body_len = wire.len(), "Body relayed");
        Ok(())
    }
}

/// `:status` of an informational (1xx) response head
fn interim_status(fields: &HeaderFields) -> Option<u16> {
    let (_, value) = fields.iter().find(|(name, _)| name.as_slice() == b":status")?;
    let status = parse_status(std::str::from_utf8(value).ok()?).ok()?;
    (100..200).contains(&status).then_some(status)
}

fn priority_prefix(priority: Option<StreamPriority>) -> Vec<u8> {
    priority.map(|p| p.encode().to_vec()).unwrap_or_default()
}

fn put_frame_header(out: &mut BytesMut, header: FrameHeader) {
    out.put_slice(&header.encode());
}

fn put_rst_stream(out: &mut BytesMut, stream_id: u32, code: u32) {
    put_frame_header(out, FrameHeader::new(FrameType::RstStream, 0, stream_id, 4));
    out.put_u32(code);
}

fn forward(out: &mut BytesMut, header: &FrameHeader, payload: &[u8]) {
    out.put_slice(&header.encode());
    out.put_slice(payload);
}

/// Payload of a PADDED frame without the pad length byte and the padding.
fn strip_padding<'p>(header: &FrameHeader, payload: &'p [u8]) -> Result<&'p [u8]> {
    if !header.has(flags::PADDED) {
        return Ok(payload);
    }

    let (&pad, rest) = payload
        .split_first()
        .ok_or_else(|| MitmError::protocol("PADDED frame without pad length"))?;
    let pad = pad as usize;
    if pad > rest.len() {
        return Err(MitmError::protocol("padding exceeds frame payload"));
    }
    Ok(&rest[..rest.len() - pad])
}

/// Write a header block as one HEADERS/PUSH_PROMISE frame followed by
/// CONTINUATION frames when it does not fit `max_frame_size`. `prefix` is
/// the priority block (HEADERS) or the promised stream id (PUSH_PROMISE).
fn write_header_block(
    out: &mut BytesMut,
    kind: FrameType,
    stream_id: u32,
    prefix: &[u8],
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let first_len = block.len().min(max.saturating_sub(prefix.len()));
    let (first, mut rest) = block.split_at(first_len);

    let mut frame_flags = 0;
    if end_stream && kind == FrameType::Headers {
        frame_flags |= flags::END_STREAM;
    }
    if kind == FrameType::Headers && !prefix.is_empty() {
        frame_flags |= flags::PRIORITY;
    }
    if rest.is_empty() {
        frame_flags |= flags::END_HEADERS;
    }

    put_frame_header(
        out,
        FrameHeader::new(kind, frame_flags, stream_id, (prefix.len() + first.len()) as u32),
    );
    out.put_slice(prefix);
    out.put_slice(first);

    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(max));
        rest = tail;
        let continuation_flags = if rest.is_empty() { flags::END_HEADERS } else { 0 };
        put_frame_header(
            out,
            FrameHeader::new(FrameType::Continuation, continuation_flags, stream_id, chunk.len() as u32),
        );
        out.put_slice(chunk);
    }
}

/// Fill `buf` unless the stream ends or `cancel` fires; returns bytes read.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf[filled..]) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => filled += n,
            // TLS peers that close without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

async fn write_locked<W: AsyncWrite + Unpin>(writer: &Mutex<W>, data: &[u8]) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}
