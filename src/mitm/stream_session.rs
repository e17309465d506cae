//! Per-stream state shared by the two relay directions
//!
//! A session is created on the first HEADERS frame of a stream and removed
//! on RST_STREAM or when the server side ends the stream. PUSH_PROMISE
//! registers the promised id as an alias of the associated stream's session.

use super::error::Result;
use super::http2_message::{Http2Message, Http2Request, Http2Response};
use super::http2_relay::Http2Exchange;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Relay direction, named after the peer that sends the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn is_client(&self) -> bool {
        matches!(self, Direction::ClientToServer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client",
            Direction::ServerToClient => "server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running before-request/before-response hook; hands the exchange back.
pub(crate) type HookTask = JoinHandle<(Http2Exchange, Result<()>)>;

/// Body bytes collected for a hook that called `read_body`
pub(crate) struct BodyCapture {
    pub(crate) data: BytesMut,
    pub(crate) reply: Option<oneshot::Sender<Bytes>>,
}

impl BodyCapture {
    pub(crate) fn new(reply: oneshot::Sender<Bytes>) -> Self {
        Self {
            data: BytesMut::new(),
            reply: Some(reply),
        }
    }
}

/// What one direction knows about its half of the stream
#[derive(Default)]
pub(crate) struct DirectionState {
    pub(crate) headers_complete: bool,
    /// DATA frames are held back until the hook resolves
    pub(crate) ignore_body_frames: bool,
    pub(crate) capture: Option<BodyCapture>,
    pub(crate) hook: Option<HookTask>,
}

impl DirectionState {
    fn abort_hook(&mut self) {
        if let Some(task) = self.hook.take() {
            task.abort();
        }
        self.capture = None;
    }
}

/// A stream announced by PUSH_PROMISE
#[derive(Debug, Clone)]
pub struct PromisedStream {
    pub stream_id: u32,
    pub request: Http2Request,
    pub response: Option<Http2Response>,
}

/// In-flight request/response pair of one HTTP/2 stream
pub struct StreamSession {
    stream_id: u32,
    pub request: Http2Request,
    pub response: Http2Response,
    pub promised: Vec<PromisedStream>,
    client: DirectionState,
    server: DirectionState,
}

impl StreamSession {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            request: Http2Request::default(),
            response: Http2Response::default(),
            promised: Vec::new(),
            client: DirectionState::default(),
            server: DirectionState::default(),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Whether `stream_id` is a pushed stream aliased to this session
    pub fn is_promised(&self, stream_id: u32) -> bool {
        stream_id != self.stream_id && self.promised.iter().any(|p| p.stream_id == stream_id)
    }

    pub fn promised_mut(&mut self, stream_id: u32) -> Option<&mut PromisedStream> {
        self.promised.iter_mut().find(|p| p.stream_id == stream_id)
    }

    pub fn headers_complete(&self, direction: Direction) -> bool {
        self.state(direction).headers_complete
    }

    /// The message carried by frames travelling in `direction`
    pub fn message(&self, direction: Direction) -> &dyn Http2Message {
        match direction {
            Direction::ClientToServer => &self.request,
            Direction::ServerToClient => &self.response,
        }
    }

    pub fn message_mut(&mut self, direction: Direction) -> &mut dyn Http2Message {
        match direction {
            Direction::ClientToServer => &mut self.request,
            Direction::ServerToClient => &mut self.response,
        }
    }

    pub(crate) fn state(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::ClientToServer => &self.client,
            Direction::ServerToClient => &self.server,
        }
    }

    pub(crate) fn state_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::ClientToServer => &mut self.client,
            Direction::ServerToClient => &mut self.server,
        }
    }

    /// Copy what a hook left in its exchange back into the session.
    pub(crate) fn absorb(&mut self, exchange: Http2Exchange) {
        let (request, response) = exchange.into_messages();
        self.request = request;
        if let Some(response) = response {
            self.response = response;
        }
    }

    pub(crate) fn abort_hooks(&mut self) {
        self.client.abort_hook();
        self.server.abort_hook();
    }
}

pub type SharedSession = Arc<Mutex<StreamSession>>;

/// Stream id → session map shared by both relay loops.
///
/// Never hold a session lock while calling into the table.
#[derive(Clone, Default)]
pub struct StreamSessionTable {
    sessions: Arc<Mutex<HashMap<u32, SharedSession>>>,
}

impl StreamSessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, stream_id: u32) -> Option<SharedSession> {
        self.sessions.lock().await.get(&stream_id).cloned()
    }

    pub async fn get_or_create(&self, stream_id: u32) -> SharedSession {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(stream_id)
                .or_insert_with(|| Arc::new(Mutex::new(StreamSession::new(stream_id)))),
        )
    }

    /// Register `promised_id` as another key for `session`.
    pub async fn alias(&self, promised_id: u32, session: SharedSession) {
        self.sessions.lock().await.insert(promised_id, session);
    }

    /// Remove one key. Hooks are aborted only when the stream that owns the
    /// session goes away, not when one of its aliases does.
    pub async fn remove(&self, stream_id: u32) -> Option<SharedSession> {
        let removed = self.sessions.lock().await.remove(&stream_id)?;
        {
            let mut session = removed.lock().await;
            if session.stream_id() == stream_id {
                session.abort_hooks();
            }
        }
        Some(removed)
    }

    pub async fn contains(&self, stream_id: u32) -> bool {
        self.sessions.lock().await.contains_key(&stream_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Drop every session, cancelling any hook still running.
    pub async fn clear(&self) {
        let drained: Vec<SharedSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.lock().await.abort_hooks();
        }
    }
}
