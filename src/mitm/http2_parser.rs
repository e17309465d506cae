//! HTTP/2 frame header and SETTINGS parsing
//!
//! Frame Format (RFC 9113 Section 4.1):
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```

use super::error::{MitmError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the fixed frame header
pub const FRAME_HEADER_LEN: usize = 9;

/// Client connection preface (RFC 9113 Section 3.4)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
/// Largest value SETTINGS_MAX_FRAME_SIZE may take
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

/// HTTP/2 frame types (RFC 9113 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::GoAway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }
}

/// HTTP/2 frame flags (RFC 9113 Section 6)
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Decoded 9-byte frame header, reused for every relayed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    /// Wire type byte; extension frame types are kept as-is
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, flags: u8, stream_id: u32, length: u32) -> Self {
        Self {
            length,
            kind: frame_type as u8,
            flags,
            stream_id,
        }
    }

    pub fn parse(data: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([0, data[0], data[1], data[2]]),
            kind: data[3],
            flags: data[4],
            // reserved bit is ignored
            stream_id: u32::from_be_bytes([data[5] & 0x7f, data[6], data[7], data[8]]),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let id = (self.stream_id & 0x7fff_ffff).to_be_bytes();
        [
            len[1], len[2], len[3], self.kind, self.flags, id[0], id[1], id[2], id[3],
        ]
    }

    /// `None` for frame types this relay has no knowledge of
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_u8(self.kind)
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.has(flags::END_STREAM)
    }

    pub fn is_end_headers(&self) -> bool {
        self.has(flags::END_HEADERS)
    }
}

/// Parse a SETTINGS payload into (identifier, value) pairs.
///
/// A length that is not a multiple of 6 is a FRAME_SIZE_ERROR.
pub fn parse_settings(payload: &[u8]) -> Result<Vec<(u16, u32)>> {
    if payload.len() % 6 != 0 {
        return Err(MitmError::protocol(format!(
            "Invalid settings length {}",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(6)
        .map(|entry| {
            (
                u16::from_be_bytes([entry[0], entry[1]]),
                u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]),
            )
        })
        .collect())
}

/// Settings advertised by one peer.
///
/// Written by the loop that sees the peer's SETTINGS frames, read by the
/// loop relaying towards that peer.
#[derive(Debug)]
pub struct Http2Settings {
    header_table_size: AtomicU32,
    max_frame_size: AtomicU32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            header_table_size: AtomicU32::new(DEFAULT_HEADER_TABLE_SIZE),
            max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
        }
    }
}

impl Http2Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.load(Ordering::Acquire)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    pub fn set_header_table_size(&self, size: u32) {
        self.header_table_size.store(size, Ordering::Release);
    }

    pub fn set_max_frame_size(&self, size: u32) -> Result<()> {
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&size) {
            return Err(MitmError::protocol(format!(
                "SETTINGS_MAX_FRAME_SIZE out of range: {}",
                size
            )));
        }
        self.max_frame_size.store(size, Ordering::Release);
        Ok(())
    }

    /// Apply the entries of one SETTINGS frame; unknown identifiers are ignored.
    pub fn apply(&self, entries: &[(u16, u32)]) -> Result<()> {
        for (identifier, value) in entries {
            match *identifier {
                SETTINGS_HEADER_TABLE_SIZE => self.set_header_table_size(*value),
                SETTINGS_MAX_FRAME_SIZE => self.set_max_frame_size(*value)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Helper: Check if a stream id was opened by the client
/// (client-initiated streams have odd stream IDs)
pub fn is_client_stream(stream_id: u32) -> bool {
    stream_id % 2 == 1
}
