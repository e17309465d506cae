//! HPACK header block codec for the frame relay
//!
//! Decoding goes through `hpack::Decoder`, one per relay direction, sized to
//! the header table the receiving peer advertised. Encoding never touches a
//! dynamic table: every field is written as a literal without indexing, so a
//! re-encoded block is valid whatever table size either peer negotiated.

use super::http2_parser::DEFAULT_HEADER_TABLE_SIZE;
use hpack::Decoder as HpackDecoder;
use std::panic::{self, AssertUnwindSafe};

/// A decoded header field list in wire order
pub type HeaderFields = Vec<(Vec<u8>, Vec<u8>)>;

/// Per-direction HPACK decoder that tracks the advertised table size.
pub struct HeaderBlockDecoder {
    decoder: HpackDecoder<'static>,
    table_size: u32,
}

impl Default for HeaderBlockDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE)
    }
}

impl HeaderBlockDecoder {
    pub fn new(table_size: u32) -> Self {
        let mut decoder = HpackDecoder::new();
        decoder.set_max_table_size(table_size as usize);
        Self {
            decoder,
            table_size,
        }
    }

    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    /// Recreate the decoder if `advertised` is larger than the size it was
    /// built for. Returns whether a new decoder was created.
    pub fn sync_table_size(&mut self, advertised: u32) -> bool {
        if advertised > self.table_size {
            *self = Self::new(advertised);
            true
        } else {
            false
        }
    }

    /// Start over with an empty dynamic table (after a failed block).
    pub fn reset(&mut self) {
        *self = Self::new(self.table_size);
    }

    /// Decode one complete header block.
    ///
    /// The block's representations are checked first: a truncated field or
    /// a dynamic table size update that is misplaced or larger than the
    /// advertised table size fails here instead of inside `hpack`.
    pub fn decode(&mut self, block: &[u8]) -> Result<HeaderFields, String> {
        check_block(block, self.table_size)?;
        // hpack 0.3 still unwraps internally on some malformed input
        match panic::catch_unwind(AssertUnwindSafe(|| self.decoder.decode(block))) {
            Ok(decoded) => decoded.map_err(|e| format!("{:?}", e)),
            Err(_) => Err("malformed header block".to_string()),
        }
    }
}

/// Walk the representations of a header block (RFC 7541 6) without
/// decoding them.
fn check_block(block: &[u8], table_size: u32) -> Result<(), String> {
    let mut pos = 0;
    let mut seen_field = false;
    while let Some(&first) = block.get(pos) {
        if first & 0x80 != 0 {
            // indexed field
            pos = read_integer(block, pos, 7)?.1;
            seen_field = true;
        } else if first & 0xc0 == 0x40 {
            // literal with incremental indexing
            pos = read_literal(block, pos, 6)?;
            seen_field = true;
        } else if first & 0xe0 == 0x20 {
            let (size, next) = read_integer(block, pos, 5)?;
            if seen_field {
                return Err("dynamic table size update after a header field".to_string());
            }
            if size > table_size as usize {
                return Err(format!(
                    "dynamic table size update to {} exceeds the advertised {}",
                    size, table_size
                ));
            }
            pos = next;
        } else {
            // literal without indexing / never indexed
            pos = read_literal(block, pos, 4)?;
            seen_field = true;
        }
    }
    Ok(())
}

/// Skip a literal field: the name index (or a literal name) then the value.
fn read_literal(block: &[u8], pos: usize, prefix_bits: u8) -> Result<usize, String> {
    let (index, mut pos) = read_integer(block, pos, prefix_bits)?;
    if index == 0 {
        pos = skip_string(block, pos)?;
    }
    skip_string(block, pos)
}

fn skip_string(block: &[u8], pos: usize) -> Result<usize, String> {
    let (length, start) = read_integer(block, pos, 7)?;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= block.len())
        .ok_or_else(|| format!("string literal of {} bytes runs past the block", length))?;
    Ok(end)
}

/// RFC 7541 5.1 prefixed integer at `pos`; returns the value and the
/// position after it.
fn read_integer(block: &[u8], pos: usize, prefix_bits: u8) -> Result<(usize, usize), String> {
    let truncated = || "truncated integer".to_string();
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *block.get(pos).ok_or_else(truncated)?;
    let mut value = first as usize & max_prefix;
    let mut pos = pos + 1;
    if value < max_prefix {
        return Ok((value, pos));
    }

    let mut shift = 0u32;
    loop {
        let byte = *block.get(pos).ok_or_else(truncated)?;
        pos += 1;
        if shift > 28 {
            return Err("integer overflows 32 bits".to_string());
        }
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, pos));
        }
    }
}

/// Encode a header list as a self-contained block.
pub fn encode_header_block<'a, I>(fields: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut out = Vec::new();
    for (name, value) in fields {
        // literal header field without indexing, new name (RFC 7541 6.2.2)
        out.push(0x00);
        encode_string(&mut out, name);
        encode_string(&mut out, value);
    }
    out
}

fn encode_string(out: &mut Vec<u8>, value: &[u8]) {
    // H bit clear: raw octets
    encode_integer(out, value.len(), 7, 0x00);
    out.extend_from_slice(value);
}

/// RFC 7541 5.1 prefixed integer
fn encode_integer(out: &mut Vec<u8>, value: usize, prefix_bits: u8, first_byte: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.push(first_byte | value as u8);
        return;
    }

    out.push(first_byte | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        out.push((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.push(rest as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_fields() -> Vec<(&'static [u8], &'static [u8])> {
        vec![
            (&b":method"[..], &b"POST"[..]),
            (&b":scheme"[..], &b"https"[..]),
            (&b":authority"[..], &b"example.com"[..]),
            (&b":path"[..], &b"/upload?x=1"[..]),
            (&b"content-type"[..], &b"application/json"[..]),
            (&b"x-trace"[..], &b"abc"[..]),
        ]
    }

    #[test]
    fn test_integer_encoding() {
        let mut out = Vec::new();
        encode_integer(&mut out, 10, 5, 0);
        assert_eq!(out, [10]);

        // RFC 7541 C.1.2: 1337 with a 5-bit prefix
        let mut out = Vec::new();
        encode_integer(&mut out, 1337, 5, 0);
        assert_eq!(out, [31, 154, 10]);
    }

    #[test]
    fn test_round_trip_below_and_above_default_table_size() {
        for table_size in [256u32, 4096, 65536] {
            let block = encode_header_block(request_fields());
            let mut decoder = HeaderBlockDecoder::new(table_size);
            let decoded = decoder.decode(&block).unwrap();
            let expected: Vec<(Vec<u8>, Vec<u8>)> = request_fields()
                .into_iter()
                .map(|(n, v)| (n.to_vec(), v.to_vec()))
                .collect();
            assert_eq!(decoded, expected, "table size {}", table_size);
        }
    }

    #[test]
    fn test_long_values_use_multi_byte_lengths() {
        let long = vec![b'a'; 300];
        let block = encode_header_block(vec![(&b"x-long"[..], &long[..])]);
        let decoded = HeaderBlockDecoder::default().decode(&block).unwrap();
        assert_eq!(decoded[0].1.len(), 300);
    }

    /// Blocks from an indexing encoder decode across consecutive frames
    #[test]
    fn test_decodes_indexed_blocks_from_peer_encoder() {
        let mut encoder = hpack::Encoder::new();
        let mut decoder = HeaderBlockDecoder::new(65536);

        for _ in 0..2 {
            let block = encoder.encode(request_fields());
            let decoded = decoder.decode(&block).unwrap();
            assert_eq!(decoded.len(), request_fields().len());
            assert_eq!(decoded[3], (b":path".to_vec(), b"/upload?x=1".to_vec()));
        }
    }

    #[test]
    fn test_sync_table_size_only_grows() {
        let mut decoder = HeaderBlockDecoder::default();
        assert!(!decoder.sync_table_size(1024));
        assert_eq!(decoder.table_size(), 4096);
        assert!(decoder.sync_table_size(8192));
        assert_eq!(decoder.table_size(), 8192);
    }

    #[test]
    fn test_truncated_size_update_is_an_error() {
        let mut decoder = HeaderBlockDecoder::default();
        let err = decoder.decode(&[0x3f]).unwrap_err();
        assert!(err.contains("truncated"), "{}", err);
        assert!(decoder.decode(&[0x3f, 0xe1]).is_err());
    }

    #[test]
    fn test_size_update_is_bounded_by_table_size() {
        let mut decoder = HeaderBlockDecoder::new(4096);
        // 0x3f 0xe1 0x1f = 31 + 0x61 + (0x1f << 7) = 4096
        let mut block = vec![0x3f, 0xe1, 0x1f];
        block.extend(encode_header_block(request_fields()));
        assert_eq!(decoder.decode(&block).unwrap().len(), request_fields().len());

        // 4097
        let err = decoder.decode(&[0x3f, 0xe2, 0x1f]).unwrap_err();
        assert!(err.contains("exceeds"), "{}", err);
    }

    #[test]
    fn test_size_update_after_a_field_is_an_error() {
        let mut block = encode_header_block(vec![(&b"x-a"[..], &b"1"[..])]);
        block.push(0x20);
        assert!(HeaderBlockDecoder::default().decode(&block).is_err());
    }

    #[test]
    fn test_truncated_literal_is_an_error() {
        let block = encode_header_block(vec![(&b"x-long"[..], &b"value"[..])]);
        let truncated = &block[..block.len() - 2];
        assert!(HeaderBlockDecoder::default().decode(truncated).is_err());
    }

    #[test]
    fn test_garbage_block_fails() {
        let mut decoder = HeaderBlockDecoder::default();
        // indexed field 0 is invalid
        assert!(decoder.decode(&[0x80]).is_err());
    }
}
