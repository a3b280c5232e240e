//! Message framing for the badge GATT protocol
//!
//! Every control/data message is delimiter-framed and escape-encoded:
//!
//! ```text
//! 0x01 · escape( len_be16 · tag_u8 · body ) · 0x03
//! ```
//!
//! where `escape` maps `0x02 → 02 06`, `0x01 → 02 05`, `0x03 → 02 07`
//! (the `0x02` substitution first, so escape bytes are never re-escaped).
//! Framed messages are written to the data attribute in ≤20-byte GATT
//! chunks.
//!
//! Payloads longer than one frame (glyph strips, animations) go as *bulk*
//! messages: the body is cut into 128-byte chunks, each wrapped with a
//! total-length/index header and an XOR trailer, and each chunk must be
//! acknowledged by the badge before the next is sent.

use crate::error::ProtocolError;

/// Message tags.
pub mod tag {
    /// Glyph strip upload (bulk).
    pub const GLYPHS: u8 = 2;
    /// Animation frame upload (bulk).
    pub const FRAMES: u8 = 4;
    /// Display mode (single byte).
    pub const MODE: u8 = 6;
    /// Scroll/animation speed (single byte).
    pub const SPEED: u8 = 7;
    /// Brightness (single byte).
    pub const BRIGHTNESS: u8 = 8;
}

/// Largest GATT write the badge accepts.
pub const GATT_MTU: usize = 20;

/// Bulk transfer chunk size before wrapping.
pub const BULK_CHUNK_SIZE: usize = 128;

/// Escape frame-delimiter bytes within a message.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for &b in data {
        match b {
            0x01 => out.extend_from_slice(&[0x02, 0x05]),
            0x02 => out.extend_from_slice(&[0x02, 0x06]),
            0x03 => out.extend_from_slice(&[0x02, 0x07]),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape`]. Rejects stray delimiters and malformed pairs.
pub fn unescape(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&b) = iter.next() {
        match b {
            0x02 => match iter.next() {
                Some(0x05) => out.push(0x01),
                Some(0x06) => out.push(0x02),
                Some(0x07) => out.push(0x03),
                other => {
                    return Err(ProtocolError::BadFrame(format!(
                        "bad escape pair 02 {other:02x?}"
                    )))
                }
            },
            0x01 | 0x03 => {
                return Err(ProtocolError::BadFrame(format!(
                    "unescaped delimiter {b:02x}"
                )))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Frame one tagged message.
pub fn encode_message(tag: u8, body: &[u8]) -> Vec<u8> {
    let len = (body.len() + 1) as u16;
    let mut inner = Vec::with_capacity(body.len() + 3);
    inner.extend_from_slice(&len.to_be_bytes());
    inner.push(tag);
    inner.extend_from_slice(body);

    let mut out = Vec::with_capacity(inner.len() + 2);
    out.push(0x01);
    out.extend_from_slice(&escape(&inner));
    out.push(0x03);
    out
}

/// Parse a framed message back into `(tag, body)`.
pub fn decode_message(framed: &[u8]) -> Result<(u8, Vec<u8>), ProtocolError> {
    if framed.len() < 2 || framed[0] != 0x01 || framed[framed.len() - 1] != 0x03 {
        return Err(ProtocolError::BadFrame("missing frame delimiters".into()));
    }
    let inner = unescape(&framed[1..framed.len() - 1])?;
    if inner.len() < 3 {
        return Err(ProtocolError::BadFrame("truncated message".into()));
    }
    let len = u16::from_be_bytes([inner[0], inner[1]]) as usize;
    if len != inner.len() - 2 {
        return Err(ProtocolError::BadFrame(format!(
            "length {len} != {} payload bytes",
            inner.len() - 2
        )));
    }
    Ok((inner[2], inner[3..].to_vec()))
}

/// One wrapped-and-framed bulk chunk, with the acknowledgement frame the
/// badge is expected to notify back.
#[derive(Debug, Clone)]
pub struct BulkChunk {
    pub index: u16,
    pub message: Vec<u8>,
    pub expected_ack: Vec<u8>,
}

/// Cut `body` into wrapped bulk chunks under `tag`.
///
/// Each chunk body is `{0, total_len_be16, index_be16, chunk_len_u8,
/// chunk…, xor_u8}` with the XOR taken over everything before it.
pub fn bulk_chunks(tag: u8, body: &[u8]) -> Vec<BulkChunk> {
    body.chunks(BULK_CHUNK_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            let index = i as u16;
            let mut wrapped = Vec::with_capacity(chunk.len() + 7);
            wrapped.push(0);
            wrapped.extend_from_slice(&(body.len() as u16).to_be_bytes());
            wrapped.extend_from_slice(&index.to_be_bytes());
            wrapped.push(chunk.len() as u8);
            wrapped.extend_from_slice(chunk);
            let xor = wrapped.iter().fold(0u8, |acc, &b| acc ^ b);
            wrapped.push(xor);
            BulkChunk {
                index,
                message: encode_message(tag, &wrapped),
                expected_ack: ack_message(tag, index),
            }
        })
        .collect()
}

/// The acknowledgement frame for a bulk chunk: the same framed encoding
/// of `{0, index_be16, 0}` under the same tag.
pub fn ack_message(tag: u8, index: u16) -> Vec<u8> {
    let mut body = [0u8; 4];
    body[1..3].copy_from_slice(&index.to_be_bytes());
    encode_message(tag, &body)
}

/// What to do with a notification received while waiting for a chunk ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisposition {
    /// Byte-exact acknowledgement: advance to the next chunk.
    Accept,
    /// Well-formed frame with the right tag and index but 1–2 corrupted
    /// bytes in the zero slots. The badge firmware garbles these under
    /// load; resend the chunk.
    Retry,
    /// Anything else is a protocol error.
    Reject,
}

/// Classify a reply against the expected ACK for `(tag, index)`.
pub fn ack_disposition(received: &[u8], tag: u8, index: u16) -> AckDisposition {
    if received == ack_message(tag, index).as_slice() {
        return AckDisposition::Accept;
    }
    match decode_message(received) {
        Ok((t, body))
            if t == tag && body.len() == 4 && body[1..3] == index.to_be_bytes() =>
        {
            let corrupted = usize::from(body[0] != 0) + usize::from(body[3] != 0);
            if (1..=2).contains(&corrupted) {
                AckDisposition::Retry
            } else {
                AckDisposition::Reject
            }
        }
        _ => AckDisposition::Reject,
    }
}
