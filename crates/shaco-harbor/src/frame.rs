//! Harbor wire frame: encode/decode.
//!
//! Grounded on spec.md §4.5/§6 and, byte-for-byte, on the worked hex
//! scenarios in spec.md §8 (S1-S4). Spec.md's prose gives two paraphrases
//! for the length prefix's value — `4 + 8 + payload_size` and, in the same
//! sentence, `(total - 4)` — which do not agree with each other, and
//! neither agrees with the worked examples. The examples are authoritative:
//! working backward from S1 and S2, the length prefix actually carries
//! `payload_size + MIN_LENGTH` where `MIN_LENGTH = 11`, one less than a
//! self-inclusive "whole frame size" prefix would read. This module
//! reproduces that exactly, preserving the wire quirk rather than silently
//! "fixing" it to match the prose.

use bytes::{BufMut, Bytes, BytesMut};
use shaco_handle::Handle;

/// Header size in bytes, following the 4-byte length prefix: 2 (source) + 1
/// (dest) + 1 (type) + 4 (session).
pub const HEADER_SIZE: usize = 8;

/// The length prefix's value for an empty-payload frame (see module docs).
pub const MIN_LENGTH: u32 = 11;

/// A decoded harbor wire frame. `source` is the raw wire-packed value
/// (`(sender node id << 8) | (sender local id & 0xff)`); use
/// [`Frame::source_handle`] to recover a full [`Handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u16,
    pub dest: u8,
    pub type_tag: u8,
    pub session: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn source_handle(&self) -> Handle {
        Handle::new((self.source >> 8) as u8, (self.source & 0xff) as u32)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum FrameError {
    #[error("package head too small: length={0}")]
    HeaderTooSmall(u32),
}

/// Encodes one outbound frame. `source_node_id` is stamped as the wire
/// source's high byte regardless of what node id the originating handle
/// itself carries (spec.md §6: "the sender node-id is implied by the
/// channel and is stamped into outgoing source as its high byte").
/// `source_local_id` and `dest_local_id` are truncated to the wire's 16-bit
/// and 8-bit widths respectively (spec.md §4.5's "note on addressing
/// width").
pub fn encode(source_node_id: u8, source_local_id: u32, dest_local_id: u8, type_tag: u8, session: i32, payload: &[u8]) -> BytesMut {
    let length = MIN_LENGTH + payload.len() as u32;
    let mut out = BytesMut::with_capacity(4 + HEADER_SIZE + payload.len());
    out.put_u32(length);
    out.put_u16(((source_node_id as u16) << 8) | (source_local_id as u16 & 0xff));
    out.put_u8(dest_local_id);
    out.put_u8(type_tag);
    out.put_i32(session);
    out.put_slice(payload);
    out
}

/// Attempts to decode one frame from the front of `buf`.
///
/// - `Ok(None)`: `buf` does not yet hold a complete frame; the caller should
///   wait for more bytes (spec.md §4.5's "at most one partial frame"
///   invariant for a slave's receive buffer).
/// - `Ok(Some((frame, consumed)))`: `consumed` is the number of leading
///   bytes of `buf` the frame occupied, for the caller to advance past.
/// - `Err`: the declared length is smaller than any valid frame could be
///   (spec.md §4.5: "Frames with total ≤ 8 are rejected... package head too
///   small"; the real floor in this wire format is [`MIN_LENGTH`], since no
///   valid frame — not even an empty-payload one — can declare less).
pub fn try_decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length < MIN_LENGTH {
        return Err(FrameError::HeaderTooSmall(length));
    }
    let following = (length - 3) as usize; // header(8) + payload, per the worked examples
    let total = 4 + following;
    if buf.len() < total {
        return Ok(None);
    }
    let header = &buf[4..12];
    let source = u16::from_be_bytes([header[0], header[1]]);
    let dest = header[2];
    let type_tag = header[3];
    let session = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let payload = Bytes::copy_from_slice(&buf[12..total]);
    Ok(Some((Frame { source, dest, type_tag, session, payload }, total)))
}
