//! Record payloads and the length-prefix framing shared by byte-oriented
//! channels and the spill log.
//!
//! The runtime treats records as opaque byte tuples; serialization to and from
//! typed fields is the concern of node logic, not of the core. On the wire a
//! record is a little-endian `u32` length followed by the payload; the length
//! value `u32::MAX` is reserved as the end-of-stream sentinel.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length value marking end-of-stream inside a byte stream.
pub(crate) const EOS_MARKER: u32 = u32::MAX;

/// Bytes occupied by the length prefix.
pub(crate) const LENGTH_PREFIX: usize = 4;

/// An opaque structured record flowing through the graph.
///
/// Backed by [`Bytes`], so cloning is cheap and records can sit in several
/// buffers at once without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    data: Bytes,
}

impl Record {
    /// Create a record from an owned or shared byte payload.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Create a record by copying a byte slice.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// The record payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the record, returning its payload.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty (an empty record is still a record).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes this record occupies in a framed stream.
    pub(crate) fn framed_len(&self) -> usize {
        LENGTH_PREFIX + self.data.len()
    }
}

impl From<Bytes> for Record {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Record {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

/// Append one framed record to `buf`.
pub(crate) fn encode_record(buf: &mut BytesMut, record: &Record) {
    debug_assert!((record.len() as u64) < EOS_MARKER as u64);
    buf.put_u32_le(record.len() as u32);
    buf.put_slice(record.as_bytes());
}

/// Append the end-of-stream sentinel to `buf`.
pub(crate) fn encode_eos(buf: &mut BytesMut) {
    buf.put_u32_le(EOS_MARKER);
}

/// Outcome of decoding one frame from a byte stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Record(Record),
    Eos,
    /// Not enough bytes for a full frame; nothing was consumed.
    Incomplete,
}

/// Decode one framed record from the front of `buf`, advancing it.
pub(crate) fn decode_record(buf: &mut BytesMut) -> Frame {
    if buf.len() < LENGTH_PREFIX {
        return Frame::Incomplete;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len == EOS_MARKER {
        buf.advance(LENGTH_PREFIX);
        return Frame::Eos;
    }
    let len = len as usize;
    if buf.len() < LENGTH_PREFIX + len {
        return Frame::Incomplete;
    }
    buf.advance(LENGTH_PREFIX);
    let payload = buf.split_to(len).freeze();
    Frame::Record(Record::new(payload))
}

/// Peek whether the next frame in `buf` is a complete record (not the
/// end-of-stream sentinel), without consuming anything.
pub(crate) fn next_is_record(buf: &BytesMut) -> bool {
    if buf.len() < LENGTH_PREFIX {
        return false;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    len != EOS_MARKER && buf.len() >= LENGTH_PREFIX + len as usize
}
