//! Packing of multiple frames into one transport transaction.
//!
//! ## Framing
//! Every frame is prefixed by an eight byte header. The first two little-endian `u16` fields
//! both hold the length of header and padded payload, which allows the far end to check the
//! header for consistency, and to jump directly to the next header. The remaining four bytes
//! are zero. The payload is padded with zeroes to a multiple of four bytes. A four byte zero
//! marker terminates the aggregate.
//!
//! ```text
//! | len | len | 0000 | payload ... pad | len | len | 0000 | payload ... pad | 0000 |
//! ```
//!
//! The header doesn't carry the unpadded length, so an unpacked payload always includes its
//! padding. Frames, whose length isn't a multiple of four, come back longer than they went in.
use alloc::vec::Vec;

use bitfield_struct::bitfield;

#[bitfield(u64)]
/// The header in front of every aggregated frame.
pub struct AggregationHeader {
    /// Length of header and padded payload.
    pub length: u16,
    /// Copy of [Self::length].
    pub length_check: u16,
    pub __: u32,
}
impl AggregationHeader {
    /// Check if both length fields are identical.
    pub fn is_consistent(&self) -> bool {
        self.length() == self.length_check()
    }
}

/// A fixed capacity buffer, into which frames get packed.
///
/// The buffer is allocated once and reused after every [reset](Self::reset), so steady state
/// operation doesn't allocate.
pub struct AggregationBuffer {
    buffer: Vec<u8>,
    capacity: usize,
    frame_count: usize,
}
impl AggregationBuffer {
    pub const HEADER_LEN: usize = 8;
    pub const TRAILER_LEN: usize = 4;
    pub const ALIGNMENT: usize = 4;

    /// Allocate a new buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            frame_count: 0,
        }
    }
    /// The payload length rounded up to [Self::ALIGNMENT].
    pub const fn padded_len(payload_len: usize) -> usize {
        payload_len.next_multiple_of(Self::ALIGNMENT)
    }
    /// The amount of bytes, a payload of this length occupies in the buffer.
    pub const fn packed_len(payload_len: usize) -> usize {
        Self::HEADER_LEN + Self::padded_len(payload_len)
    }
    /// Check if a payload of this length still fits, while leaving room for the trailer.
    pub fn fits(&self, payload_len: usize) -> bool {
        let packed_len = Self::packed_len(payload_len);
        packed_len <= u16::MAX as usize
            && self.buffer.len() + packed_len + Self::TRAILER_LEN <= self.capacity
    }
    /// Append a payload.
    ///
    /// Returns false and leaves the buffer untouched, if the payload doesn't fit.
    pub fn push(&mut self, payload: &[u8]) -> bool {
        if !self.fits(payload.len()) {
            return false;
        }
        let packed_len = Self::packed_len(payload.len());
        let header = AggregationHeader::new()
            .with_length(packed_len as u16)
            .with_length_check(packed_len as u16);
        self.buffer
            .extend_from_slice(&header.into_bits().to_le_bytes());
        self.buffer.extend_from_slice(payload);
        self.buffer
            .resize(self.buffer.len() + Self::padded_len(payload.len()) - payload.len(), 0);
        self.frame_count += 1;
        true
    }
    /// Terminate the aggregate and return the bytes to be sent.
    pub fn finish(&mut self) -> &[u8] {
        self.buffer.extend_from_slice(&[0u8; Self::TRAILER_LEN]);
        &self.buffer
    }
    /// Clear the buffer, so it can be reused.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.frame_count = 0;
    }
    /// The amount of frames currently in the buffer.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }
    /// The amount of bytes currently in the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The aggregate was truncated, or contained an inconsistent header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MalformedAggregate {
    /// Offset of the offending header.
    pub offset: usize,
}

/// Iterates over the padded payloads of an aggregate.
///
/// Every yielded slice is a multiple of four bytes long, since the padding can't be told apart
/// from the payload.
///
/// Iteration ends at the zero marker. A malformed header is reported once, after which the
/// iterator is exhausted.
pub struct AggregateFrames<'a> {
    buffer: &'a [u8],
    offset: usize,
    done: bool,
}
impl<'a> AggregateFrames<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            done: false,
        }
    }
    fn malformed(&mut self) -> Option<Result<&'a [u8], MalformedAggregate>> {
        self.done = true;
        Some(Err(MalformedAggregate {
            offset: self.offset,
        }))
    }
}
impl<'a> Iterator for AggregateFrames<'a> {
    type Item = Result<&'a [u8], MalformedAggregate>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.buffer[self.offset..];
        let Some(marker) = rest.get(..AggregationBuffer::TRAILER_LEN) else {
            return self.malformed();
        };
        if marker == [0u8; AggregationBuffer::TRAILER_LEN] {
            self.done = true;
            return None;
        }
        let Some(header) = rest.get(..AggregationBuffer::HEADER_LEN) else {
            return self.malformed();
        };
        let mut bytes = [0u8; AggregationBuffer::HEADER_LEN];
        bytes.copy_from_slice(header);
        let header = AggregationHeader::from_bits(u64::from_le_bytes(bytes));
        let length = header.length() as usize;
        if !header.is_consistent()
            || length < AggregationBuffer::HEADER_LEN
            || length % AggregationBuffer::ALIGNMENT != 0
            || length > rest.len()
        {
            return self.malformed();
        }
        self.offset += length;
        Some(Ok(&rest[AggregationBuffer::HEADER_LEN..length]))
    }
}
