//! Wire primitives: the frame header varint and body field helpers.
//!
//! # Header Format
//!
//! Every frame starts with a variable-length header:
//!
//! ```text
//!  7 6   5   4 3 2 1 0
//! +---+-----+---------+
//! |KK |  E  |  VVVVV  |   E = 0: VVVVV is the value (0-31)
//! +---+-----+---------+   E = 1: VVVVV is the count of value bytes that
//!                                follow big-endian (1-30), or 31 meaning
//!                                one extension byte holds the count
//! ```
//!
//! `KK` is the [`FrameKind`]. The value packs the signed magnitude and the
//! encrypted flag as `(zigzag(magnitude) << 1) | encrypted`.

use crate::codec::Codec;
use crate::error::{NetworkError, Result};

const KIND_SHIFT: u8 = 6;
const ESCAPE: u8 = 0x20;
const LOW_MASK: u8 = 0x1F;
const EXTENDED_COUNT: u8 = 0x1F;
const MAX_VALUE_BYTES: usize = 8;

/// Frame kind carried in the top two header bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Application message, request or response
    Send = 0,
    /// Channel value update
    Update = 1,
    /// Channel acknowledgement
    Sync = 2,
    /// Connection control message
    Control = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Send),
            1 => Ok(FrameKind::Update),
            2 => Ok(FrameKind::Sync),
            3 => Ok(FrameKind::Control),
            _ => Err(NetworkError::protocol("invalid frame kind")),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind
    pub kind: FrameKind,
    /// Signed magnitude: request/response/channel ID or control header value
    pub magnitude: i32,
    /// Body is encrypted
    pub encrypted: bool,
}

fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

impl Header {
    /// Create a header.
    #[must_use]
    pub const fn new(kind: FrameKind, magnitude: i32, encrypted: bool) -> Self {
        Self {
            kind,
            magnitude,
            encrypted,
        }
    }

    fn value(&self) -> u64 {
        (u64::from(zigzag(self.magnitude)) << 1) | u64::from(self.encrypted)
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let kind = (self.kind as u8) << KIND_SHIFT;
        let value = self.value();
        if value <= u64::from(LOW_MASK) {
            out.push(kind | value as u8);
            return;
        }
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let count = MAX_VALUE_BYTES - skip;
        out.push(kind | ESCAPE | count as u8);
        out.extend_from_slice(&bytes[skip..]);
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let value = self.value();
        if value <= u64::from(LOW_MASK) {
            1
        } else {
            1 + MAX_VALUE_BYTES - (value.leading_zeros() as usize / 8)
        }
    }

    /// Decode a header, returning it and the number of bytes consumed.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] for truncated or out-of-range headers.
    pub fn decode(bytes: &[u8]) -> Result<(Header, usize)> {
        let first = *bytes
            .first()
            .ok_or(NetworkError::protocol("empty frame"))?;
        let kind = FrameKind::try_from(first >> KIND_SHIFT)?;

        let (value, consumed) = if first & ESCAPE == 0 {
            (u64::from(first & LOW_MASK), 1)
        } else {
            let (count, start) = match first & LOW_MASK {
                0 => return Err(NetworkError::protocol("escaped header without value bytes")),
                EXTENDED_COUNT => {
                    let count = *bytes
                        .get(1)
                        .ok_or(NetworkError::protocol("truncated header"))?;
                    (count as usize, 2)
                }
                count => (count as usize, 1),
            };
            if count > MAX_VALUE_BYTES {
                return Err(NetworkError::protocol("header value too large"));
            }
            let raw = bytes
                .get(start..start + count)
                .ok_or(NetworkError::protocol("truncated header"))?;
            let value = raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            (value, start + count)
        };

        let encrypted = value & 1 == 1;
        let zigzagged = u32::try_from(value >> 1)
            .map_err(|_| NetworkError::protocol("header magnitude out of range"))?;
        Ok((
            Header {
                kind,
                magnitude: unzigzag(zigzagged),
                encrypted,
            },
            consumed,
        ))
    }
}

/// Body field writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one byte.
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Write a boolean byte.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(u8::from(value))
    }

    /// Write a big-endian `u32`.
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a big-endian `i32`.
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Write a length-prefixed binary block.
    pub fn block(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.block(value.as_bytes())
    }

    /// Write an optional string guarded by a presence byte.
    pub fn optional_string(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(value) => self.bool(true).string(value),
            None => self.bool(false),
        }
    }

    /// Write an optional nested payload guarded by a presence byte.
    ///
    /// # Errors
    /// Returns the codec's failure.
    pub fn payload<M>(&mut self, codec: &dyn Codec<M>, value: Option<&M>) -> Result<&mut Self> {
        match value {
            Some(message) => {
                let mut encoded = Vec::new();
                codec.encode(message, &mut encoded)?;
                Ok(self.bool(true).block(&encoded))
            }
            None => Ok(self.bool(false)),
        }
    }

    /// Append raw bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Finish and return the bytes.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Body field reader over a borrowed slice.
#[derive(Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read from the start of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(NetworkError::protocol("length overflow"))?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(NetworkError::protocol("truncated frame body"))?;
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a boolean byte; anything other than 0 or 1 is malformed.
    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(NetworkError::protocol("invalid boolean byte")),
        }
    }

    /// Read a big-endian `u32`.
    pub fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a big-endian `i32`.
    pub fn i32(&mut self) -> Result<i32> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a length-prefixed binary block.
    pub fn block(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > self.remaining() {
            return Err(NetworkError::protocol("block length exceeds frame"));
        }
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String> {
        let raw = self.block()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| NetworkError::protocol("invalid UTF-8 string"))
    }

    /// Read an optional string guarded by a presence byte.
    pub fn optional_string(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    /// Read an optional nested payload guarded by a presence byte.
    pub fn payload<M>(&mut self, codec: &dyn Codec<M>) -> Result<Option<M>> {
        if self.bool()? {
            let raw = self.block()?;
            Ok(Some(codec.decode(raw)?))
        } else {
            Ok(None)
        }
    }

    /// Everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }

    /// Bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(NetworkError::protocol("trailing bytes in frame body"))
        }
    }
}
