//! Frame encoding and decoding.
//!
//! # Frame Layout
//!
//! ```text
//! +----------------+---------------------------------------------+
//! | header varint  | body (encrypted as a whole when E is set)   |
//! +----------------+---------------------------------------------+
//! ```
//!
//! | Kind | Magnitude | Body |
//! |------|-----------|------|
//! | Send | 0 | message (broadcast) |
//! | Send | > 0 | request message, magnitude is the request ID |
//! | Send | < 0 | response message, `-magnitude` is the request ID |
//! | Update | channel ID | `[sequence: u8][message]` |
//! | Sync | channel ID | `[sequence: u8]` |
//! | Control | [`ControlHeader`] value | control layout |

use crate::block::{Block, BlockPool};
use crate::codec::{Codec, Message};
use crate::control::{ControlHeader, ControlMessage};
use crate::error::{NetworkError, Result};
use crate::wire::{FrameKind, Header, Reader};
use std::borrow::Cow;
use std::sync::Arc;
use tether_crypto::Encryptor;
use tether_transport::Reliability;
use tracing::trace;

/// A plaintext frame body awaiting its header and optional encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Frame kind
    pub kind: FrameKind,
    /// Header magnitude
    pub magnitude: i32,
    /// Plaintext body
    pub body: Vec<u8>,
    /// Delivery constraint
    pub reliability: Reliability,
}

/// Builds outbound frames into pooled blocks.
pub struct FormatSender<M> {
    codec: Arc<dyn Codec<M>>,
    pool: Arc<BlockPool>,
}

impl<M: Message> FormatSender<M> {
    /// Create a sender writing into `pool`.
    pub fn new(codec: Arc<dyn Codec<M>>, pool: Arc<BlockPool>) -> Self {
        Self { codec, pool }
    }

    /// Payload codec.
    pub fn codec(&self) -> &Arc<dyn Codec<M>> {
        &self.codec
    }

    /// Block pool frames are written into.
    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Application message: `0` broadcast, `+id` request, `-id` response.
    ///
    /// # Errors
    /// Returns the codec's failure.
    pub fn message(&self, magnitude: i32, message: &M, reliability: Reliability) -> Result<Outbound> {
        let mut body = Vec::new();
        self.codec.encode(message, &mut body)?;
        Ok(Outbound {
            kind: FrameKind::Send,
            magnitude,
            body,
            reliability,
        })
    }

    /// Channel update body `[sequence][message]`, sent unreliably.
    ///
    /// # Errors
    /// Returns the codec's failure.
    pub fn update(&self, channel: i32, sequence: u8, message: &M) -> Result<Outbound> {
        let mut body = vec![sequence];
        self.codec.encode(message, &mut body)?;
        Ok(Outbound {
            kind: FrameKind::Update,
            magnitude: channel,
            body,
            reliability: Reliability::Unreliable,
        })
    }

    /// Channel acknowledgement `[sequence]`, sent unreliably.
    pub fn sync(&self, channel: i32, sequence: u8) -> Outbound {
        Outbound {
            kind: FrameKind::Sync,
            magnitude: channel,
            body: vec![sequence],
            reliability: Reliability::Unreliable,
        }
    }

    /// Control message, sent ordered.
    ///
    /// # Errors
    /// Returns the codec's failure for nested payloads.
    pub fn control(&self, message: &ControlMessage<M>) -> Result<Outbound> {
        Ok(Outbound {
            kind: FrameKind::Control,
            magnitude: message.header() as i32,
            body: message.encode(self.codec.as_ref())?,
            reliability: Reliability::Ordered,
        })
    }

    /// Write header and body into a block, encrypting the body when an
    /// encryptor is given.
    ///
    /// # Errors
    /// Returns [`NetworkError::Crypto`] if encryption fails.
    pub fn seal(&self, outbound: &Outbound, encryptor: Option<&Encryptor>) -> Result<Arc<Block>> {
        let header = Header::new(outbound.kind, outbound.magnitude, encryptor.is_some());
        let mut head = Vec::with_capacity(header.encoded_len());
        header.encode(&mut head);

        let mut writer = self.pool.writer(outbound.reliability);
        writer.extend(&head);
        match encryptor {
            Some(encryptor) => writer.extend(&encryptor.encrypt(&outbound.body)?),
            None => writer.extend(&outbound.body),
        }
        trace!(
            kind = ?outbound.kind,
            magnitude = outbound.magnitude,
            encrypted = header.encrypted,
            bytes = writer.len(),
            "frame sealed"
        );
        Ok(writer.seal())
    }
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<M> {
    /// Fire-and-forget message
    Message(M),
    /// Request awaiting a response
    Request {
        /// Request ID in the sender's space
        id: u32,
        /// Request payload
        message: M,
    },
    /// Response to one of our requests
    Response {
        /// Request ID in our space
        id: u32,
        /// Response payload
        message: M,
    },
    /// Channel value update
    Update {
        /// Channel ID in the sender's space
        channel: i32,
        /// Update sequence
        sequence: u8,
        /// Channel value
        message: M,
    },
    /// Channel acknowledgement
    Sync {
        /// Channel ID in our space
        channel: i32,
        /// Acknowledged sequence
        sequence: u8,
    },
    /// Control message
    Control(ControlMessage<M>),
}

/// Receives decoded frames from [`FormatReceiver::receive`].
pub trait FrameHandler<M> {
    /// Whether unencrypted frames are acceptable right now.
    fn accepts_plaintext(&self) -> bool {
        true
    }

    /// Fire-and-forget message.
    fn on_message(&mut self, message: M) -> Result<()>;

    /// Request from the peer.
    fn on_request(&mut self, id: u32, message: M) -> Result<()>;

    /// Response to one of our requests.
    fn on_response(&mut self, id: u32, message: M) -> Result<()>;

    /// Channel update from the peer.
    fn on_update(&mut self, channel: i32, sequence: u8, message: M) -> Result<()>;

    /// Acknowledgement of one of our channel updates.
    fn on_sync(&mut self, channel: i32, sequence: u8) -> Result<()>;

    /// Control message.
    fn on_control(&mut self, message: ControlMessage<M>) -> Result<()>;
}

/// Parses inbound frames.
pub struct FormatReceiver<M> {
    codec: Arc<dyn Codec<M>>,
    max_frame_size: usize,
}

impl<M: Message> FormatReceiver<M> {
    /// Create a receiver rejecting frames larger than `max_frame_size`.
    pub fn new(codec: Arc<dyn Codec<M>>, max_frame_size: usize) -> Self {
        Self {
            codec,
            max_frame_size,
        }
    }

    /// Decode one frame, decrypting the body if the header says so.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] for malformed frames or an
    /// encrypted frame with no session, and [`NetworkError::Crypto`] if
    /// decryption fails.
    pub fn parse(&self, bytes: &[u8], encryptor: Option<&Encryptor>) -> Result<(Header, Frame<M>)> {
        if bytes.len() > self.max_frame_size {
            return Err(NetworkError::protocol("frame exceeds maximum size"));
        }
        let (header, consumed) = Header::decode(bytes)?;
        let raw = &bytes[consumed..];
        let body: Cow<'_, [u8]> = if header.encrypted {
            let encryptor =
                encryptor.ok_or(NetworkError::protocol("encrypted frame without session"))?;
            Cow::Owned(encryptor.decrypt(raw)?)
        } else {
            Cow::Borrowed(raw)
        };

        let frame = match header.kind {
            FrameKind::Send => {
                let message = self.codec.decode(&body)?;
                match header.magnitude {
                    0 => Frame::Message(message),
                    m if m > 0 => Frame::Request {
                        id: m as u32,
                        message,
                    },
                    m => Frame::Response {
                        id: m.unsigned_abs(),
                        message,
                    },
                }
            }
            FrameKind::Update => {
                let channel = channel_id(header.magnitude)?;
                let mut r = Reader::new(&body);
                let sequence = r.u8()?;
                let message = self.codec.decode(r.rest())?;
                Frame::Update {
                    channel,
                    sequence,
                    message,
                }
            }
            FrameKind::Sync => {
                let channel = channel_id(header.magnitude)?;
                let mut r = Reader::new(&body);
                let sequence = r.u8()?;
                r.finish()?;
                Frame::Sync { channel, sequence }
            }
            FrameKind::Control => {
                let control = ControlHeader::try_from(header.magnitude)?;
                Frame::Control(ControlMessage::decode(control, &body, self.codec.as_ref())?)
            }
        };
        Ok((header, frame))
    }

    /// Decode one frame and dispatch it to `handler`.
    ///
    /// # Errors
    /// Returns parse failures, a plaintext frame the handler refuses, or the
    /// handler's own error.
    pub fn receive<H: FrameHandler<M>>(
        &self,
        bytes: &[u8],
        encryptor: Option<&Encryptor>,
        handler: &mut H,
    ) -> Result<()> {
        let (header, frame) = self.parse(bytes, encryptor)?;
        if !header.encrypted && !handler.accepts_plaintext() {
            return Err(NetworkError::protocol("plaintext frame on secure connection"));
        }
        trace!(kind = ?header.kind, magnitude = header.magnitude, "frame received");
        match frame {
            Frame::Message(message) => handler.on_message(message),
            Frame::Request { id, message } => handler.on_request(id, message),
            Frame::Response { id, message } => handler.on_response(id, message),
            Frame::Update {
                channel,
                sequence,
                message,
            } => handler.on_update(channel, sequence, message),
            Frame::Sync { channel, sequence } => handler.on_sync(channel, sequence),
            Frame::Control(control) => handler.on_control(control),
        }
    }
}

fn channel_id(magnitude: i32) -> Result<i32> {
    if magnitude > 0 {
        Ok(magnitude)
    } else {
        Err(NetworkError::protocol("invalid channel id"))
    }
}
