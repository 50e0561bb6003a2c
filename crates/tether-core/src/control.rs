//! Connection control messages.
//!
//! A control frame's header magnitude is the [`ControlHeader`] value and its
//! body is the variant's fixed field layout:
//!
//! | Header | Body |
//! |--------|------|
//! | `Connect` / `CompleteConnect` | optional payload |
//! | `Secure` / `Authenticate` | string |
//! | `CreateSession` / `StartSession` | block |
//! | `Register` | string, block |
//! | `Disconnect` | optional string |
//! | `OpenChannel` | i32, optional payload |
//! | `CloseChannel` | i32 |
//! | `RejectRequest` | u32, string |

use crate::codec::Codec;
use crate::error::{NetworkError, Result};
use crate::wire::{Reader, Writer};

/// Control header values carried in the frame header magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ControlHeader {
    /// Application connect request
    Connect = 1,
    /// Server accepted the connect request
    CompleteConnect = 2,
    /// Authentication verified; first encrypted frame from the server
    Secure = 3,
    /// Server SRP session data
    CreateSession = 4,
    /// Client SRP response
    StartSession = 5,
    /// Sign-up with a new verifier
    Register = 6,
    /// Log-in as an existing user
    Authenticate = 7,
    /// Graceful disconnect
    Disconnect = 8,
    /// Channel opened by the sender
    OpenChannel = 9,
    /// Channel closed by the sender
    CloseChannel = 10,
    /// Request rejected by the responder
    RejectRequest = 11,
}

impl TryFrom<i32> for ControlHeader {
    type Error = NetworkError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(ControlHeader::Connect),
            2 => Ok(ControlHeader::CompleteConnect),
            3 => Ok(ControlHeader::Secure),
            4 => Ok(ControlHeader::CreateSession),
            5 => Ok(ControlHeader::StartSession),
            6 => Ok(ControlHeader::Register),
            7 => Ok(ControlHeader::Authenticate),
            8 => Ok(ControlHeader::Disconnect),
            9 => Ok(ControlHeader::OpenChannel),
            10 => Ok(ControlHeader::CloseChannel),
            11 => Ok(ControlHeader::RejectRequest),
            _ => Err(NetworkError::protocol("unknown control header")),
        }
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage<M> {
    /// Application connect request
    Connect {
        /// Application payload handed to `on_connection`
        request: Option<M>,
    },
    /// Server accepted the connect request
    CompleteConnect {
        /// Application payload returned by `on_connection`
        response: Option<M>,
    },
    /// Authentication verified
    Secure {
        /// Authenticated identifier
        identifier: String,
    },
    /// Server SRP session data
    CreateSession {
        /// Salt and server ephemeral
        session: Vec<u8>,
    },
    /// Client SRP response
    StartSession {
        /// Client ephemeral and proof
        response: Vec<u8>,
    },
    /// Sign-up
    Register {
        /// New identifier
        identifier: String,
        /// Verifier created from the identifier and secret
        verifier: Vec<u8>,
    },
    /// Log-in
    Authenticate {
        /// Existing identifier
        identifier: String,
    },
    /// Graceful disconnect
    Disconnect {
        /// Human-readable reason
        reason: Option<String>,
    },
    /// Channel opened by the sender
    OpenChannel {
        /// Channel ID in the sender's space
        channel: i32,
        /// Channel profile
        profile: Option<M>,
    },
    /// Channel closed by the sender
    CloseChannel {
        /// Channel ID in the sender's space
        channel: i32,
    },
    /// Request rejected by the responder
    RejectRequest {
        /// Rejected request ID
        request: u32,
        /// Human-readable reason
        reason: String,
    },
}

impl<M> ControlMessage<M> {
    /// Header value for this message.
    #[must_use]
    pub fn header(&self) -> ControlHeader {
        match self {
            ControlMessage::Connect { .. } => ControlHeader::Connect,
            ControlMessage::CompleteConnect { .. } => ControlHeader::CompleteConnect,
            ControlMessage::Secure { .. } => ControlHeader::Secure,
            ControlMessage::CreateSession { .. } => ControlHeader::CreateSession,
            ControlMessage::StartSession { .. } => ControlHeader::StartSession,
            ControlMessage::Register { .. } => ControlHeader::Register,
            ControlMessage::Authenticate { .. } => ControlHeader::Authenticate,
            ControlMessage::Disconnect { .. } => ControlHeader::Disconnect,
            ControlMessage::OpenChannel { .. } => ControlHeader::OpenChannel,
            ControlMessage::CloseChannel { .. } => ControlHeader::CloseChannel,
            ControlMessage::RejectRequest { .. } => ControlHeader::RejectRequest,
        }
    }

    /// Encode the body layout.
    ///
    /// # Errors
    /// Returns the codec's failure for nested payloads.
    pub fn encode(&self, codec: &dyn Codec<M>) -> Result<Vec<u8>> {
        let mut w = Writer::new();
        match self {
            ControlMessage::Connect { request } => {
                w.payload(codec, request.as_ref())?;
            }
            ControlMessage::CompleteConnect { response } => {
                w.payload(codec, response.as_ref())?;
            }
            ControlMessage::Secure { identifier } | ControlMessage::Authenticate { identifier } => {
                w.string(identifier);
            }
            ControlMessage::CreateSession { session } => {
                w.block(session);
            }
            ControlMessage::StartSession { response } => {
                w.block(response);
            }
            ControlMessage::Register {
                identifier,
                verifier,
            } => {
                w.string(identifier).block(verifier);
            }
            ControlMessage::Disconnect { reason } => {
                w.optional_string(reason.as_deref());
            }
            ControlMessage::OpenChannel { channel, profile } => {
                w.i32(*channel).payload(codec, profile.as_ref())?;
            }
            ControlMessage::CloseChannel { channel } => {
                w.i32(*channel);
            }
            ControlMessage::RejectRequest { request, reason } => {
                w.u32(*request).string(reason);
            }
        }
        Ok(w.finish())
    }

    /// Decode a body for `header`. The body must be consumed exactly.
    ///
    /// # Errors
    /// Returns [`NetworkError::Protocol`] for malformed bodies.
    pub fn decode(header: ControlHeader, body: &[u8], codec: &dyn Codec<M>) -> Result<Self> {
        let mut r = Reader::new(body);
        let message = match header {
            ControlHeader::Connect => ControlMessage::Connect {
                request: r.payload(codec)?,
            },
            ControlHeader::CompleteConnect => ControlMessage::CompleteConnect {
                response: r.payload(codec)?,
            },
            ControlHeader::Secure => ControlMessage::Secure {
                identifier: r.string()?,
            },
            ControlHeader::CreateSession => ControlMessage::CreateSession {
                session: r.block()?.to_vec(),
            },
            ControlHeader::StartSession => ControlMessage::StartSession {
                response: r.block()?.to_vec(),
            },
            ControlHeader::Register => ControlMessage::Register {
                identifier: r.string()?,
                verifier: r.block()?.to_vec(),
            },
            ControlHeader::Authenticate => ControlMessage::Authenticate {
                identifier: r.string()?,
            },
            ControlHeader::Disconnect => ControlMessage::Disconnect {
                reason: r.optional_string()?,
            },
            ControlHeader::OpenChannel => ControlMessage::OpenChannel {
                channel: r.i32()?,
                profile: r.payload(codec)?,
            },
            ControlHeader::CloseChannel => ControlMessage::CloseChannel { channel: r.i32()? },
            ControlHeader::RejectRequest => ControlMessage::RejectRequest {
                request: r.u32()?,
                reason: r.string()?,
            },
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;

    fn round_trip(message: ControlMessage<String>) {
        let codec = BincodeCodec::<String>::new();
        let body = message.encode(&codec).unwrap();
        let decoded = ControlMessage::<String>::decode(message.header(), &body, &codec).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_every_control_message_round_trips() {
        let messages = vec![
            ControlMessage::Connect {
                request: Some("hi".to_string()),
            },
            ControlMessage::Connect { request: None },
            ControlMessage::CompleteConnect {
                response: Some("welcome".to_string()),
            },
            ControlMessage::CompleteConnect { response: None },
            ControlMessage::Secure {
                identifier: "alice".into(),
            },
            ControlMessage::CreateSession {
                session: vec![1, 2, 3],
            },
            ControlMessage::StartSession {
                response: vec![4, 5],
            },
            ControlMessage::Register {
                identifier: "bob".into(),
                verifier: vec![9; 40],
            },
            ControlMessage::Authenticate {
                identifier: "carol".into(),
            },
            ControlMessage::Disconnect {
                reason: Some("bye".into()),
            },
            ControlMessage::Disconnect { reason: None },
            ControlMessage::OpenChannel {
                channel: 3,
                profile: Some("clock".into()),
            },
            ControlMessage::OpenChannel {
                channel: 4,
                profile: None,
            },
            ControlMessage::CloseChannel { channel: 3 },
            ControlMessage::RejectRequest {
                request: 17,
                reason: "busy".into(),
            },
        ];
        for message in messages {
            round_trip(message);
        }
    }

    #[test]
    fn test_header_values() {
        for value in 1..=11 {
            let header = ControlHeader::try_from(value).unwrap();
            assert_eq!(header as i32, value);
        }
        assert!(ControlHeader::try_from(0).is_err());
        assert!(ControlHeader::try_from(12).is_err());
        assert!(ControlHeader::try_from(-1).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let codec = BincodeCodec::<String>::new();
        let mut body = ControlMessage::<String>::CloseChannel { channel: 1 }
            .encode(&codec)
            .unwrap();
        body.push(0);
        assert!(ControlMessage::<String>::decode(ControlHeader::CloseChannel, &body, &codec).is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let codec = BincodeCodec::<String>::new();
        let body = ControlMessage::<String>::Register {
            identifier: "bob".into(),
            verifier: vec![1, 2, 3],
        }
        .encode(&codec)
        .unwrap();
        let result = ControlMessage::<String>::decode(ControlHeader::Register, &body[..body.len() - 1], &codec);
        assert!(matches!(result, Err(NetworkError::Protocol(_))));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::codec::BincodeCodec;
    use proptest::prelude::*;

    fn text() -> impl Strategy<Value = String> {
        ".{0,24}"
    }

    fn bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..64)
    }

    fn message() -> impl Strategy<Value = ControlMessage<String>> {
        prop_oneof![
            proptest::option::of(text()).prop_map(|request| ControlMessage::Connect { request }),
            proptest::option::of(text())
                .prop_map(|response| ControlMessage::CompleteConnect { response }),
            text().prop_map(|identifier| ControlMessage::Secure { identifier }),
            bytes().prop_map(|session| ControlMessage::CreateSession { session }),
            bytes().prop_map(|response| ControlMessage::StartSession { response }),
            (text(), bytes())
                .prop_map(|(identifier, verifier)| ControlMessage::Register { identifier, verifier }),
            text().prop_map(|identifier| ControlMessage::Authenticate { identifier }),
            proptest::option::of(text()).prop_map(|reason| ControlMessage::Disconnect { reason }),
            (any::<i32>(), proptest::option::of(text()))
                .prop_map(|(channel, profile)| ControlMessage::OpenChannel { channel, profile }),
            any::<i32>().prop_map(|channel| ControlMessage::CloseChannel { channel }),
            (any::<u32>(), text())
                .prop_map(|(request, reason)| ControlMessage::RejectRequest { request, reason }),
        ]
    }

    proptest! {
        /// Every control message decodes back to itself under its own header
        #[test]
        fn control_message_round_trip(message in message()) {
            let codec = BincodeCodec::<String>::new();
            let body = message.encode(&codec).unwrap();
            let decoded = ControlMessage::<String>::decode(message.header(), &body, &codec).unwrap();
            prop_assert_eq!(decoded, message);
        }

        /// Arbitrary bodies never panic the decoder
        #[test]
        fn control_decode_never_panics(value in 1i32..=11, body in bytes()) {
            let codec = BincodeCodec::<String>::new();
            let header = ControlHeader::try_from(value).unwrap();
            let _ = ControlMessage::<String>::decode(header, &body, &codec);
        }
    }
}
