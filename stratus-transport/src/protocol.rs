//! Component protocol envelopes and their frame codec.
//!
//! Every message between two component endpoints is an [`Envelope`]: a
//! [`Head`] (message class, session, content type) carried in the frame
//! metadata section and a [`Payload`] carried in the body, each encoded
//! independently by the endpoint's [`DataCodec`].
//!
//! A session opens with an Initiation-class [`Payload::Hello`], exchanges
//! call/reply/cast traffic as Exchange-class messages, and ends with a
//! Termination-class [`Payload::Goodbye`] or channel closure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratus_core::{DataCodec, Fault, Reference};

use crate::channel::FrameCodec;
use crate::wire::Frame;

/// Identifier of one party's role in a conversation (e.g. a connector or
/// the driver it talks to).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleId(
    /// Role name, agreed upon ahead of time between the two parties.
    pub String,
);

impl RoleId {
    /// Build a role id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for RoleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one logical conversation between two roles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(
    /// Session name, unique per initiating endpoint.
    pub String,
);

impl SessionId {
    /// Mint a fresh session id for a conversation initiated by
    /// `initiator` towards `responder`.
    pub fn fresh(initiator: &RoleId, responder: &RoleId) -> Self {
        Self(format!("{initiator}~{responder}~{}", Reference::fresh()))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol message class, carried in the frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageClass {
    /// First message of a session.
    Initiation,
    /// Call/reply/cast traffic within an established session.
    Exchange,
    /// Last message of a session.
    Termination,
}

/// Frame metadata: routing information ahead of the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    /// Message class.
    pub class: MessageClass,
    /// Session the message belongs to.
    pub session: SessionId,
    /// Content type of the body (from the endpoint's codec).
    pub content_type: String,
}

/// Frame body: the protocol payload proper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Session handshake.
    Hello {
        /// Role opening the session.
        initiator: RoleId,
        /// Role the session is addressed to.
        responder: RoleId,
    },

    /// Correlated request expecting a reply.
    CallRequest {
        /// Caller-minted correlation id echoed by the reply.
        reference: Reference,
        /// Operation name resolved by the callee's dispatch table.
        operation: String,
        /// Operation inputs.
        inputs: Value,
        /// Opaque extra data passed through untouched.
        extra: Value,
    },

    /// Reply to a [`Payload::CallRequest`] with the same reference.
    CallReply {
        /// Correlation id of the call being answered.
        reference: Reference,
        /// Outputs on success, the remote fault otherwise.
        outcome: Result<Value, Fault>,
    },

    /// Fire-and-forget request; no reference, no reply.
    CastRequest {
        /// Operation name resolved by the callee's dispatch table.
        operation: String,
        /// Operation inputs.
        inputs: Value,
    },

    /// Session teardown.
    Goodbye {
        /// Optional human-readable reason.
        reason: Option<String>,
    },
}

impl Payload {
    /// The message class this payload must be carried under.
    pub fn class(&self) -> MessageClass {
        match self {
            Payload::Hello { .. } => MessageClass::Initiation,
            Payload::CallRequest { .. } | Payload::CallReply { .. } | Payload::CastRequest { .. } => {
                MessageClass::Exchange
            }
            Payload::Goodbye { .. } => MessageClass::Termination,
        }
    }
}

/// One protocol message: head plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Frame metadata.
    pub head: Head,
    /// Frame body.
    pub payload: Payload,
}

impl Envelope {
    /// Build an envelope for `session`, deriving the class from the
    /// payload.
    pub fn new(session: SessionId, content_type: &str, payload: Payload) -> Self {
        Self {
            head: Head {
                class: payload.class(),
                session,
                content_type: content_type.to_string(),
            },
            payload,
        }
    }

    /// Whether the head's class matches the payload variant.
    ///
    /// A mismatch after decoding is a protocol violation.
    pub fn is_consistent(&self) -> bool {
        self.head.class == self.payload.class()
    }
}

/// Frame codec for [`Envelope`]s over any [`DataCodec`].
///
/// Head and payload are encoded independently, so the receiving side can
/// route on metadata without decoding the body.
#[derive(Clone)]
pub struct EnvelopeCodec<D: DataCodec> {
    data: D,
}

impl<D: DataCodec> EnvelopeCodec<D> {
    /// Build an envelope codec over a payload codec.
    pub fn new(data: D) -> Self {
        Self { data }
    }
}

impl<D: DataCodec> FrameCodec for EnvelopeCodec<D> {
    type Message = Envelope;

    fn encode(&self, message: &Envelope) -> Result<Frame, stratus_core::CodecError> {
        let metadata = self.data.encode(&message.head)?;
        let body = self.data.encode(&message.payload)?;
        Ok(Frame::new(metadata, body))
    }

    fn decode(&self, frame: &Frame) -> Result<Envelope, stratus_core::CodecError> {
        let head: Head = self.data.decode(&frame.metadata)?;
        let payload: Payload = self.data.decode(&frame.body)?;
        Ok(Envelope { head, payload })
    }
}
