//! # stratus-transport
//!
//! Framed duplex channels and the component messaging protocol of the
//! stratus runtime.
//!
//! This crate provides:
//! - **Wire framing**: length-prefixed metadata + body frames
//! - **[`Channel`]**: duplex framed-message channels over pluggable
//!   transports (TCP, in-memory pipes), with inbound delivery through
//!   dispatch lanes
//! - **[`Endpoint`]**: the call/cast protocol with sessions,
//!   request/reply correlation, and termination cascades
//! - **[`PendingTable`]**: the generic pending-request correlation table
//!   reused by every resource connector

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod channel;
mod endpoint;
mod error;
mod pending;
mod pipe;
mod protocol;
mod transport;
mod wire;

// Channel exports
pub use channel::{Channel, ChannelConfig, ChannelObserver, CloseReason, FrameCodec};

// Endpoint exports
pub use endpoint::{CallInputs, Endpoint, SessionObserver};

// Correlation table exports
pub use pending::{PendingError, PendingTable, Resolution};

// Protocol exports
pub use protocol::{Envelope, EnvelopeCodec, Head, MessageClass, Payload, RoleId, SessionId};

// Transport exports
pub use pipe::{pair as pipe_pair, PipeEnd, PipeReader, PipeWriter};
pub use transport::{ChannelTransport, CloseHook};

// Wire exports
pub use wire::{Frame, FrameError, DEFAULT_MAX_SECTION_SIZE, SECTION_LEN_SIZE};

// Error exports
pub use error::{ChannelError, EndpointError};
