//! Error types for the transport layer.

use stratus_core::CodecError;
use stratus_dispatch::DispatchError;

use crate::protocol::SessionId;

/// Errors reported by channels.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is down; no further sends are accepted.
    #[error("channel inactive")]
    Inactive,

    /// Initialize was called twice.
    #[error("channel already initialized")]
    AlreadyInitialized,

    /// Encoding or decoding a message failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The underlying transport failed.
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The dispatch engine refused a lane or submission.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Errors reported by component endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The dispatch engine refused a lane or binding.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The underlying channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// No session with the given id exists on this endpoint.
    #[error("unknown session {session}")]
    UnknownSession {
        /// The session id that was not found.
        session: SessionId,
    },

    /// A callback stand-in is already bound to this endpoint.
    #[error("callback already bound")]
    CallbackAlreadyBound,
}
