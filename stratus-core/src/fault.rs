//! Failure values and the process-wide fault sink.
//!
//! A [`Fault`] is the failure side of every completion in the runtime. It
//! crosses lane boundaries as a value, never as an unwound panic, and it is
//! serde-serializable so remote errors travel inside `call-reply` messages
//! unchanged.
//!
//! The [`FaultTracer`] capability receives failures that would otherwise be
//! invisible: a panic inside a lane task, a decode error on the channel
//! read path, an unmatched wire reply. The default [`TracingFaultTracer`]
//! forwards them to `tracing`.

use serde::{Deserialize, Serialize};

/// Failure value carried by completions and wire error replies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum Fault {
    /// The operation was cancelled before it resolved.
    #[error("cancelled")]
    Cancelled,

    /// The target stand-in was terminated before the invocation ran.
    #[error("terminated")]
    Terminated,

    /// A reply slot was dropped without being resolved.
    #[error("reply abandoned")]
    Abandoned,

    /// The underlying channel became inactive before the reply arrived.
    #[error("channel inactive")]
    ChannelInactive,

    /// The remote side reported an application error.
    #[error("remote fault: {message}")]
    Remote {
        /// Remote-supplied description of the failure.
        message: String,
    },

    /// A payload could not be decoded.
    #[error("decode failed: {message}")]
    Decode {
        /// Details about the decode failure.
        message: String,
    },

    /// A task or continuation panicked.
    #[error("panicked: {message}")]
    Panicked {
        /// Panic payload rendered as a string.
        message: String,
    },

    /// Any other failure.
    #[error("{message}")]
    Other {
        /// Description of the failure.
        message: String,
    },
}

impl Fault {
    /// Build a [`Fault::Remote`] from anything displayable.
    pub fn remote(message: impl std::fmt::Display) -> Self {
        Fault::Remote {
            message: message.to_string(),
        }
    }

    /// Build a [`Fault::Decode`] from anything displayable.
    pub fn decode(message: impl std::fmt::Display) -> Self {
        Fault::Decode {
            message: message.to_string(),
        }
    }

    /// Build a [`Fault::Other`] from anything displayable.
    pub fn other(message: impl std::fmt::Display) -> Self {
        Fault::Other {
            message: message.to_string(),
        }
    }

    /// Build a [`Fault::Panicked`] from a panic payload.
    ///
    /// Extracts the conventional `&str`/`String` payloads; anything else is
    /// rendered as an opaque marker.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault::Panicked { message }
    }
}

/// Where a recorded fault surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A lane task panicked with no completion to carry the failure.
    LaneTask,

    /// A continuation failed after its derived completion already carried
    /// the failure onward.
    Observer,

    /// The channel read or write path failed.
    Channel,

    /// A wire reply arrived that no pending correlation matched.
    UnmatchedReply,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Disposition::LaneTask => "lane-task",
            Disposition::Observer => "observer",
            Disposition::Channel => "channel",
            Disposition::UnmatchedReply => "unmatched-reply",
        };
        f.write_str(name)
    }
}

/// Process-wide sink for failures nobody is waiting on.
///
/// Implementations must be cheap and non-blocking; they are called from
/// lane workers and I/O threads.
pub trait FaultTracer: Send + Sync {
    /// Record a fault together with where it surfaced.
    fn record(&self, disposition: Disposition, fault: &Fault);
}

/// Default tracer forwarding every fault to `tracing::error!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFaultTracer;

impl FaultTracer for TracingFaultTracer {
    fn record(&self, disposition: Disposition, fault: &Fault) {
        tracing::error!(%disposition, %fault, "unhandled fault");
    }
}
