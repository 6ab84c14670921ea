//! Error types for the dispatch engine.

use std::time::Duration;

/// Errors reported by lanes, stand-ins, and the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The lane no longer accepts submissions.
    #[error("lane {lane} closed")]
    LaneClosed {
        /// Identifier of the closed lane.
        lane: u64,
    },

    /// Bind was called on a bound stand-in without rebind intent.
    #[error("stand-in {stand_in} already bound")]
    AlreadyBound {
        /// Identifier of the stand-in.
        stand_in: u64,
    },

    /// The stand-in was terminated.
    #[error("stand-in {stand_in} terminated")]
    Terminated {
        /// Identifier of the stand-in.
        stand_in: u64,
    },

    /// Initialize was called twice.
    #[error("dispatcher already running")]
    AlreadyRunning,

    /// The dispatcher is shutting down or destroyed.
    #[error("dispatcher shutting down")]
    ShuttingDown,

    /// A worker thread could not be spawned.
    #[error("worker spawn failed: {message}")]
    WorkerSpawn {
        /// Details from the OS.
        message: String,
    },

    /// Workers did not report startup within the deadline.
    #[error("workers not started within {waited:?}")]
    WorkerStartTimeout {
        /// How long initialization waited.
        waited: Duration,
    },
}
