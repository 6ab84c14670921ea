//! # stratus
//!
//! Middleware runtime for cloud-service components communicating through
//! asynchronous, callback-style remote calls.
//!
//! This crate re-exports the full public API of the runtime:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              stratus (this crate)                           │
//! │        Re-exports the full API + prelude                    │
//! ├──────────────────────────┬──────────────────────────────────┤
//! │  stratus-transport       │   stratus-dispatch               │
//! │  • Wire framing          │   • Lanes + worker pool          │
//! │  • Channel + transports  │   • Completions + observers      │
//! │  • Endpoint (call/cast)  │   • Stand-ins + handlers         │
//! │  • Correlation table     │   • Dispatcher lifecycle         │
//! ├──────────────────────────┴──────────────────────────────────┤
//! │                     stratus-core                            │
//! │    Reference, DataCodec/JsonCodec, Fault, FaultTracer       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use stratus::prelude::*;
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::default());
//! dispatcher.initialize(Duration::from_secs(1))?;
//!
//! // Wire two endpoints together in-process.
//! let (left, right) = stratus::pipe_pair(64 * 1024);
//! let caller = Endpoint::open(
//!     left,
//!     RoleId::new("connector"),
//!     JsonCodec,
//!     &dispatcher,
//!     ChannelConfig::default(),
//! )?;
//! # let _ = (caller, right);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod prelude;

// Core re-exports
pub use stratus_core::{
    CodecError, DataCodec, Disposition, Fault, FaultTracer, JsonCodec, Reference,
    TracingFaultTracer,
};

// Dispatch re-exports
pub use stratus_dispatch::{
    Args, Chain, Completion, DispatchError, Dispatcher, DispatcherConfig, Handler, Invocation,
    Lane, MethodId, Reply, StandIn,
};

// Transport re-exports
pub use stratus_transport::{
    pipe_pair, CallInputs, Channel, ChannelConfig, ChannelError, ChannelObserver, ChannelTransport,
    CloseHook, CloseReason, Endpoint, EndpointError, Envelope, EnvelopeCodec, Frame, FrameCodec,
    FrameError, Head, MessageClass, Payload, PendingError, PendingTable, PipeEnd, Resolution,
    RoleId, SessionId, SessionObserver,
};
