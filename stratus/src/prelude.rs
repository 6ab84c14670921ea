//! Common imports for the stratus runtime.
//!
//! This module provides a convenient prelude for importing the types most
//! component code touches.

pub use stratus_core::{DataCodec, Fault, FaultTracer, JsonCodec, Reference};
pub use stratus_dispatch::{
    Chain, Completion, Dispatcher, DispatcherConfig, Handler, Invocation, Lane, MethodId, Reply,
    StandIn,
};
pub use stratus_transport::{
    CallInputs, Channel, ChannelConfig, Endpoint, PendingTable, RoleId, SessionId, SessionObserver,
};

// Re-export commonly used external types
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use std::time::Duration;
