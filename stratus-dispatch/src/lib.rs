//! # stratus-dispatch
//!
//! The callback-dispatch engine of the stratus runtime.
//!
//! This crate provides:
//! - **[`Lane`]**: serialized execution contexts with in-order,
//!   non-overlapping task execution per lane, unlimited lanes in parallel
//! - **[`Completion`]**: single-assignment futures with observer chaining
//! - **[`StandIn`]**: deferred-invocation proxies bound to handlers on
//!   chosen lanes
//! - **[`Dispatcher`]**: the reactor owning the worker pool and every
//!   lane/stand-in lifecycle

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod completion;
mod dispatcher;
mod error;
mod lane;
mod pool;
mod standin;

// Completion exports
pub use completion::{Chain, Completion};

// Lane exports
pub use lane::Lane;

// Dispatcher exports
pub use dispatcher::{Dispatcher, DispatcherConfig};

// Stand-in exports
pub use standin::{Args, Handler, Invocation, MethodId, Reply, StandIn};

// Error exports
pub use error::DispatchError;
