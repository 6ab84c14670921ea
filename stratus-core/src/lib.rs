//! # stratus-core
//!
//! Core abstractions shared by every layer of the stratus runtime.
//!
//! This crate provides the leaf types and capability traits the dispatch
//! engine and the transport build on:
//!
//! - [`Reference`]: 128-bit caller-minted correlation identifier
//! - [`DataCodec`]: pluggable typed-payload serialization with a default
//!   [`JsonCodec`]
//! - [`Fault`]: the failure value carried by completions and wire replies
//! - [`FaultTracer`]: process-wide sink for failures nobody is waiting on

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod codec;
mod fault;
mod reference;

// Codec exports
pub use codec::{CodecError, DataCodec, JsonCodec};

// Fault exports
pub use fault::{Disposition, Fault, FaultTracer, TracingFaultTracer};

// Core type exports
pub use reference::Reference;
