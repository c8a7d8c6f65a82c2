//! Splash: a distributed build cluster controller.
//!
//! Brokers workstation/worker traffic over a length-prefixed framed TCP
//! protocol (`splash_proto`), hosting a content-addressed object cache, a
//! toolchain registry, an incremental build graph, and a per-worker job
//! scheduler. See the `session` module for the protocol state machines
//! that tie these together.

pub mod cache;
pub mod config;
pub mod errors;
pub mod flags;
pub mod graph;
pub mod ids;
pub mod job;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod toolchain;
pub mod workingcopy;

pub use errors::{Error, ErrorKind, Result};
